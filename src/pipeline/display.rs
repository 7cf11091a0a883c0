//! 显示观察者
//! Display observer
//!
//! 从保留槽位读最近处理完的帧, 节奏与流水线游标解耦. 真正的
//! 渲染/叠加在画面外部做, 这里维护观察者侧的状态并定期报告.
//! 所有通知都是发后即忘, 本 actor 从不应答

use std::path::PathBuf;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::actor::{Actor, Context};
use crate::pipeline::{ItemView, LineView, ObserverEvent};
use crate::shm::{FrameRing, FrameShape};

pub struct Display {
    camera: String,
    ring_path: PathBuf,
    shape: FrameShape,
    slots: usize,

    ring: Option<FrameRing>,
    items: Vec<ItemView>,
    lines: Vec<LineView>,
    frames_shown: u64,
    last_report: Instant,
}

/// 观察者消息就是观察者事件 (ObserverHandle 经 From 投递)
pub struct DisplayMsg(pub ObserverEvent);

impl From<ObserverEvent> for DisplayMsg {
    fn from(event: ObserverEvent) -> Self {
        DisplayMsg(event)
    }
}

impl Display {
    pub fn new(camera: &str, ring_path: PathBuf, shape: FrameShape, slots: usize) -> Self {
        Self {
            camera: camera.to_string(),
            ring_path,
            shape,
            slots,
            ring: None,
            items: Vec::new(),
            lines: Vec::new(),
            frames_shown: 0,
            last_report: Instant::now(),
        }
    }
}

impl Actor for Display {
    type Msg = DisplayMsg;
    type Reply = ();

    fn initialize(&mut self, _ctx: &mut Context<Self>) {
        match FrameRing::open(&self.ring_path, self.shape, self.slots) {
            Ok(ring) => {
                self.ring = Some(ring);
                info!(camera = %self.camera, "display attached");
            }
            Err(e) => warn!(camera = %self.camera, error = %e, "display could not attach ring"),
        }
    }

    fn handle(&mut self, msg: DisplayMsg, _ctx: &mut Context<Self>) -> Option<()> {
        match msg.0 {
            ObserverEvent::BaseImage { .. } => {}
            ObserverEvent::OverlayBboxes { items } => self.items = items,
            ObserverEvent::AddLines { lines } => self.lines = lines,
            ObserverEvent::Display { seq } => {
                let Some(ring) = self.ring.as_ref() else {
                    return None;
                };
                // 读保留槽位, 不碰循环游标
                match ring.read_last() {
                    Ok(Some((retained_seq, _frame))) => {
                        self.frames_shown += 1;
                        debug!(
                            camera = %self.camera,
                            seq,
                            retained_seq,
                            items = self.items.len(),
                            "frame displayed"
                        );
                    }
                    Ok(None) => debug!(camera = %self.camera, "nothing retained yet"),
                    Err(e) => warn!(camera = %self.camera, error = %e, "retained read failed"),
                }

                if self.last_report.elapsed().as_secs() >= 10 {
                    self.last_report = Instant::now();
                    let counts: Vec<String> = self
                        .lines
                        .iter()
                        .map(|l| format!("{}: {}/{}", l.name, l.counters.0, l.counters.1))
                        .collect();
                    info!(
                        camera = %self.camera,
                        frames = self.frames_shown,
                        items = self.items.len(),
                        lines = %counts.join(", "),
                        "display status"
                    );
                }
            }
        }
        None
    }
}
