//! 视觉跟踪池 worker
//! Visual tracker pool worker
//!
//! 每个 worker 是池里的一个 actor, 可以同时为多路摄像头各自认领的
//! 物品做逐帧跟踪. 像素级跟踪算法在 VisualTracker 背后, 可替换.
//! UpdateAll 是请求模式消息: 管理器对全池广播后用回包数做屏障计数

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::actor::{Actor, Context};
use crate::pipeline::{TrackBatch, TrackUpdate};
use crate::shm::{FrameRing, FrameShape};
use crate::Bbox;

// ========== 跟踪器接口 (外部协作者) ==========

/// 单个物品的像素级跟踪器. confidence == -1 表示物品离开画面
pub trait VisualTracker: Send {
    fn start(&mut self, frame: &[u8], shape: FrameShape, bbox: Bbox);
    fn update(&mut self, frame: &[u8], shape: FrameShape) -> (f32, Bbox);
}

/// worker 为每个新物品生成一个跟踪器实例
pub type TrackerFactory = Arc<dyn Fn() -> Box<dyn VisualTracker> + Send + Sync>;

// ========== 消息 ==========

pub enum TrackerMsg {
    /// 挂载一路摄像头的帧环形缓冲
    Attach {
        camera: usize,
        ring_path: PathBuf,
        shape: FrameShape,
        slots: usize,
    },
    /// 认领一个新物品并在指定槽位的帧上初始化跟踪
    Start {
        camera: usize,
        slot: usize,
        item_id: u64,
        bbox: Bbox,
    },
    /// 在指定槽位的帧上更新本 worker 认领的该摄像头全部物品 (请求模式)
    UpdateAll { camera: usize, slot: usize, seq: u64 },
    /// 物品已被管理器剔除, 释放跟踪器实例
    Remove { camera: usize, item_id: u64 },
    /// 摄像头下线, 释放它的一切
    DropCamera { camera: usize },
}

// ========== worker ==========

pub struct TrackerWorker {
    id: usize,
    factory: TrackerFactory,
    rings: HashMap<usize, FrameRing>,
    tracked: HashMap<(usize, u64), Box<dyn VisualTracker>>,
}

impl TrackerWorker {
    pub fn new(id: usize, factory: TrackerFactory) -> Self {
        Self {
            id,
            factory,
            rings: HashMap::new(),
            tracked: HashMap::new(),
        }
    }

    fn update_all(&mut self, name: &str, camera: usize, slot: usize, seq: u64) -> TrackBatch {
        let mut batch = TrackBatch {
            tracker: name.to_string(),
            camera,
            seq,
            updates: Vec::new(),
        };

        let Some(ring) = self.rings.get(&camera) else {
            warn!(worker = self.id, camera, "update for unattached camera");
            return batch;
        };
        let frame = match ring.read(slot) {
            Ok(Some((_seq, frame))) => frame,
            Ok(None) => {
                // 槽位已被释放: 本轮空转, 物品位置保持不变
                debug!(worker = self.id, camera, slot, "slot already freed, skipping update");
                return batch;
            }
            Err(e) => {
                warn!(worker = self.id, camera, slot, error = %e, "slot read failed");
                return batch;
            }
        };
        let shape = ring.shape();

        for ((cam, item_id), tracker) in self.tracked.iter_mut() {
            if *cam != camera {
                continue;
            }
            let (confidence, bbox) = tracker.update(frame, shape);
            batch.updates.push(TrackUpdate {
                item_id: *item_id,
                confidence,
                bbox,
            });
        }
        batch
    }
}

impl Actor for TrackerWorker {
    type Msg = TrackerMsg;
    type Reply = TrackBatch;

    fn initialize(&mut self, _ctx: &mut Context<Self>) {
        info!(worker = self.id, "tracker worker started");
    }

    fn handle(&mut self, msg: TrackerMsg, ctx: &mut Context<Self>) -> Option<TrackBatch> {
        match msg {
            TrackerMsg::Attach {
                camera,
                ring_path,
                shape,
                slots,
            } => {
                match FrameRing::open(&ring_path, shape, slots) {
                    Ok(ring) => {
                        self.rings.insert(camera, ring);
                        info!(worker = self.id, camera, "camera attached");
                    }
                    Err(e) => {
                        warn!(worker = self.id, camera, error = %e, "could not attach camera ring")
                    }
                }
                None
            }
            TrackerMsg::Start {
                camera,
                slot,
                item_id,
                bbox,
            } => {
                let Some(ring) = self.rings.get(&camera) else {
                    warn!(worker = self.id, camera, "start for unattached camera");
                    return None;
                };
                match ring.read(slot) {
                    Ok(Some((_seq, frame))) => {
                        let shape = ring.shape();
                        let mut tracker = (self.factory)();
                        tracker.start(frame, shape, bbox);
                        debug!(worker = self.id, camera, item = item_id, "tracking started");
                        self.tracked.insert((camera, item_id), tracker);
                    }
                    Ok(None) => {
                        warn!(worker = self.id, camera, slot, "start on freed slot, item not claimed")
                    }
                    Err(e) => warn!(worker = self.id, camera, slot, error = %e, "start read failed"),
                }
                None
            }
            TrackerMsg::UpdateAll { camera, slot, seq } => {
                let name = ctx.name().to_string();
                Some(self.update_all(&name, camera, slot, seq))
            }
            TrackerMsg::Remove { camera, item_id } => {
                self.tracked.remove(&(camera, item_id));
                None
            }
            TrackerMsg::DropCamera { camera } => {
                self.tracked.retain(|(cam, _), _| *cam != camera);
                self.rings.remove(&camera);
                None
            }
        }
    }

    fn on_exit(&mut self, _ctx: &mut Context<Self>) {
        info!(worker = self.id, items = self.tracked.len(), "tracker worker stopped");
    }
}
