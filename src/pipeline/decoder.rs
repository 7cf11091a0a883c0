//! 视频解码 actor
//! Video decoder actor
//!
//! 职责: 按 DrumBeat 节拍向帧源要下一帧 → 写进共享内存环形缓冲
//! → 通知监听者. 抓帧失败走重开重试, 流水线只看到游标停顿.
//! 真正的编解码在 FrameSource 背后, 可替换

use std::path::PathBuf;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::actor::{Actor, Context};
use crate::config::CameraConfig;
use crate::pipeline::drum_beat::DrumBeat;
use crate::pipeline::CameraInfo;
use crate::shm::{FrameRing, FrameShape};

// ========== 帧源接口 (外部协作者) ==========

/// 视频源/编解码器的接口边界. open 报告帧几何, grab 把一帧原始
/// 字节填进缓冲, 失败返回 false 由解码器安排 reopen
pub trait FrameSource: Send {
    fn open(&mut self) -> anyhow::Result<FrameShape>;
    fn grab(&mut self, out: &mut [u8]) -> bool;
    fn reopen(&mut self);
}

// ========== 消息 ==========

/// 新帧写入后对监听者的回调 (帧序号, 槽位)
pub struct FrameListener(pub Box<dyn Fn(u64, usize) + Send>);

pub enum DecoderMsg {
    /// DrumBeat 节拍: 抓下一帧
    CaptureNext,
    /// 握手: 监听者登记并取回挂载环形缓冲所需的信息
    AddListener(FrameListener),
    /// 流水线回报的每帧处理均值 (毫秒), 用于源头丢帧决策
    ManageBuffer { processing_avg_ms: f64 },
}

// ========== 解码器 ==========

pub struct VideoDecoder {
    cfg: CameraConfig,
    shm_dir: PathBuf,
    beat_ms: u64,

    source: Box<dyn FrameSource>,
    ring: Option<FrameRing>,
    shape: Option<FrameShape>,
    ring_path: PathBuf,

    frame_number: u64,
    scratch: Vec<u8>,
    // drop_on_full = false 时没写进去的帧按在手里, 下一拍重试
    pending: Option<u64>,
    listeners: Vec<FrameListener>,

    // 采集速度统计与源头丢帧
    init_time: Instant,
    capture_avg_ms: Option<f64>,
    drop_every: Option<u64>,
}

impl VideoDecoder {
    pub fn new(
        cfg: CameraConfig,
        shm_dir: &str,
        beat_ms: u64,
        source: Box<dyn FrameSource>,
    ) -> Self {
        let ring_path = PathBuf::from(shm_dir).join(format!("{}.frames", cfg.name));
        Self {
            cfg,
            shm_dir: PathBuf::from(shm_dir),
            beat_ms,
            source,
            ring: None,
            shape: None,
            ring_path,
            frame_number: 0,
            scratch: Vec::new(),
            pending: None,
            listeners: Vec::new(),
            init_time: Instant::now(),
            capture_avg_ms: None,
            drop_every: None,
        }
    }

    pub fn info(&self) -> Option<CameraInfo> {
        let shape = self.shape?;
        Some(CameraInfo {
            ring_path: self.ring_path.clone(),
            shape,
            slots: self.cfg.ring_slots,
            width: shape.width as u32,
            height: shape.height as u32,
        })
    }

    fn capture(&mut self) {
        let Some(ring) = self.ring.as_mut() else {
            return;
        };

        // 上一帧还按在手里 (文件回放不丢帧): 先重试写入
        if let Some(seq) = self.pending {
            let slot = ring.write_index();
            match ring.write(&self.scratch, seq) {
                Ok(0) => return, // 槽位仍被占, 继续等
                Ok(_) => {
                    self.pending = None;
                    for l in &self.listeners {
                        (l.0)(seq, slot);
                    }
                }
                Err(e) => {
                    warn!(camera = %self.cfg.name, error = %e, "held frame write failed");
                    self.pending = None;
                }
            }
            return;
        }

        if !self.source.grab(&mut self.scratch) {
            warn!(camera = %self.cfg.name, "could not grab video stream, reopening");
            self.source.reopen();
            return;
        }
        self.frame_number += 1;

        if self.frame_number % 100 == 0 {
            let avg = self.init_time.elapsed().as_secs_f64() * 1000.0 / 100.0;
            self.capture_avg_ms = Some(avg);
            self.init_time = Instant::now();
            debug!(camera = %self.cfg.name, avg_ms = avg, "capture average updated");
        }

        // 处理端落后太多时在源头按比例丢帧
        if let Some(n) = self.drop_every {
            if self.frame_number % n != 0 {
                return;
            }
        }

        let seq = self.frame_number;
        let slot = ring.write_index();
        match ring.write(&self.scratch, seq) {
            Ok(0) => {
                if self.cfg.drop_on_full {
                    debug!(camera = %self.cfg.name, seq, "ring full, frame dropped");
                } else {
                    self.pending = Some(seq);
                }
            }
            Ok(_) => {
                for l in &self.listeners {
                    (l.0)(seq, slot);
                }
            }
            Err(e) => warn!(camera = %self.cfg.name, error = %e, "frame write failed"),
        }
    }
}

impl Actor for VideoDecoder {
    type Msg = DecoderMsg;
    type Reply = CameraInfo;

    fn initialize(&mut self, ctx: &mut Context<Self>) {
        let shape = match self.source.open() {
            Ok(s) => s,
            Err(e) => {
                warn!(camera = %self.cfg.name, error = %e, "could not open video source");
                return;
            }
        };
        info!(
            camera = %self.cfg.name,
            width = shape.width,
            height = shape.height,
            "decoding started"
        );

        if let Err(e) = std::fs::create_dir_all(&self.shm_dir) {
            warn!(camera = %self.cfg.name, error = %e, "could not create shm dir");
            return;
        }
        match FrameRing::create(&self.ring_path, shape, self.cfg.ring_slots) {
            Ok(ring) => {
                self.scratch = vec![0u8; shape.frame_size()];
                self.shape = Some(shape);
                self.ring = Some(ring);
            }
            Err(e) => {
                warn!(camera = %self.cfg.name, error = %e, "could not create frame ring");
                return;
            }
        }

        // 节拍器敲起来, 每一拍回来一个 CaptureNext
        let beat = DrumBeat::new(&self.cfg.name, self.beat_ms, ctx.addr());
        ctx.spawn_child(&format!("{}_beat", self.cfg.name), beat);
    }

    fn handle(&mut self, msg: DecoderMsg, _ctx: &mut Context<Self>) -> Option<CameraInfo> {
        match msg {
            DecoderMsg::CaptureNext => {
                self.capture();
                None
            }
            DecoderMsg::AddListener(listener) => {
                self.listeners.push(listener);
                // 应答挂载信息 (请求模式下由运行时送回)
                match self.info() {
                    Some(info) => Some(info),
                    None => {
                        warn!(camera = %self.cfg.name, "listener added before source opened");
                        None
                    }
                }
            }
            DecoderMsg::ManageBuffer { processing_avg_ms } => {
                if let Some(capture_avg) = self.capture_avg_ms {
                    let per_diff = (processing_avg_ms / capture_avg).ceil() as u64;
                    if per_diff > 2 {
                        info!(camera = %self.cfg.name, per_diff, "processing lags capture, dropping at source");
                        self.drop_every = Some(per_diff);
                    } else {
                        self.drop_every = None;
                    }
                }
                None
            }
        }
    }

    fn on_exit(&mut self, _ctx: &mut Context<Self>) {
        info!(camera = %self.cfg.name, frames = self.frame_number, "decoder stopped");
    }
}
