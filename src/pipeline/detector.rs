//! 目标检测 actor
//! Object detection actor
//!
//! 职责: 收到 Detect 请求 → 从环形缓冲读帧 → 跑检测算法 →
//! 结果写进检测交换区 (先记录后计数) → 应答记录条数.
//! 应答消息本身就是"结果就绪"的信号, 管理器不用自旋轮询头部

use std::collections::HashMap;
use std::path::PathBuf;

use tracing::{info, warn};

use crate::actor::{Actor, Context};
use crate::shm::{detections::MAX_RECORDS, Detection, DetectionBoard, FrameRing, FrameShape};

// ========== 检测接口 (外部协作者) ==========

/// 检测模型的接口边界. 输入一帧原始字节, 输出检测记录
pub trait ObjectDetector: Send {
    fn detect(&mut self, camera: usize, frame: &[u8], shape: FrameShape) -> Vec<Detection>;
}

// ========== 消息 ==========

pub enum DetectorMsg {
    /// 挂载一路摄像头的帧环形缓冲
    Attach {
        camera: usize,
        ring_path: PathBuf,
        shape: FrameShape,
        slots: usize,
    },
    /// 对指定槽位的帧做一次检测 (请求模式, 应答记录条数)
    Detect { camera: usize, slot: usize, seq: u64 },
}

// ========== actor ==========

pub struct DetectorActor {
    detector: Box<dyn ObjectDetector>,
    board_path: PathBuf,
    cameras: usize,
    board: Option<DetectionBoard>,
    rings: HashMap<usize, FrameRing>,
}

impl DetectorActor {
    pub fn new(detector: Box<dyn ObjectDetector>, board_path: PathBuf, cameras: usize) -> Self {
        Self {
            detector,
            board_path,
            cameras,
            board: None,
            rings: HashMap::new(),
        }
    }
}

impl Actor for DetectorActor {
    type Msg = DetectorMsg;
    type Reply = usize;

    fn initialize(&mut self, _ctx: &mut Context<Self>) {
        match DetectionBoard::open(&self.board_path, self.cameras) {
            Ok(board) => {
                self.board = Some(board);
                info!("detector ready");
            }
            Err(e) => warn!(error = %e, "could not open detection board"),
        }
    }

    fn handle(&mut self, msg: DetectorMsg, _ctx: &mut Context<Self>) -> Option<usize> {
        match msg {
            DetectorMsg::Attach {
                camera,
                ring_path,
                shape,
                slots,
            } => {
                match FrameRing::open(&ring_path, shape, slots) {
                    Ok(ring) => {
                        self.rings.insert(camera, ring);
                    }
                    Err(e) => warn!(camera, error = %e, "could not attach camera ring"),
                }
                None
            }
            DetectorMsg::Detect { camera, slot, seq } => {
                // 失败也要应答, 否则管理器会停在 Detecting 阶段等一个
                // 永远不来的回包 (降级优于停摆)
                let Some(board) = self.board.as_mut() else {
                    warn!(camera, "detect without board");
                    return Some(0);
                };
                let Some(ring) = self.rings.get(&camera) else {
                    warn!(camera, "detect for unattached camera");
                    return Some(0);
                };

                let records = match ring.read(slot) {
                    Ok(Some((_s, frame))) => {
                        let shape = ring.shape();
                        let mut found = self.detector.detect(camera, frame, shape);
                        found.truncate(MAX_RECORDS);
                        found
                    }
                    Ok(None) => {
                        warn!(camera, slot, seq, "detect on freed slot");
                        Vec::new()
                    }
                    Err(e) => {
                        warn!(camera, slot, error = %e, "detect read failed");
                        Vec::new()
                    }
                };

                match board.write_records(camera, &records) {
                    Ok(count) => Some(count),
                    Err(e) => {
                        warn!(camera, error = %e, "could not publish detections");
                        Some(0)
                    }
                }
            }
        }
    }
}
