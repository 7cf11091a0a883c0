/// 共享内存交换区
/// Shared-memory exchange regions
///
/// 两块跨进程内存映射区域, 以 "先写负载后写头部 / 先读头部后读负载"
/// 的单写单读协议代替锁:
/// 1. FrameRing: 解码器 → 流水线/跟踪器/检测器 的帧环形缓冲
/// 2. DetectionBoard: 检测器 → 流水线 的检测结果交换块
pub mod detections;
pub mod frames;

pub use detections::{Detection, DetectionBoard};
pub use frames::{FrameRing, FrameShape};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShmError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame size mismatch: got {got} bytes, slot holds {expected}")]
    FrameSize { got: usize, expected: usize },

    #[error("slot index {index} out of range ({slots} slots + retained)")]
    IndexOutOfRange { index: usize, slots: usize },

    #[error("sequence number 0 is reserved for free slots")]
    ReservedSequence,

    #[error("mapped region too small: {len} bytes, need {need}")]
    RegionTooSmall { len: usize, need: usize },

    #[error("camera {camera} out of range ({cameras} cameras configured)")]
    CameraOutOfRange { camera: usize, cameras: usize },

    #[error("too many detection records: {count} (block holds {max})")]
    TooManyRecords { count: usize, max: usize },
}
