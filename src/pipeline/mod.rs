/// 视频处理流水线 (Video Processing Pipeline)
///
/// 多 actor 架构, 通过邮箱消息通信, 大块帧数据走共享内存:
/// - MultiFlow:     总监, 每路摄像头雇一个 FlowManager
/// - FlowManager:   每帧状态机 (取帧 → 跟踪屏障 → 检测 → 对账 → 通知)
/// - VideoDecoder:  解码, 按 DrumBeat 节拍把帧写进环形缓冲
/// - TrackerWorker: 视觉跟踪池, 按帧更新各自认领的物品
/// - DetectorActor: 目标检测, 结果写进检测交换区后应答
/// - Display:       观察者, 从保留槽位读最近处理完的帧
pub mod decoder;
pub mod detector;
pub mod display;
pub mod drum_beat;
pub mod manager;
pub mod supervisor;
pub mod synthetic;
pub mod tracker;

use std::path::PathBuf;

use crate::actor::{Actor, Addr};
use crate::shm::FrameShape;
use crate::{Bbox, Point2};

// ========== 跨 actor 消息类型定义 ==========

/// 解码器握手应答 (解码器 → 管理器): 挂载环形缓冲所需的一切
#[derive(Clone, Debug)]
pub struct CameraInfo {
    pub ring_path: PathBuf,
    pub shape: FrameShape,
    pub slots: usize,
    pub width: u32,
    pub height: u32,
}

/// 单个物品的跟踪回报. confidence == -1 表示物品已离开画面
#[derive(Clone, Copy, Debug)]
pub struct TrackUpdate {
    pub item_id: u64,
    pub confidence: f32,
    pub bbox: Bbox,
}

/// "物品已离开画面" 哨兵
pub const TRACKER_LEFT: f32 = -1.0;

/// 一个跟踪器对一路摄像头的整批回报 (屏障计数的单位).
/// seq 回显请求的帧序号, 管理器以此识别迟到的旧屏障回包
#[derive(Clone, Debug)]
pub struct TrackBatch {
    pub tracker: String,
    pub camera: usize,
    pub seq: u64,
    pub updates: Vec<TrackUpdate>,
}

/// 观察者看到的物品快照
#[derive(Clone, Debug)]
pub struct ItemView {
    pub id: u64,
    pub bbox: Bbox,
    pub class_id: u16,
    pub confidence: f32,
}

/// 观察者看到的线段快照 (含两个方向的累计值)
#[derive(Clone, Debug)]
pub struct LineView {
    pub name: String,
    pub first: Point2,
    pub second: Point2,
    pub counters: (u64, u64),
}

/// 每帧推送给观察者的通知 (全部发后即忘, 不期待应答)
#[derive(Clone, Debug)]
pub enum ObserverEvent {
    /// 新处理完的帧落在哪个槽位
    BaseImage { seq: u64, slot: usize },
    OverlayBboxes { items: Vec<ItemView> },
    AddLines { lines: Vec<LineView> },
    Display { seq: u64 },
}

/// 类型擦除的观察者句柄: 任何消息类型能装下 ObserverEvent 的
/// actor 都可以登记为观察者
pub trait ObserverHandle: Send {
    fn notify(&self, event: ObserverEvent);
}

impl<A: Actor> ObserverHandle for Addr<A>
where
    A::Msg: From<ObserverEvent>,
{
    fn notify(&self, event: ObserverEvent) {
        self.tell(event.into());
    }
}

/// 管理器状态快照 (服务端点, 测试与 UI 共用)
#[derive(Clone, Debug)]
pub struct StatusReport {
    pub camera: String,
    pub frame_number: u64,
    pub items: Vec<ItemView>,
    pub lines: Vec<LineView>,
}
