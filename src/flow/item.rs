//! 被跟踪物品
//! Tracked item
//!
//! 物品在一路摄像头内拿到单调递增的 id, 每帧由跟踪器刷新边界框,
//! 每个检测周期可能被新检测框刷新. 质心历史推导粗粒度运动方向,
//! 位移低于阈值时记录失速帧用于消失判定

use std::collections::{HashMap, VecDeque};

use crate::flow::lines::LineState;
use crate::{Bbox, Point2};

/// 质心历史容量
const CENTROID_HISTORY: usize = 32;

/// 方向判定回看的样本数
const DIRECTION_LOOKBACK: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Horizontal {
    East,
    West,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vertical {
    North,
    South,
}

/// 粗粒度运动方向 (东西/南北可独立存在或组合)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Direction {
    pub horizontal: Option<Horizontal>,
    pub vertical: Option<Vertical>,
}

impl Direction {
    pub fn is_set(&self) -> bool {
        self.horizontal.is_some() || self.vertical.is_some()
    }
}

pub struct Item {
    pub id: u64,
    pub bbox: Bbox,
    pub class_id: u16,
    pub confidence: f32,

    /// 首次/最近被观测到的帧号
    pub first_frame: u64,
    pub last_frame: u64,

    /// 0 = 在动; 非 0 = 从该帧起位移一直低于阈值
    pub last_motion_frame: u64,

    pub disappeared: bool,

    /// 负责跟踪本物品的跟踪器名字
    pub tracker: Option<String>,

    pub direction: Direction,

    // 最新的在前, 容量固定, 旧样本被挤出
    centroids: VecDeque<Point2>,

    /// 每条计数线一份过线记忆
    pub lines: HashMap<String, LineState>,
}

impl Item {
    pub fn new(id: u64, bbox: Bbox, class_id: u16, confidence: f32, frame: u64) -> Self {
        let mut item = Self {
            id,
            bbox,
            class_id,
            confidence,
            first_frame: frame,
            last_frame: frame,
            last_motion_frame: 0,
            disappeared: false,
            tracker: None,
            direction: Direction::default(),
            centroids: VecDeque::with_capacity(CENTROID_HISTORY),
            lines: HashMap::new(),
        };
        item.push_centroid();
        item
    }

    /// 为一条计数线登记初始过线状态
    pub fn init_line(&mut self, name: &str) {
        self.lines
            .insert(name.to_string(), LineState::new(self.bbox.tl(), self.bbox.br()));
    }

    pub fn centroid(&self) -> Point2 {
        self.bbox.cxcy()
    }

    pub fn centroid_history(&self) -> &VecDeque<Point2> {
        &self.centroids
    }

    fn push_centroid(&mut self) {
        if self.centroids.len() == CENTROID_HISTORY {
            self.centroids.pop_back();
        }
        self.centroids.push_front(self.centroid());
    }

    /// 跟踪器给出的新位置
    pub fn tracker_update(
        &mut self,
        frame: u64,
        confidence: f32,
        bbox: Bbox,
        direction_threshold: i32,
    ) {
        self.confidence = confidence;
        self.apply_box(frame, bbox, direction_threshold);
    }

    /// 检测周期匹配命中时用检测框刷新
    pub fn detection_update(
        &mut self,
        frame: u64,
        confidence: f32,
        class_id: u16,
        bbox: Bbox,
        direction_threshold: i32,
    ) {
        self.confidence = confidence;
        self.class_id = class_id;
        self.apply_box(frame, bbox, direction_threshold);
    }

    fn apply_box(&mut self, frame: u64, bbox: Bbox, direction_threshold: i32) {
        self.bbox = bbox;
        self.last_frame = frame;
        self.push_centroid();
        self.derive_direction(frame, direction_threshold);
    }

    // 位移取最新质心与第 DIRECTION_LOOKBACK 个历史质心之差,
    // 低于阈值的轴不给方向 (噪声), 两轴都低于阈值记为失速
    fn derive_direction(&mut self, frame: u64, threshold: i32) {
        if self.centroids.len() <= DIRECTION_LOOKBACK {
            return;
        }
        let newest = self.centroids[0];
        let oldest = self.centroids[DIRECTION_LOOKBACK];
        let dx = newest.x() - oldest.x();
        let dy = newest.y() - oldest.y();

        if dx.abs() >= threshold {
            self.direction.horizontal = Some(if dx > 0 {
                Horizontal::East
            } else {
                Horizontal::West
            });
        }
        if dy.abs() >= threshold {
            self.direction.vertical = Some(if dy > 0 {
                Vertical::South
            } else {
                Vertical::North
            });
        }

        if dx.abs() < threshold && dy.abs() < threshold {
            // 失速: 只记第一次停下来的帧
            if self.last_motion_frame == 0 {
                self.last_motion_frame = frame;
            }
        } else {
            self.last_motion_frame = 0;
        }
    }

    /// 已经静止了多少帧 (在动返回 0)
    pub fn stalled_for(&self, frame: u64) -> u64 {
        if self.last_motion_frame == 0 {
            0
        } else {
            frame.saturating_sub(self.last_motion_frame)
        }
    }
}
