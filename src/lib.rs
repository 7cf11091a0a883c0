#![allow(clippy::type_complexity)]
pub mod actor; // 邮箱式 actor 运行时
pub mod config; // 系统与摄像头配置
pub mod flow; // 物品生命周期与过线计数
pub mod pipeline; // 每路摄像头的处理流水线
pub mod shm; // 共享内存帧/检测缓冲区

pub use crate::actor::{Actor, Addr, Context, Continuation, Host, Registry, Target};
pub use crate::config::{CameraConfig, LineConfig, SidePolarity, SystemConfig};
pub use crate::shm::{Detection, DetectionBoard, FrameRing, FrameShape};

pub fn gen_time_string(delimiter: &str) -> String {
    let t_now = chrono::Local::now();
    let fmt = format!(
        "%Y{}%m{}%d{}%H{}%M{}%S",
        delimiter, delimiter, delimiter, delimiter, delimiter
    );
    t_now.format(&fmt).to_string()
}

// ========== 基础几何类型 ==========

/// 二维点 (像素坐标, y 轴向下)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Point2 {
    x: i32,
    y: i32,
}

impl Point2 {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    pub fn x(&self) -> i32 {
        self.x
    }

    pub fn y(&self) -> i32 {
        self.y
    }
}

/// 检测/跟踪边界框 (对角两点表示)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Bbox {
    start_x: i32,
    start_y: i32,
    end_x: i32,
    end_y: i32,
}

impl Bbox {
    pub fn new(start_x: i32, start_y: i32, end_x: i32, end_y: i32) -> Self {
        Self {
            start_x,
            start_y,
            end_x,
            end_y,
        }
    }

    pub fn start_x(&self) -> i32 {
        self.start_x
    }

    pub fn start_y(&self) -> i32 {
        self.start_y
    }

    pub fn end_x(&self) -> i32 {
        self.end_x
    }

    pub fn end_y(&self) -> i32 {
        self.end_y
    }

    pub fn width(&self) -> i32 {
        self.end_x - self.start_x
    }

    pub fn height(&self) -> i32 {
        self.end_y - self.start_y
    }

    /// 左上角 (顶点)
    pub fn tl(&self) -> Point2 {
        Point2::new(self.start_x, self.start_y)
    }

    /// 右下角 (底点)
    pub fn br(&self) -> Point2 {
        Point2::new(self.end_x, self.end_y)
    }

    /// 中心点
    pub fn cxcy(&self) -> Point2 {
        Point2::new(
            (self.start_x + self.end_x) / 2,
            (self.start_y + self.end_y) / 2,
        )
    }

    pub fn area(&self) -> i64 {
        (self.width() as i64 + 1) * (self.height() as i64 + 1)
    }

    pub fn intersection_area(&self, another: &Bbox) -> i64 {
        let l = self.start_x.max(another.start_x) as i64;
        let r = (self.end_x.min(another.end_x)) as i64;
        let t = self.start_y.max(another.start_y) as i64;
        let b = (self.end_y.min(another.end_y)) as i64;
        (r - l + 1).max(0) * (b - t + 1).max(0)
    }

    pub fn union_area(&self, another: &Bbox) -> i64 {
        self.area() + another.area() - self.intersection_area(another)
    }

    pub fn iou(&self, another: &Bbox) -> f32 {
        let union = self.union_area(another);
        if union <= 0 {
            return 0.0;
        }
        self.intersection_area(another) as f32 / union as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let a = Bbox::new(10, 10, 50, 50);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        let a = Bbox::new(0, 0, 10, 10);
        let b = Bbox::new(100, 100, 120, 120);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn centroid_is_box_center() {
        let a = Bbox::new(10, 20, 30, 40);
        assert_eq!(a.cxcy(), Point2::new(20, 30));
    }
}
