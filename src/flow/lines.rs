//! 线段几何与计数线状态
//! Line geometry and counting-line state
//!
//! 所有几何判定在 i64 上用 checked 运算完成; 溢出不抛错,
//! 返回"无法判定", 调用方退回上一次已知的侧别

use crate::config::{LineConfig, SidePolarity};
use crate::Point2;

// ========== 几何判定 ==========

/// 点在有向线段 (a → b) 的哪一侧. Some(true) = 叉积为正的一侧.
/// 溢出时返回 None (无法判定)
pub fn point_side(a: Point2, b: Point2, p: Point2) -> Option<bool> {
    let cross = checked_cross(a, b, p)?;
    Some(cross > 0)
}

fn checked_cross(a: Point2, b: Point2, p: Point2) -> Option<i64> {
    let abx = (b.x() as i64).checked_sub(a.x() as i64)?;
    let aby = (b.y() as i64).checked_sub(a.y() as i64)?;
    let apx = (p.x() as i64).checked_sub(a.x() as i64)?;
    let apy = (p.y() as i64).checked_sub(a.y() as i64)?;
    abx.checked_mul(apy)?.checked_sub(aby.checked_mul(apx)?)
}

fn ccw(a: Point2, b: Point2, c: Point2) -> Option<bool> {
    Some(checked_cross(a, b, c)? > 0)
}

/// 线段 (p1, p2) 与 (q1, q2) 是否相交. 溢出时 None
pub fn segments_intersect(p1: Point2, p2: Point2, q1: Point2, q2: Point2) -> Option<bool> {
    let d1 = ccw(q1, q2, p1)?;
    let d2 = ccw(q1, q2, p2)?;
    let d3 = ccw(p1, p2, q1)?;
    let d4 = ccw(p1, p2, q2)?;
    Some(d1 != d2 && d3 != d4)
}

// ========== 计数线 ==========

/// 一条配置线在运行期的形态: 端点, 有效侧约定, 两个方向计数器
#[derive(Debug, Clone)]
pub struct LineSpec {
    pub name: String,
    pub first: Point2,
    pub second: Point2,
    pub side1: SidePolarity,
    pub count_splits: bool,
    pub label1_text: String,
    pub label1_id: u32,
    pub label2_text: String,
    pub label2_id: u32,

    // 两个方向的累计值. 进入/离开到哪个计数器由 side1 约定映射
    counter1: u64,
    counter2: u64,
}

impl LineSpec {
    pub fn from_config(cfg: &LineConfig) -> Self {
        let ep = cfg.end_points;
        Self {
            name: cfg.name.clone(),
            first: Point2::new(ep[0], ep[1]),
            second: Point2::new(ep[2], ep[3]),
            side1: cfg.side1,
            count_splits: cfg.count_splits,
            label1_text: cfg.label1_text.clone(),
            label1_id: cfg.label1_id,
            label2_text: cfg.label2_text.clone(),
            label2_id: cfg.label2_id,
            counter1: 0,
            counter2: 0,
        }
    }

    /// 点相对本线的侧别
    pub fn side_of(&self, p: Point2) -> Option<bool> {
        point_side(self.first, self.second, p)
    }

    /// 点的移动轨迹 (from → to) 是否穿过本线
    pub fn crossed_by(&self, from: Point2, to: Point2) -> Option<bool> {
        segments_intersect(from, to, self.first, self.second)
    }

    /// 该侧别是否落在配置的有效 (进入合法) 一侧
    pub fn is_valid_side(&self, side: bool) -> bool {
        match self.side1 {
            SidePolarity::Positive => side,
            SidePolarity::Negative => !side,
        }
    }

    /// 进入方向 +1 (side1 = Negative 时进入记在 counter1, 否则 counter2)
    pub fn bump_enter(&mut self) {
        match self.side1 {
            SidePolarity::Negative => self.counter1 += 1,
            SidePolarity::Positive => self.counter2 += 1,
        }
    }

    /// 离开方向 +1
    pub fn bump_exit(&mut self) {
        match self.side1 {
            SidePolarity::Negative => self.counter2 += 1,
            SidePolarity::Positive => self.counter1 += 1,
        }
    }

    pub fn counters(&self) -> (u64, u64) {
        (self.counter1, self.counter2)
    }

    pub fn reset_counters(&mut self) {
        self.counter1 = 0;
        self.counter2 = 0;
    }
}

// ========== 每物品每线的过线状态 ==========

/// 某个物品相对某条计数线的记忆
#[derive(Debug, Clone)]
pub struct LineState {
    /// 顶点上一次的侧别 (None = 还没观测过)
    pub top: Option<bool>,
    /// 底点上一次的侧别
    pub bottom: Option<bool>,
    /// 创建时两角点分跨线两侧, 且尚未为此过线计过数
    pub split: bool,
    pub counted: bool,
    pub counted_frame: u64,
    /// 上一次观测到的两个角点 (轨迹线段的起点)
    pub top_point: Point2,
    pub bottom_point: Point2,
}

impl LineState {
    pub fn new(top_point: Point2, bottom_point: Point2) -> Self {
        Self {
            top: None,
            bottom: None,
            split: false,
            counted: false,
            counted_frame: 0,
            top_point,
            bottom_point,
        }
    }

    /// 冷却窗之外允许再次计数; 通过即登记本次计数并解除骑线标记
    pub fn should_count(&mut self, frame: u64, cooldown: u64) -> bool {
        if !self.counted || frame > self.counted_frame + cooldown {
            self.split = false;
            self.counted = true;
            self.counted_frame = frame;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SidePolarity;

    fn horizontal_line() -> LineSpec {
        LineSpec::from_config(&LineConfig {
            name: "door".to_string(),
            end_points: [0, 100, 200, 100],
            side1: SidePolarity::Negative,
            count_splits: true,
            label1_text: String::new(),
            label1_id: 0,
            label2_text: String::new(),
            label2_id: 0,
        })
    }

    #[test]
    fn points_above_and_below_get_opposite_sides() {
        let line = horizontal_line();
        let above = line.side_of(Point2::new(50, 40)).unwrap();
        let below = line.side_of(Point2::new(50, 160)).unwrap();
        assert_ne!(above, below);
    }

    #[test]
    fn collinear_point_is_not_positive_side() {
        let line = horizontal_line();
        // 叉积为 0: 归入"非正"侧, 连续两帧判定一致即可
        assert_eq!(line.side_of(Point2::new(50, 100)), Some(false));
    }

    #[test]
    fn trajectory_through_the_line_intersects() {
        let line = horizontal_line();
        assert_eq!(
            line.crossed_by(Point2::new(50, 60), Point2::new(50, 140)),
            Some(true)
        );
        assert_eq!(
            line.crossed_by(Point2::new(50, 60), Point2::new(50, 80)),
            Some(false)
        );
    }

    // 溢出退化为"无法判定", 不 panic
    #[test]
    fn overflow_yields_indeterminate() {
        let a = Point2::new(i32::MIN, i32::MIN);
        let b = Point2::new(i32::MAX, i32::MAX);
        let p = Point2::new(i32::MAX, i32::MIN);
        // 大坐标下 checked 运算可能放弃; 只要不 panic 且返回合法值即可
        let _ = point_side(a, b, p);
        let _ = segments_intersect(a, b, p, a);
    }

    #[test]
    fn enter_exit_map_to_side_convention() {
        let mut negative = horizontal_line();
        negative.bump_enter();
        negative.bump_exit();
        negative.bump_exit();
        assert_eq!(negative.counters(), (1, 2));

        let mut positive = horizontal_line();
        positive.side1 = SidePolarity::Positive;
        positive.bump_enter();
        assert_eq!(positive.counters(), (0, 1));
    }

    #[test]
    fn cooldown_blocks_recount_until_window_passes() {
        let mut state = LineState::new(Point2::new(0, 0), Point2::new(0, 0));
        assert!(state.should_count(100, 30));
        assert!(!state.should_count(110, 30));
        assert!(state.should_count(131, 30));
    }
}
