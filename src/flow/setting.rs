//! 摄像头画面管理 (Setting)
//! Per-camera scene management
//!
//! 一路摄像头全部在跟物品的收容所: 检测框进场校验, 与既有物品的
//! 匹配, 新物品建档, 过线计数, 以及静止/重叠/出场的剔除.
//! 这里只做纯状态演算, 不碰邮箱和共享内存

use std::collections::{BTreeMap, HashSet};

use tracing::{debug, info};

use crate::config::{AnalyserConfig, LineConfig, MatchStrategy};
use crate::flow::item::{Item, Vertical};
use crate::flow::lines::LineSpec;
use crate::shm::Detection;
use crate::Bbox;

pub struct Setting {
    analyser: AnalyserConfig,
    entry_lines: Vec<LineSpec>,
    counting_lines: Vec<LineSpec>,

    // 下一个物品 id, 摄像头内单调递增
    next_item_id: u64,

    /// 在跟物品, 按 id 有序 (剔除的平局规则依赖创建顺序)
    pub items: BTreeMap<u64, Item>,
}

impl Setting {
    pub fn new(analyser: AnalyserConfig, entry: &[LineConfig], counting: &[LineConfig]) -> Self {
        Self {
            analyser,
            entry_lines: entry.iter().map(LineSpec::from_config).collect(),
            counting_lines: counting.iter().map(LineSpec::from_config).collect(),
            next_item_id: 1,
            items: BTreeMap::new(),
        }
    }

    pub fn analyser(&self) -> &AnalyserConfig {
        &self.analyser
    }

    pub fn entry_lines(&self) -> &[LineSpec] {
        &self.entry_lines
    }

    pub fn counting_lines(&self) -> &[LineSpec] {
        &self.counting_lines
    }

    pub fn counting_lines_mut(&mut self) -> &mut [LineSpec] {
        &mut self.counting_lines
    }

    // ========== 进出场判定 ==========

    /// 入口校验: 丢弃被入口线劈开的框和从无效侧出现的框.
    /// 纯函数 —— 线不变时重复校验结论不变
    pub fn validate_entry(&self, boxes: &[Bbox]) -> Vec<Bbox> {
        boxes
            .iter()
            .copied()
            .filter(|b| self.entry_allows(b))
            .collect()
    }

    fn entry_allows(&self, bbox: &Bbox) -> bool {
        for line in &self.entry_lines {
            // 溢出无法判定时与原点同侧处理 (保守拒收)
            let top = line.side_of(bbox.tl()).unwrap_or(false);
            let bottom = line.side_of(bbox.br()).unwrap_or(false);

            // 被入口线劈开: 不收
            if top != bottom {
                return false;
            }
            // 整体落在无效侧: 不收
            if !line.is_valid_side(top) {
                return false;
            }
        }
        true
    }

    /// 物品是否已穿出某条入口线 (两角点同侧且都在无效侧)
    pub fn check_exit(&self, bbox: &Bbox) -> bool {
        for line in &self.entry_lines {
            let (Some(top), Some(bottom)) = (line.side_of(bbox.tl()), line.side_of(bbox.br()))
            else {
                continue;
            };
            if top == bottom && !line.is_valid_side(top) {
                return true;
            }
        }
        false
    }

    // ========== 剔除 ==========

    /// 每帧开头的清理: 静止超时的物品, 以及与同方向物品重叠过高的
    /// 物品 (一对里后创建的那个被剔除). 返回被剔除的 id
    pub fn prune(&mut self, frame: u64) -> Vec<u64> {
        let mut doomed: HashSet<u64> = HashSet::new();

        for (id, item) in &self.items {
            if item.stalled_for(frame) > self.analyser.disappear_frames {
                debug!(item = id, "pruning stalled item");
                doomed.insert(*id);
            }
        }

        let ids: Vec<u64> = self.items.keys().copied().collect();
        for i in 0..ids.len() {
            for j in (i + 1)..ids.len() {
                let a = &self.items[&ids[i]];
                let b = &self.items[&ids[j]];
                if a.bbox.iou(&b.bbox) > self.analyser.drop_overlap && a.direction == b.direction {
                    debug!(kept = ids[i], dropped = ids[j], "pruning overlapping item");
                    doomed.insert(ids[j]);
                }
            }
        }

        let mut removed: Vec<u64> = doomed.into_iter().collect();
        removed.sort_unstable();
        for id in &removed {
            if let Some(mut item) = self.items.remove(id) {
                item.disappeared = true;
            }
        }
        removed
    }

    /// 物品出场 (跟踪器报 -1 或穿出边界). 返回它是否还在册
    pub fn remove_item(&mut self, id: u64) -> bool {
        self.items.remove(&id).is_some()
    }

    // ========== 检测对账 ==========

    /// 把一个检测周期的结果并入画面: 校验 → 匹配 → 建档.
    /// 返回新建物品的 id (调用方负责把它们分发给跟踪器)
    pub fn reconcile_detections(&mut self, detections: &[Detection], frame: u64) -> Vec<u64> {
        let mut new_ids = Vec::new();
        let mut claimed: HashSet<u64> = HashSet::new();

        for det in detections {
            let bbox = Bbox::new(det.bbox[0], det.bbox[1], det.bbox[2], det.bbox[3]);
            if !self.entry_allows(&bbox) {
                continue;
            }

            match self.match_existing(&bbox, &claimed) {
                Some(id) => {
                    claimed.insert(id);
                    let threshold = self.analyser.direction_threshold;
                    if let Some(item) = self.items.get_mut(&id) {
                        item.detection_update(frame, det.confidence, det.class_id, bbox, threshold);
                    }
                }
                None => {
                    let id = self.next_item_id;
                    self.next_item_id += 1;

                    let mut item = Item::new(id, bbox, det.class_id, det.confidence, frame);
                    for line in &self.counting_lines {
                        item.init_line(&line.name);
                    }
                    info!(item = id, class = det.class_id, "new item admitted");
                    claimed.insert(id);
                    self.items.insert(id, item);
                    new_ids.push(id);
                }
            }
        }
        new_ids
    }

    // 两种可互换的匹配策略, 已被本周期认领过的物品不再参与
    fn match_existing(&self, bbox: &Bbox, claimed: &HashSet<u64>) -> Option<u64> {
        match self.analyser.match_strategy {
            MatchStrategy::Iou { threshold } => {
                let mut best: Option<(u64, f32)> = None;
                for (id, item) in &self.items {
                    if claimed.contains(id) {
                        continue;
                    }
                    let iou = item.bbox.iou(bbox);
                    if iou >= threshold && best.map_or(true, |(_, b)| iou > b) {
                        best = Some((*id, iou));
                    }
                }
                best.map(|(id, _)| id)
            }
            MatchStrategy::Centroid { max_distance } => {
                let limit = (max_distance as i64) * (max_distance as i64);
                let c = bbox.cxcy();
                let mut best: Option<(u64, i64)> = None;
                for (id, item) in &self.items {
                    if claimed.contains(id) {
                        continue;
                    }
                    let ic = item.centroid();
                    let dx = (ic.x() - c.x()) as i64;
                    let dy = (ic.y() - c.y()) as i64;
                    let d2 = dx * dx + dy * dy;
                    if d2 <= limit && best.map_or(true, |(_, b)| d2 < b) {
                        best = Some((*id, d2));
                    }
                }
                best.map(|(id, _)| id)
            }
        }
    }

    /// 跟踪屏障里收到的单个物品更新
    pub fn tracker_update(&mut self, frame: u64, id: u64, confidence: f32, bbox: Bbox) {
        let threshold = self.analyser.direction_threshold;
        // 跟踪开始之后物品可能已被剔除
        let Some(item) = self.items.get_mut(&id) else {
            return;
        };
        item.tracker_update(frame, confidence, bbox, threshold);
    }

    // ========== 过线计数 ==========

    /// 对每条计数线检查每个物品的角点换侧情况
    pub fn count_crossings(&mut self, frame: u64) {
        let cooldown = self.analyser.count_cooldown_frames;
        let mut lines = std::mem::take(&mut self.counting_lines);
        for line in &mut lines {
            for item in self.items.values_mut() {
                Self::count_item_line(item, line, frame, cooldown);
            }
        }
        self.counting_lines = lines;
    }

    fn count_item_line(item: &mut Item, line: &mut LineSpec, frame: u64, cooldown: u64) {
        let Some(state) = item.lines.get_mut(&line.name) else {
            return;
        };

        // 溢出无法判定时退回上一次已知侧别
        let Some(new_top) = line.side_of(item.bbox.tl()).or(state.top) else {
            return;
        };
        let Some(new_bottom) = line.side_of(item.bbox.br()).or(state.bottom) else {
            return;
        };

        if let Some(prev_bottom) = state.bottom {
            // 底点换侧 + 方向已判定 → 过线
            if prev_bottom != new_bottom
                && item.direction.is_set()
                && line.crossed_by(state.bottom_point, item.bbox.br()) == Some(true)
                && state.should_count(frame, cooldown)
            {
                if !new_bottom {
                    line.bump_enter();
                } else {
                    line.bump_exit();
                }
                debug!(item = item.id, line = %line.name, frame, "bottom corner crossed");
            }

            // 骑线物品向下运动时底点不会换侧, 等顶点过线再计
            if line.count_splits
                && state.split
                && item.direction.vertical == Some(Vertical::South)
                && state.top != Some(new_top)
                && line.crossed_by(state.top_point, item.bbox.tl()) == Some(true)
                && state.should_count(frame, cooldown)
            {
                if new_top {
                    line.bump_exit();
                }
                debug!(item = item.id, line = %line.name, frame, "top corner crossed (split)");
            }
        } else if new_top != new_bottom {
            // 创建当帧就骑在线上: 不计数, 挂起等前沿角点过线
            state.split = true;
        }

        state.top = Some(new_top);
        state.bottom = Some(new_bottom);
        state.top_point = item.bbox.tl();
        state.bottom_point = item.bbox.br();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LineConfig, SidePolarity};

    fn det(x1: i32, y1: i32, x2: i32, y2: i32) -> Detection {
        Detection {
            bbox: [x1, y1, x2, y2],
            confidence: 0.9,
            class_id: 0,
        }
    }

    fn line(name: &str, ep: [i32; 4], side1: SidePolarity, count_splits: bool) -> LineConfig {
        LineConfig {
            name: name.to_string(),
            end_points: ep,
            side1,
            count_splits,
            label1_text: String::new(),
            label1_id: 0,
            label2_text: String::new(),
            label2_id: 0,
        }
    }

    fn setting(entry: Vec<LineConfig>, counting: Vec<LineConfig>) -> Setting {
        Setting::new(AnalyserConfig::default(), &entry, &counting)
    }

    /// 让物品连续移动并每帧计数, 建立方向后穿越画面
    fn march(setting: &mut Setting, id: u64, mut bbox: Bbox, step: (i32, i32), frames: u64) {
        let start = setting.items[&id].last_frame;
        for i in 1..=frames {
            bbox = Bbox::new(
                bbox.start_x() + step.0,
                bbox.start_y() + step.1,
                bbox.end_x() + step.0,
                bbox.end_y() + step.1,
            );
            setting.tracker_update(start + i, id, 0.9, bbox);
            setting.count_crossings(start + i);
        }
    }

    // 两个过检的框, 无既有物品 → id 1 和 2, 物品表长度 2
    #[test]
    fn two_validated_boxes_become_items_one_and_two() {
        let mut s = setting(vec![], vec![]);
        let new_ids = s.reconcile_detections(&[det(10, 10, 50, 50), det(100, 100, 160, 180)], 1);
        assert_eq!(new_ids, vec![1, 2]);
        assert_eq!(s.items.len(), 2);
    }

    // 入口校验幂等: 同一批框重复校验结论一致
    #[test]
    fn entry_validation_is_idempotent() {
        let s = setting(
            vec![line("gate", [0, 50, 200, 50], SidePolarity::Positive, false)],
            vec![],
        );
        let boxes = [
            Bbox::new(10, 60, 50, 90),   // 有效侧整体进入
            Bbox::new(10, 40, 50, 60),   // 被入口线劈开
            Bbox::new(10, 10, 50, 40),   // 无效侧
        ];
        let first = s.validate_entry(&boxes);
        let second = s.validate_entry(&first);
        assert_eq!(first, vec![boxes[0]]);
        assert_eq!(first, second);
    }

    #[test]
    fn exit_is_detected_when_fully_outside() {
        let s = setting(
            vec![line("gate", [0, 50, 200, 50], SidePolarity::Positive, false)],
            vec![],
        );
        assert!(s.check_exit(&Bbox::new(10, 10, 50, 40))); // 全在无效侧
        assert!(!s.check_exit(&Bbox::new(10, 60, 50, 90))); // 全在有效侧
        assert!(!s.check_exit(&Bbox::new(10, 40, 50, 60))); // 骑线
    }

    // 底点换侧 → 恰好一个方向计数器 +1, 冷却窗内不得重复计数
    #[test]
    fn bottom_crossing_increments_exactly_one_counter() {
        let mut s = setting(
            vec![],
            vec![line("door", [0, 200, 400, 200], SidePolarity::Negative, false)],
        );
        let ids = s.reconcile_detections(&[det(100, 20, 140, 100)], 1);
        let id = ids[0];
        s.count_crossings(1);

        // 向下走 20 帧, 每帧 8 像素: 第 10 帧方向判为 South,
        // 第 13 帧底点穿过 y=200
        march(&mut s, id, Bbox::new(100, 20, 140, 100), (0, 8), 20);
        assert_eq!(s.counting_lines()[0].counters(), (0, 1));

        // 冷却窗内折返: 底点再次换侧但不计数
        let cur = s.items[&id].bbox;
        march(&mut s, id, cur, (0, -8), 10);
        assert_eq!(s.counting_lines()[0].counters(), (0, 1));
    }

    // 骑线新物品: 创建时不计数, 顶点过线时恰好计一次
    #[test]
    fn split_item_is_counted_once_on_top_crossing() {
        let mut s = setting(
            vec![],
            vec![line("door", [0, 100, 400, 100], SidePolarity::Negative, true)],
        );
        // 创建即骑线: 顶点 y=10 在线上方, 底点 y=140 在线下方
        let ids = s.reconcile_detections(&[det(100, 10, 140, 140)], 1);
        let id = ids[0];
        s.count_crossings(1);
        assert_eq!(s.counting_lines()[0].counters(), (0, 0));
        assert!(s.items[&id].lines["door"].split);

        // 向下走: 第 10 帧方向判为 South, 第 12 帧顶点穿过 y=100
        march(&mut s, id, Bbox::new(100, 10, 140, 140), (0, 8), 20);
        assert_eq!(s.counting_lines()[0].counters(), (0, 1));

        // 继续向下不再产生计数
        let cur = s.items[&id].bbox;
        march(&mut s, id, cur, (0, 8), 10);
        assert_eq!(s.counting_lines()[0].counters(), (0, 1));
    }

    // 角点始终同侧: 100 帧后计数器仍为 (0, 0)
    #[test]
    fn non_crossing_item_never_counts() {
        let mut s = setting(
            vec![],
            vec![line("edge", [0, 0, 100, 0], SidePolarity::Negative, false)],
        );
        let ids = s.reconcile_detections(&[det(10, 10, 50, 50)], 1);
        let id = ids[0];
        s.count_crossings(1);
        for f in 2..=101u64 {
            let wiggle = if f % 2 == 0 { 6 } else { -6 };
            let b = s.items[&id].bbox;
            s.tracker_update(
                f,
                id,
                0.9,
                Bbox::new(b.start_x() + wiggle, b.start_y(), b.end_x() + wiggle, b.end_y()),
            );
            s.count_crossings(f);
        }
        assert_eq!(s.counting_lines()[0].counters(), (0, 0));
    }

    // 同方向重叠: 后创建的物品被剔除
    #[test]
    fn overlapping_same_direction_item_is_pruned() {
        let mut s = setting(vec![], vec![]);
        let ids = s.reconcile_detections(&[det(100, 100, 160, 180)], 1);
        // 第二个物品在远处建档, 随后被跟踪器挪到第一个物品上
        let far = s.reconcile_detections(&[det(300, 300, 360, 380)], 2);
        let far_id = far[0];
        s.tracker_update(3, far_id, 0.9, Bbox::new(101, 101, 161, 181));

        let removed = s.prune(4);
        assert_eq!(removed, vec![far_id]);
        assert!(s.items.contains_key(&ids[0]));
    }

    // 静止超时的物品被剔除
    #[test]
    fn stalled_item_disappears_after_threshold() {
        let mut cfg = AnalyserConfig::default();
        cfg.disappear_frames = 20;
        let mut s = Setting::new(cfg, &[], &[]);
        let ids = s.reconcile_detections(&[det(100, 100, 160, 180)], 1);
        let id = ids[0];

        // 原地不动 15 帧触发失速, 再过 25 帧超时
        for f in 2..=16u64 {
            s.tracker_update(f, id, 0.9, Bbox::new(100, 100, 160, 180));
        }
        assert!(s.items[&id].last_motion_frame > 0);
        assert!(s.prune(16).is_empty());
        let removed = s.prune(s.items[&id].last_motion_frame + 26);
        assert_eq!(removed, vec![id]);
        assert!(s.items.is_empty());
    }

    // 检测周期命中既有物品: 不建新档
    #[test]
    fn matched_detection_updates_existing_item() {
        let mut s = setting(vec![], vec![]);
        let ids = s.reconcile_detections(&[det(100, 100, 160, 180)], 1);
        let new_ids = s.reconcile_detections(&[det(104, 104, 164, 184)], 10);
        assert!(new_ids.is_empty());
        assert_eq!(s.items.len(), 1);
        assert_eq!(s.items[&ids[0]].bbox, Bbox::new(104, 104, 164, 184));
        assert_eq!(s.items[&ids[0]].last_frame, 10);
    }

    // 质心匹配策略同样可用
    #[test]
    fn centroid_strategy_matches_nearby_boxes() {
        let mut cfg = AnalyserConfig::default();
        cfg.match_strategy = MatchStrategy::Centroid { max_distance: 30 };
        let mut s = Setting::new(cfg, &[], &[]);
        s.reconcile_detections(&[det(100, 100, 160, 180)], 1);
        let new_ids = s.reconcile_detections(&[det(110, 110, 170, 190)], 10);
        assert!(new_ids.is_empty());
        let far = s.reconcile_detections(&[det(300, 300, 360, 380)], 10);
        assert_eq!(far.len(), 1);
    }
}
