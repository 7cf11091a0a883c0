//! 系统与摄像头配置
//! System and per-camera configuration
//!
//! JSON 配置分两层: 系统文件给出全局参数和摄像头列表, 每路摄像头
//! 可以省略字段落回默认值. 线段端点按参考分辨率给出, 解码器报告
//! 实际尺寸后用 rescale_lines 换算

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context as _;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

// ========== 线段 ==========

/// 线的"有效侧"约定: 进入合法的一侧落在叉积的哪个符号上
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SidePolarity {
    Positive,
    Negative,
}

/// 入口线/计数线的配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineConfig {
    pub name: String,

    /// [x1, y1, x2, y2], 参考分辨率坐标
    pub end_points: [i32; 4],

    /// 进入有效侧
    pub side1: SidePolarity,

    /// 骑线新物品是否参与延迟计数
    #[serde(default)]
    pub count_splits: bool,

    #[serde(default)]
    pub label1_text: String,
    #[serde(default)]
    pub label1_id: u32,
    #[serde(default)]
    pub label2_text: String,
    #[serde(default)]
    pub label2_id: u32,
}

// ========== 分析参数 ==========

/// 检测框与已跟踪物品的匹配策略 (两种可互换)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MatchStrategy {
    /// 交并比超过阈值
    Iou { threshold: f32 },
    /// 最近质心且距离不超过上限 (像素)
    Centroid { max_distance: i32 },
}

impl Default for MatchStrategy {
    fn default() -> Self {
        MatchStrategy::Iou { threshold: 0.5 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyserConfig {
    /// 每隔多少帧做一次检测
    #[serde(default = "default_skip_detection")]
    pub skip_detection_frames: u64,

    /// 每隔多少帧广播一轮跟踪 (1 = 每帧)
    #[serde(default = "default_track_every")]
    pub track_every_frames: u64,

    /// 同方向物品重叠超过该 IOU 即剔除后创建者
    #[serde(default = "default_drop_overlap")]
    pub drop_overlap: f32,

    /// 静止超过该帧数判定消失
    #[serde(default = "default_disappear")]
    pub disappear_frames: u64,

    /// 同一物品同一线再次计数的冷却帧数
    #[serde(default = "default_cooldown")]
    pub count_cooldown_frames: u64,

    #[serde(default)]
    pub match_strategy: MatchStrategy,

    /// 方向判定的最小位移 (像素), 抑制噪声
    #[serde(default = "default_direction_threshold")]
    pub direction_threshold: i32,

    /// 跟踪屏障超时 (毫秒). None = 永远等待 (与原始语义一致)
    #[serde(default)]
    pub tracker_reply_timeout_ms: Option<u64>,
}

impl Default for AnalyserConfig {
    fn default() -> Self {
        Self {
            skip_detection_frames: default_skip_detection(),
            track_every_frames: default_track_every(),
            drop_overlap: default_drop_overlap(),
            disappear_frames: default_disappear(),
            count_cooldown_frames: default_cooldown(),
            match_strategy: MatchStrategy::default(),
            direction_threshold: default_direction_threshold(),
            tracker_reply_timeout_ms: None,
        }
    }
}

// ========== 摄像头 ==========

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    pub name: String,

    /// 视频源 (文件路径或流地址)
    pub input: String,

    /// 解码后缩放到的宽度
    #[serde(default = "default_scaled_width")]
    pub scaled_width: u32,

    /// 帧环形缓冲的循环槽位数
    #[serde(default = "default_ring_slots")]
    pub ring_slots: usize,

    /// 缓冲满时丢帧 (true, 实时流) 还是按住游标 (false, 文件回放)
    #[serde(default = "default_true")]
    pub drop_on_full: bool,

    /// 线段端点标定时使用的参考分辨率 [宽, 高]
    #[serde(default = "default_lines_dimensions")]
    pub lines_dimensions: [u32; 2],

    #[serde(default)]
    pub entry_lines: Vec<LineConfig>,

    #[serde(default)]
    pub counting_lines: Vec<LineConfig>,

    #[serde(default)]
    pub analyser: AnalyserConfig,
}

impl CameraConfig {
    /// 把标定分辨率下的线段端点换算到实际解码尺寸.
    /// 解码器报告宽高之后调用一次
    pub fn rescale_lines(&mut self, width: u32, height: u32) {
        let kw = width as f64 / self.lines_dimensions[0] as f64;
        let kh = height as f64 / self.lines_dimensions[1] as f64;

        for line in self
            .entry_lines
            .iter_mut()
            .chain(self.counting_lines.iter_mut())
        {
            let ep = line.end_points;
            line.end_points = [
                (ep[0] as f64 * kw) as i32,
                (ep[1] as f64 * kh) as i32,
                (ep[2] as f64 * kw) as i32,
                (ep[3] as f64 * kh) as i32,
            ];
        }
        self.lines_dimensions = [width, height];
    }
}

// ========== 系统 ==========

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    /// 分析结果 (CSV) 输出目录
    #[serde(default = "default_output_dir")]
    pub analytics_output_dir: String,

    /// 共享内存文件目录
    #[serde(default = "default_shm_dir")]
    pub shm_dir: String,

    /// CSV 输出间隔 (分钟)
    #[serde(default = "default_csv_minutes")]
    pub csv_minutes: u64,

    /// CSV 行是否带分钟列
    #[serde(default = "default_true")]
    pub csv_with_minutes: bool,

    /// 跟踪器池大小
    #[serde(default = "default_trackers")]
    pub trackers: usize,

    /// 采集节拍周期 (毫秒)
    #[serde(default = "default_drum_beat_ms")]
    pub drum_beat_ms: u64,

    pub cameras: Vec<CameraConfig>,
}

impl SystemConfig {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading configuration file {}", path.display()))?;
        let cfg: SystemConfig = serde_json::from_str(&raw)
            .with_context(|| format!("parsing configuration file {}", path.display()))?;
        Ok(cfg)
    }

    /// 命令行给了单个视频时, 忽略配置文件里的摄像头列表
    pub fn override_single_video(&mut self, input: &str) {
        let template = self
            .cameras
            .first()
            .cloned()
            .unwrap_or_else(|| CameraConfig {
                name: "video0".to_string(),
                input: String::new(),
                scaled_width: default_scaled_width(),
                ring_slots: default_ring_slots(),
                drop_on_full: true,
                lines_dimensions: default_lines_dimensions(),
                entry_lines: Vec::new(),
                counting_lines: Vec::new(),
                analyser: AnalyserConfig::default(),
            });
        self.cameras = vec![CameraConfig {
            input: input.to_string(),
            ..template
        }];
    }
}

// ========== 检测类别 ==========

/// COCO 类别标签 (检测记录里的 class_id → 名称)
pub static CLASS_NAMES: Lazy<HashMap<u16, &'static str>> = Lazy::new(|| {
    [
        (0, "person"),
        (1, "bicycle"),
        (2, "car"),
        (3, "motorbike"),
        (5, "bus"),
        (7, "truck"),
        (15, "cat"),
        (16, "dog"),
    ]
    .into_iter()
    .collect()
});

pub fn class_name(class_id: u16) -> &'static str {
    CLASS_NAMES.get(&class_id).copied().unwrap_or("object")
}

// ========== 默认值 ==========

fn default_skip_detection() -> u64 {
    10
}

fn default_track_every() -> u64 {
    1
}

fn default_drop_overlap() -> f32 {
    0.8
}

fn default_disappear() -> u64 {
    90
}

fn default_cooldown() -> u64 {
    30
}

fn default_direction_threshold() -> i32 {
    5
}

fn default_scaled_width() -> u32 {
    500
}

fn default_ring_slots() -> usize {
    64
}

fn default_lines_dimensions() -> [u32; 2] {
    [704, 480]
}

fn default_output_dir() -> String {
    "log".to_string()
}

fn default_shm_dir() -> String {
    "log".to_string()
}

fn default_csv_minutes() -> u64 {
    10
}

fn default_trackers() -> usize {
    4
}

fn default_drum_beat_ms() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_camera_json_fills_defaults() {
        let raw = r#"{
            "cameras": [{
                "name": "gate",
                "input": "videos/gate.mp4",
                "counting_lines": [{
                    "name": "door",
                    "end_points": [0, 240, 704, 240],
                    "side1": "Negative"
                }]
            }]
        }"#;
        let cfg: SystemConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.trackers, 4);
        let cam = &cfg.cameras[0];
        assert_eq!(cam.ring_slots, 64);
        assert!(cam.drop_on_full);
        assert_eq!(cam.analyser.skip_detection_frames, 10);
        assert_eq!(cam.counting_lines[0].side1, SidePolarity::Negative);
    }

    // 线段端点按参考分辨率 → 实际分辨率等比换算
    #[test]
    fn line_endpoints_rescale_to_decoded_size() {
        let raw = r#"{
            "name": "gate",
            "input": "x",
            "lines_dimensions": [704, 480],
            "counting_lines": [{
                "name": "door",
                "end_points": [0, 240, 704, 240],
                "side1": "Negative"
            }]
        }"#;
        let mut cam: CameraConfig = serde_json::from_str(raw).unwrap();
        cam.rescale_lines(352, 240);
        assert_eq!(cam.counting_lines[0].end_points, [0, 120, 352, 120]);
        assert_eq!(cam.lines_dimensions, [352, 240]);
    }

    #[test]
    fn match_strategy_variants_parse() {
        let iou: MatchStrategy =
            serde_json::from_str(r#"{"kind": "iou", "threshold": 0.3}"#).unwrap();
        assert_eq!(iou, MatchStrategy::Iou { threshold: 0.3 });
        let cen: MatchStrategy =
            serde_json::from_str(r#"{"kind": "centroid", "max_distance": 40}"#).unwrap();
        assert_eq!(cen, MatchStrategy::Centroid { max_distance: 40 });
    }
}
