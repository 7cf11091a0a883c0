//! 内置合成协作者
//! Built-in synthetic collaborators
//!
//! 演示与测试用的一套自洽实现: 合成帧源画一个移动的亮方块,
//! 亮度检测器把它找出来, 亮度跟踪器逐帧跟住它. 生产环境把
//! FrameSource/ObjectDetector/VisualTracker 换成真实编解码与模型

use crate::pipeline::decoder::FrameSource;
use crate::pipeline::detector::ObjectDetector;
use crate::pipeline::tracker::VisualTracker;
use crate::pipeline::TRACKER_LEFT;
use crate::shm::{Detection, FrameShape};
use crate::Bbox;

/// 亮方块像素值与判定阈值
const FOREGROUND: u8 = 250;
const BACKGROUND: u8 = 16;
const THRESHOLD: u8 = 200;

// ========== 帧源 ==========

/// 深色背景上一个匀速移动的亮方块, 走出画面后从起点重新进入
pub struct SyntheticSource {
    shape: FrameShape,
    square: i32,
    start: (i32, i32),
    vel: (i32, i32),
    t: i64,
}

impl SyntheticSource {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            shape: FrameShape::new(width, height, 3),
            square: (width as i32 / 8).max(8),
            start: (width as i32 / 2 - width as i32 / 16, 4),
            vel: (0, 4),
            t: 0,
        }
    }

    /// 自定义轨迹 (测试里用来安排确定的过线时刻)
    pub fn with_motion(mut self, start: (i32, i32), vel: (i32, i32), square: i32) -> Self {
        self.start = start;
        self.vel = vel;
        self.square = square;
        self
    }

    fn position(&self) -> Option<(i32, i32)> {
        let w = self.shape.width as i32;
        let h = self.shape.height as i32;
        // 一圈 = 走完整个画面 + 几拍空档, 然后从起点重来
        let travel = (h + self.square).max(w + self.square);
        let speed = self.vel.0.abs().max(self.vel.1.abs()).max(1);
        let lap = (travel / speed + 8) as i64;
        let step = self.t % lap;
        let x = self.start.0 + self.vel.0 * step as i32;
        let y = self.start.1 + self.vel.1 * step as i32;
        if x >= w || y >= h || x + self.square <= 0 || y + self.square <= 0 {
            return None; // 画面外
        }
        Some((x, y))
    }
}

impl FrameSource for SyntheticSource {
    fn open(&mut self) -> anyhow::Result<FrameShape> {
        Ok(self.shape)
    }

    fn grab(&mut self, out: &mut [u8]) -> bool {
        out.fill(BACKGROUND);
        if let Some((x, y)) = self.position() {
            let w = self.shape.width as i32;
            let h = self.shape.height as i32;
            let depth = self.shape.depth;
            for py in y.max(0)..(y + self.square).min(h) {
                let row = (py as usize * self.shape.width) * depth;
                for px in x.max(0)..(x + self.square).min(w) {
                    let at = row + px as usize * depth;
                    out[at..at + depth].fill(FOREGROUND);
                }
            }
        }
        self.t += 1;
        true
    }

    fn reopen(&mut self) {}
}

// ========== 检测器 ==========

/// 亮度连通块检测: 扫描高亮像素取外接框
pub struct SyntheticDetector {
    /// 低于这个像素数的亮斑当噪声丢掉
    pub min_pixels: usize,
}

impl Default for SyntheticDetector {
    fn default() -> Self {
        Self { min_pixels: 16 }
    }
}

fn bright_bounds(frame: &[u8], shape: FrameShape, window: Option<Bbox>) -> (usize, Option<Bbox>) {
    let (x0, y0, x1, y1) = match window {
        Some(b) => (
            b.start_x().max(0) as usize,
            b.start_y().max(0) as usize,
            (b.end_x().min(shape.width as i32 - 1)).max(0) as usize,
            (b.end_y().min(shape.height as i32 - 1)).max(0) as usize,
        ),
        None => (0, 0, shape.width - 1, shape.height - 1),
    };

    let mut count = 0usize;
    let mut min_x = usize::MAX;
    let mut min_y = usize::MAX;
    let mut max_x = 0usize;
    let mut max_y = 0usize;

    for y in y0..=y1 {
        let row = y * shape.width * shape.depth;
        for x in x0..=x1 {
            if frame[row + x * shape.depth] >= THRESHOLD {
                count += 1;
                min_x = min_x.min(x);
                min_y = min_y.min(y);
                max_x = max_x.max(x);
                max_y = max_y.max(y);
            }
        }
    }

    if count == 0 {
        return (0, None);
    }
    (
        count,
        Some(Bbox::new(
            min_x as i32,
            min_y as i32,
            max_x as i32,
            max_y as i32,
        )),
    )
}

impl ObjectDetector for SyntheticDetector {
    fn detect(&mut self, _camera: usize, frame: &[u8], shape: FrameShape) -> Vec<Detection> {
        let (count, bounds) = bright_bounds(frame, shape, None);
        match bounds {
            Some(b) if count >= self.min_pixels => vec![Detection {
                bbox: [b.start_x(), b.start_y(), b.end_x(), b.end_y()],
                confidence: 0.9,
                class_id: 0,
            }],
            _ => Vec::new(),
        }
    }
}

// ========== 跟踪器 ==========

/// 在上一帧位置附近的窗口里重新找亮斑. 找不到报 -1 (物品离开)
pub struct BrightnessTracker {
    bbox: Bbox,
    margin: i32,
}

impl Default for BrightnessTracker {
    fn default() -> Self {
        Self {
            bbox: Bbox::default(),
            margin: 24,
        }
    }
}

impl VisualTracker for BrightnessTracker {
    fn start(&mut self, _frame: &[u8], _shape: FrameShape, bbox: Bbox) {
        self.bbox = bbox;
    }

    fn update(&mut self, frame: &[u8], shape: FrameShape) -> (f32, Bbox) {
        let window = Bbox::new(
            self.bbox.start_x() - self.margin,
            self.bbox.start_y() - self.margin,
            self.bbox.end_x() + self.margin,
            self.bbox.end_y() + self.margin,
        );
        let (count, bounds) = bright_bounds(frame, shape, Some(window));
        match bounds {
            Some(b) if count >= 4 => {
                self.bbox = b;
                (0.75, b)
            }
            _ => (TRACKER_LEFT, self.bbox),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grab_one(source: &mut SyntheticSource) -> (Vec<u8>, FrameShape) {
        let shape = source.open().unwrap();
        let mut frame = vec![0u8; shape.frame_size()];
        assert!(source.grab(&mut frame));
        (frame, shape)
    }

    #[test]
    fn detector_finds_the_square() {
        let mut source = SyntheticSource::new(160, 120).with_motion((60, 30), (0, 0), 20);
        let (frame, shape) = grab_one(&mut source);
        let dets = SyntheticDetector::default().detect(0, &frame, shape);
        assert_eq!(dets.len(), 1);
        let b = dets[0].bbox;
        assert_eq!((b[0], b[1]), (60, 30));
        assert_eq!((b[2], b[3]), (79, 49));
    }

    #[test]
    fn tracker_follows_the_square() {
        let mut source = SyntheticSource::new(160, 120).with_motion((60, 10), (0, 6), 20);
        let (frame, shape) = grab_one(&mut source);

        let mut tracker = BrightnessTracker::default();
        tracker.start(&frame, shape, Bbox::new(60, 10, 79, 29));

        // 连续几帧, 跟踪框一路向下
        let mut last_y = 10;
        for _ in 0..5 {
            let mut frame = vec![0u8; shape.frame_size()];
            source.grab(&mut frame);
            let (conf, bbox) = tracker.update(&frame, shape);
            assert!(conf > 0.0);
            assert!(bbox.start_y() > last_y);
            last_y = bbox.start_y();
        }
    }

    // 方块走出画面后跟踪器报离开哨兵
    #[test]
    fn tracker_reports_departure() {
        let mut source = SyntheticSource::new(160, 120).with_motion((60, 100), (0, 10), 16);
        let (frame, shape) = grab_one(&mut source);
        let mut tracker = BrightnessTracker::default();
        tracker.start(&frame, shape, Bbox::new(60, 100, 75, 115));

        let mut left = false;
        for _ in 0..8 {
            let mut frame = vec![0u8; shape.frame_size()];
            source.grab(&mut frame);
            let (conf, _bbox) = tracker.update(&frame, shape);
            if conf == TRACKER_LEFT {
                left = true;
                break;
            }
        }
        assert!(left);
    }
}
