//! 每路摄像头的流程管理器
//! Per-camera flow manager
//!
//! 每帧状态机:
//!
//! ```text
//! AwaitingFrame → Tracking → (屏障) → Detecting → Reconciling → Notifying
//!       ↑                                                          |
//!       └──────────────── mark_consumed / retain_last ←────────────┘
//! ```
//!
//! 跟踪屏障是全系统唯一的同步等待点: 对跟踪池整体广播请求, 用
//! 回包计数器归零作为放行条件, 回包以异步消息逐个到达, 邮箱循环
//! 从不阻塞. 跟踪器失联时的处理策略见 tracker_reply_timeout_ms

use std::path::PathBuf;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, info, warn};

use crate::actor::{Actor, Addr, Context};
use crate::config::CameraConfig;
use crate::flow::csv::CsvSchedule;
use crate::flow::Setting;
use crate::pipeline::decoder::{DecoderMsg, FrameListener, FrameSource, VideoDecoder};
use crate::pipeline::detector::{DetectorActor, DetectorMsg};
use crate::pipeline::display::Display;
use crate::pipeline::tracker::{TrackerMsg, TrackerWorker};
use crate::pipeline::{
    CameraInfo, ItemView, LineView, ObserverEvent, ObserverHandle, StatusReport, TrackBatch,
    TRACKER_LEFT,
};
use crate::shm::{DetectionBoard, FrameRing};

// ========== 状态机 ==========

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// 等解码器在环形缓冲里发布序号更大的帧
    AwaitingFrame,
    /// 屏障开着, 等跟踪池的回包
    Tracking,
    /// 检测请求在外, 等检测器应答
    Detecting,
}

// ========== 消息 ==========

pub enum ManagerMsg {
    /// 解码器监听回调: 新帧已发布
    FrameAvailable { seq: u64, slot: usize },
    /// 解码器握手应答
    DecoderInfo(CameraInfo),
    /// 跟踪池回包 (屏障计数 -1)
    TrackedBatch(TrackBatch),
    /// 检测器应答: 交换区里有 count 条记录
    DetectDone { count: usize },
    /// 观察者登记/注销
    AddObserver {
        name: String,
        observer: Box<dyn ObserverHandle>,
    },
    RemoveObserver { name: String },
    /// 开/关本摄像头的显示观察者
    StartPlayback,
    StopPlayback,
    /// 状态快照 (请求模式)
    GetStatus,
}

// ========== 管理器 ==========

pub struct FlowManager {
    camera_id: usize,
    cfg: CameraConfig,
    shm_dir: String,
    board_path: PathBuf,
    board_cameras: usize,
    beat_ms: u64,

    source: Option<Box<dyn FrameSource>>,
    decoder_addr: Option<Addr<VideoDecoder>>,
    trackers: Vec<Addr<TrackerWorker>>,
    detector: Addr<DetectorActor>,
    observers: Vec<(String, Box<dyn ObserverHandle>)>,

    setting: Option<Setting>,
    csv: CsvSchedule,
    ring: Option<FrameRing>,
    board: Option<DetectionBoard>,
    camera_info: Option<CameraInfo>,

    playback: bool,
    display_addr: Option<Addr<Display>>,

    phase: Phase,
    last_seq: u64,
    current_seq: u64,
    current_slot: usize,
    pending_trackers: usize,

    // 新物品分发游标 (随机起点 + 轮转)
    dispatch_cursor: usize,

    // 每帧处理耗时统计, 定期回馈给解码器做源头丢帧
    frame_t0: Instant,
    processing_acc_ms: f64,
    processed: u64,
}

impl FlowManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        camera_id: usize,
        cfg: CameraConfig,
        shm_dir: &str,
        board_path: PathBuf,
        board_cameras: usize,
        beat_ms: u64,
        csv_minutes: u64,
        csv_with_minutes: bool,
        output_dir: &str,
        source: Box<dyn FrameSource>,
        trackers: Vec<Addr<TrackerWorker>>,
        detector: Addr<DetectorActor>,
    ) -> Self {
        let csv = CsvSchedule::new(output_dir, &cfg.name, csv_minutes, csv_with_minutes);
        Self {
            camera_id,
            cfg,
            shm_dir: shm_dir.to_string(),
            board_path,
            board_cameras,
            beat_ms,
            source: Some(source),
            decoder_addr: None,
            trackers,
            detector,
            observers: Vec::new(),
            setting: None,
            csv,
            ring: None,
            board: None,
            camera_info: None,
            playback: false,
            display_addr: None,
            phase: Phase::AwaitingFrame,
            last_seq: 0,
            current_seq: 0,
            current_slot: 0,
            pending_trackers: 0,
            dispatch_cursor: 0,
            frame_t0: Instant::now(),
            processing_acc_ms: 0.0,
            processed: 0,
        }
    }

    fn decoder_name(&self) -> String {
        format!("{}_decoder", self.cfg.name)
    }

    // ---------- 握手 ----------

    fn on_decoder_info(&mut self, info: CameraInfo, ctx: &mut Context<Self>) {
        // 线段端点从标定分辨率换算到实际解码尺寸
        self.cfg.rescale_lines(info.width, info.height);
        self.setting = Some(Setting::new(
            self.cfg.analyser.clone(),
            &self.cfg.entry_lines,
            &self.cfg.counting_lines,
        ));

        match FrameRing::open(&info.ring_path, info.shape, info.slots) {
            Ok(ring) => self.ring = Some(ring),
            Err(e) => {
                warn!(camera = %self.cfg.name, error = %e, "could not open frame ring");
                return;
            }
        }
        match DetectionBoard::open(&self.board_path, self.board_cameras) {
            Ok(board) => self.board = Some(board),
            Err(e) => {
                warn!(camera = %self.cfg.name, error = %e, "could not open detection board");
                return;
            }
        }

        // 跟踪池和检测器挂载同一块环形缓冲
        for worker in &self.trackers {
            worker.tell(TrackerMsg::Attach {
                camera: self.camera_id,
                ring_path: info.ring_path.clone(),
                shape: info.shape,
                slots: info.slots,
            });
        }
        self.detector.tell(DetectorMsg::Attach {
            camera: self.camera_id,
            ring_path: info.ring_path.clone(),
            shape: info.shape,
            slots: info.slots,
        });

        info!(camera = %self.cfg.name, "flow manager ready");
        self.camera_info = Some(info);
        if self.playback {
            self.start_playback(ctx);
        }
        self.try_next_frame(ctx);
    }

    // ---------- 回放 ----------

    fn start_playback(&mut self, ctx: &mut Context<Self>) {
        if self.display_addr.is_some() {
            return;
        }
        let Some(info) = self.camera_info.as_ref() else {
            // 解码器握手还没回来, DecoderInfo 到达时补开
            return;
        };
        let name = format!("{}_display", self.cfg.name);
        let display = Display::new(&self.cfg.name, info.ring_path.clone(), info.shape, info.slots);
        let addr = ctx.spawn_child(&name, display);
        self.observers.push((name, Box::new(addr.clone())));
        self.display_addr = Some(addr);
        info!(camera = %self.cfg.name, "playback started");
    }

    fn stop_playback(&mut self) {
        self.playback = false;
        let name = format!("{}_display", self.cfg.name);
        self.observers.retain(|(n, _)| *n != name);
        if let Some(display) = self.display_addr.take() {
            display.control().exit_request();
            info!(camera = %self.cfg.name, "playback stopped");
        }
    }

    // ---------- AwaitingFrame ----------

    /// 在环形缓冲里找序号大于 last_seq 的最小已发布帧.
    /// 解码和流水线是独立调度单元, 找不到就预约下一次轮询
    fn try_next_frame(&mut self, ctx: &mut Context<Self>) {
        if self.phase != Phase::AwaitingFrame || self.setting.is_none() {
            return;
        }
        let Some(ring) = self.ring.as_ref() else {
            return;
        };

        let mut best: Option<(u64, usize)> = None;
        for slot in 0..ring.slots() {
            if let Ok(seq) = ring.read_header(slot) {
                if seq > self.last_seq && best.map_or(true, |(b, _)| seq < b) {
                    best = Some((seq, slot));
                }
            }
        }

        match best {
            Some((seq, slot)) => self.start_frame(seq, slot, ctx),
            None => ctx.wakeup_after(Duration::from_millis(self.beat_ms.max(2) / 2)),
        }
    }

    // ---------- Tracking ----------

    fn start_frame(&mut self, seq: u64, slot: usize, ctx: &mut Context<Self>) {
        // 残留的轮询唤醒在 Tracking 阶段触发会误开屏障
        ctx.cancel_wakeup();
        self.frame_t0 = Instant::now();
        self.current_seq = seq;
        self.current_slot = slot;
        self.last_seq = seq;

        // 先清理: 静止超时与同向重叠的物品
        let removed = {
            let setting = self.setting.as_mut().unwrap();
            setting.prune(seq)
        };
        for id in removed {
            self.drop_item(id);
        }

        let (track_now, barrier_timeout) = {
            let setting = self.setting.as_ref().unwrap();
            (
                !self.trackers.is_empty()
                    && !setting.items.is_empty()
                    && seq % setting.analyser().track_every_frames == 0,
                setting.analyser().tracker_reply_timeout_ms,
            )
        };

        if track_now {
            self.phase = Phase::Tracking;
            self.pending_trackers = self.trackers.len();
            let camera = self.camera_id;
            for worker in &self.trackers {
                worker.ask(
                    TrackerMsg::UpdateAll { camera, slot, seq },
                    ctx.callback(ManagerMsg::TrackedBatch),
                );
            }
            // 屏障超时策略: 配置了就预约强制放行, 否则无限等
            if let Some(ms) = barrier_timeout {
                ctx.wakeup_after(Duration::from_millis(ms));
            }
        } else {
            self.enter_detecting(ctx);
        }
    }

    fn on_tracked_batch(&mut self, batch: TrackBatch, ctx: &mut Context<Self>) {
        // 迟到的旧屏障回包 (超时放行之后才到) 不能算进当前屏障
        if self.phase != Phase::Tracking
            || batch.camera != self.camera_id
            || batch.seq != self.current_seq
        {
            debug!(camera = %self.cfg.name, seq = batch.seq, "stale tracker batch ignored");
            return;
        }

        let seq = self.current_seq;
        for update in &batch.updates {
            let exited = {
                let setting = self.setting.as_mut().unwrap();
                if update.confidence <= TRACKER_LEFT {
                    true
                } else {
                    setting.tracker_update(seq, update.item_id, update.confidence, update.bbox);
                    setting
                        .items
                        .get(&update.item_id)
                        .map_or(false, |item| setting.check_exit(&item.bbox))
                }
            };
            if exited {
                let setting = self.setting.as_mut().unwrap();
                if setting.remove_item(update.item_id) {
                    debug!(camera = %self.cfg.name, item = update.item_id, "item left the scene");
                }
                self.drop_item(update.item_id);
            }
        }

        self.pending_trackers = self.pending_trackers.saturating_sub(1);
        if self.pending_trackers == 0 {
            // 屏障放行
            ctx.cancel_wakeup();
            self.enter_detecting(ctx);
        }
    }

    /// 屏障超时 (仅在配置了超时的情况下会走到): 用已有回包放行,
    /// 失联 worker 的物品保持上一帧位置
    fn barrier_timed_out(&mut self, ctx: &mut Context<Self>) {
        warn!(
            camera = %self.cfg.name,
            missing = self.pending_trackers,
            frame = self.current_seq,
            "tracking barrier timed out, advancing with partial results"
        );
        self.pending_trackers = 0;
        self.enter_detecting(ctx);
    }

    // ---------- Detecting ----------

    fn enter_detecting(&mut self, ctx: &mut Context<Self>) {
        let skip = self.setting.as_ref().unwrap().analyser().skip_detection_frames;
        if skip > 0 && self.current_seq % skip == 0 {
            self.phase = Phase::Detecting;
            if let Some(board) = self.board.as_mut() {
                // 等待哨兵先落, 检测器稍后覆盖成记录数
                if let Err(e) = board.begin_request(self.camera_id) {
                    warn!(camera = %self.cfg.name, error = %e, "begin_request failed");
                }
            }
            self.detector.ask(
                DetectorMsg::Detect {
                    camera: self.camera_id,
                    slot: self.current_slot,
                    seq: self.current_seq,
                },
                ctx.callback(|count| ManagerMsg::DetectDone { count }),
            );
        } else {
            self.finish_frame(ctx);
        }
    }

    fn on_detect_done(&mut self, count: usize, ctx: &mut Context<Self>) {
        if self.phase != Phase::Detecting {
            debug!(camera = %self.cfg.name, "stale detection reply ignored");
            return;
        }

        // Reconciling: 交换区头部按约定已经是记录数
        let records = match self.board.as_ref() {
            Some(board) => match board.poll(self.camera_id) {
                Ok(Some(published)) => {
                    if published != count {
                        warn!(
                            camera = %self.cfg.name,
                            published, replied = count,
                            "detection count mismatch, using published header"
                        );
                    }
                    board.read_records(self.camera_id, published).unwrap_or_default()
                }
                Ok(None) => {
                    warn!(camera = %self.cfg.name, "detection replied but header still awaiting");
                    Vec::new()
                }
                Err(e) => {
                    warn!(camera = %self.cfg.name, error = %e, "detection poll failed");
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        let new_ids = {
            let setting = self.setting.as_mut().unwrap();
            setting.reconcile_detections(&records, self.current_seq)
        };
        self.dispatch_new_items(&new_ids);
        self.finish_frame(ctx);
    }

    /// 新物品随机起点轮转分发到跟踪池
    fn dispatch_new_items(&mut self, new_ids: &[u64]) {
        if self.trackers.is_empty() || new_ids.is_empty() {
            return;
        }
        self.dispatch_cursor = rand::thread_rng().gen_range(0..self.trackers.len());
        for id in new_ids {
            let worker = &self.trackers[self.dispatch_cursor % self.trackers.len()];
            self.dispatch_cursor += 1;

            let setting = self.setting.as_mut().unwrap();
            let Some(item) = setting.items.get_mut(id) else {
                continue;
            };
            item.tracker = Some(worker.name().to_string());
            worker.tell(TrackerMsg::Start {
                camera: self.camera_id,
                slot: self.current_slot,
                item_id: *id,
                bbox: item.bbox,
            });
        }
    }

    // ---------- Notifying ----------

    fn finish_frame(&mut self, ctx: &mut Context<Self>) {
        let seq = self.current_seq;
        let slot = self.current_slot;

        {
            let setting = self.setting.as_mut().unwrap();
            setting.count_crossings(seq);
            if let Err(e) = self.csv.tick(setting.counting_lines_mut()) {
                warn!(camera = %self.cfg.name, error = %e, "csv output failed");
            }
        }

        // 观察者通知 (发后即忘)
        if !self.observers.is_empty() {
            let items = self.item_views();
            let lines = self.line_views();
            for (_, observer) in &self.observers {
                observer.notify(ObserverEvent::BaseImage { seq, slot });
                observer.notify(ObserverEvent::OverlayBboxes { items: items.clone() });
                observer.notify(ObserverEvent::AddLines { lines: lines.clone() });
                observer.notify(ObserverEvent::Display { seq });
            }
        }

        // 帧槽位生命周期收尾: 先复制进保留槽位, 再交还生产者
        if let Some(ring) = self.ring.as_mut() {
            if let Err(e) = ring.retain_last(slot) {
                warn!(camera = %self.cfg.name, error = %e, "retain_last failed");
            }
            if let Err(e) = ring.mark_consumed(slot) {
                warn!(camera = %self.cfg.name, error = %e, "mark_consumed failed");
            }
        }

        // 处理速度统计回馈解码器
        self.processing_acc_ms += self.frame_t0.elapsed().as_secs_f64() * 1000.0;
        self.processed += 1;
        if self.processed % 100 == 0 {
            let avg = self.processing_acc_ms / 100.0;
            self.processing_acc_ms = 0.0;
            if let Some(decoder) = &self.decoder_addr {
                decoder.tell(DecoderMsg::ManageBuffer {
                    processing_avg_ms: avg,
                });
            }
        }

        self.phase = Phase::AwaitingFrame;
        self.try_next_frame(ctx);
    }

    // ---------- 辅助 ----------

    fn drop_item(&self, id: u64) {
        // 物品的跟踪器实例在池里哪个 worker 不值得逐个记账,
        // 广播 Remove, 没认领的 worker 当空操作
        for worker in &self.trackers {
            worker.tell(TrackerMsg::Remove {
                camera: self.camera_id,
                item_id: id,
            });
        }
    }

    fn item_views(&self) -> Vec<ItemView> {
        self.setting
            .as_ref()
            .map(|s| {
                s.items
                    .values()
                    .map(|item| ItemView {
                        id: item.id,
                        bbox: item.bbox,
                        class_id: item.class_id,
                        confidence: item.confidence,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn line_views(&self) -> Vec<LineView> {
        let Some(setting) = self.setting.as_ref() else {
            return Vec::new();
        };
        setting
            .entry_lines()
            .iter()
            .chain(setting.counting_lines().iter())
            .map(|line| LineView {
                name: line.name.clone(),
                first: line.first,
                second: line.second,
                counters: line.counters(),
            })
            .collect()
    }
}

impl Actor for FlowManager {
    type Msg = ManagerMsg;
    type Reply = StatusReport;

    fn initialize(&mut self, ctx: &mut Context<Self>) {
        info!(camera = %self.cfg.name, "initializing flow manager");
        let source = self.source.take().expect("source consumed twice");
        let decoder = VideoDecoder::new(self.cfg.clone(), &self.shm_dir, self.beat_ms, source);
        let addr = ctx.spawn_child(&self.decoder_name(), decoder);
        self.decoder_addr = Some(addr);
    }

    fn handle(&mut self, msg: ManagerMsg, ctx: &mut Context<Self>) -> Option<StatusReport> {
        match msg {
            ManagerMsg::FrameAvailable { .. } => {
                self.try_next_frame(ctx);
                None
            }
            ManagerMsg::DecoderInfo(info) => {
                self.on_decoder_info(info, ctx);
                None
            }
            ManagerMsg::TrackedBatch(batch) => {
                self.on_tracked_batch(batch, ctx);
                None
            }
            ManagerMsg::DetectDone { count } => {
                self.on_detect_done(count, ctx);
                None
            }
            ManagerMsg::AddObserver { name, observer } => {
                info!(camera = %self.cfg.name, observer = %name, "observer added");
                self.observers.push((name, observer));
                None
            }
            ManagerMsg::RemoveObserver { name } => {
                self.observers.retain(|(n, _)| *n != name);
                None
            }
            ManagerMsg::StartPlayback => {
                self.playback = true;
                self.start_playback(ctx);
                None
            }
            ManagerMsg::StopPlayback => {
                self.stop_playback();
                None
            }
            ManagerMsg::GetStatus => Some(StatusReport {
                camera: self.cfg.name.clone(),
                frame_number: self.last_seq,
                items: self.item_views(),
                lines: self.line_views(),
            }),
        }
    }

    fn on_child_ready(&mut self, name: &str, ctx: &mut Context<Self>) {
        if name == self.decoder_name() {
            // 解码器初始化完毕: 登记监听并握手取回挂载信息
            let Some(decoder) = &self.decoder_addr else {
                return;
            };
            let manager = ctx.addr();
            let listener = FrameListener(Box::new(move |seq, slot| {
                manager.tell(ManagerMsg::FrameAvailable { seq, slot });
            }));
            decoder.ask(
                DecoderMsg::AddListener(listener),
                ctx.callback(ManagerMsg::DecoderInfo),
            );
        }
    }

    fn on_wakeup(&mut self, ctx: &mut Context<Self>) {
        match self.phase {
            Phase::AwaitingFrame => self.try_next_frame(ctx),
            Phase::Tracking => self.barrier_timed_out(ctx),
            Phase::Detecting => {}
        }
    }

    fn on_exit(&mut self, _ctx: &mut Context<Self>) {
        info!(camera = %self.cfg.name, frames = self.processed, "flow manager stopped");
    }
}
