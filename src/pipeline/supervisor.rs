//! 多摄像头总监
//! Multi-camera supervisor
//!
//! 为每路配置的摄像头雇一个 FlowManager, 维护全系统共享的
//! 检测器和跟踪池, 并处理运行期的加摄像头/开关回放请求

use std::collections::HashMap;
use std::path::PathBuf;

use tracing::{info, warn};

use crate::actor::{Actor, Addr, Context, Continuation};
use crate::config::{CameraConfig, SystemConfig};
use crate::pipeline::decoder::FrameSource;
use crate::pipeline::detector::{DetectorActor, ObjectDetector};
use crate::pipeline::manager::{FlowManager, ManagerMsg};
use crate::pipeline::tracker::{TrackerFactory, TrackerWorker};
use crate::pipeline::StatusReport;
use crate::shm::DetectionBoard;

/// 外部协作者的装配工厂: 总监不关心具体算法, 只管接线
pub struct Collaborators {
    pub detector: Box<dyn ObjectDetector>,
    pub tracker_factory: TrackerFactory,
    pub source_factory: Box<dyn Fn(&CameraConfig) -> Box<dyn FrameSource> + Send>,
}

pub enum SupervisorMsg {
    /// 运行期新增一路摄像头
    AddCamera(CameraConfig),
    /// 给某路摄像头开一个显示观察者
    StartPlayback { camera: String },
    StopPlayback { camera: String },
    /// 把某路管理器的状态快照转给续延
    QueryStatus {
        camera: String,
        reply: Continuation<StatusReport>,
    },
}

pub struct MultiFlow {
    cfg: SystemConfig,
    collaborators: Option<Collaborators>,

    board_path: PathBuf,
    board_cameras: usize,
    detector: Option<Addr<DetectorActor>>,
    trackers: Vec<Addr<TrackerWorker>>,
    managers: HashMap<String, Addr<FlowManager>>,
    next_camera_id: usize,
    source_factory: Option<Box<dyn Fn(&CameraConfig) -> Box<dyn FrameSource> + Send>>,
}

impl MultiFlow {
    pub fn new(cfg: SystemConfig, collaborators: Collaborators) -> Self {
        let board_path = PathBuf::from(&cfg.shm_dir).join("bboxes");
        // 运行期加摄像头也要有位置, 预留一点余量
        let board_cameras = (cfg.cameras.len() + 4).max(8);
        Self {
            cfg,
            collaborators: Some(collaborators),
            board_path,
            board_cameras,
            detector: None,
            trackers: Vec::new(),
            managers: HashMap::new(),
            next_camera_id: 0,
            source_factory: None,
        }
    }

    fn add_camera(&mut self, cam: CameraConfig, ctx: &mut Context<Self>) {
        if self.managers.contains_key(&cam.name) {
            warn!(camera = %cam.name, "camera already managed");
            return;
        }
        let Some(detector) = self.detector.clone() else {
            warn!(camera = %cam.name, "detector not ready, camera not added");
            return;
        };
        let Some(factory) = self.source_factory.as_ref() else {
            return;
        };

        let camera_id = self.next_camera_id;
        self.next_camera_id += 1;

        let source = factory(&cam);
        let name = cam.name.clone();
        let manager = FlowManager::new(
            camera_id,
            cam,
            &self.cfg.shm_dir,
            self.board_path.clone(),
            self.board_cameras,
            self.cfg.drum_beat_ms,
            self.cfg.csv_minutes,
            self.cfg.csv_with_minutes,
            &self.cfg.analytics_output_dir,
            source,
            self.trackers.clone(),
            detector,
        );
        let addr = ctx.spawn_child(&name, manager);
        self.managers.insert(name.clone(), addr);
        info!(camera = %name, camera_id, "flow manager hired");
    }
}

impl Actor for MultiFlow {
    type Msg = SupervisorMsg;
    type Reply = ();

    fn initialize(&mut self, ctx: &mut Context<Self>) {
        let collaborators = self.collaborators.take().expect("initialized twice");

        if let Err(e) = std::fs::create_dir_all(&self.cfg.shm_dir) {
            warn!(error = %e, "could not create shm dir");
            return;
        }
        // 检测交换区: 总监建区, 检测器和各管理器挂载
        if let Err(e) = DetectionBoard::create(&self.board_path, self.board_cameras) {
            warn!(error = %e, "could not create detection board");
            return;
        }

        let detector = DetectorActor::new(
            collaborators.detector,
            self.board_path.clone(),
            self.board_cameras,
        );
        self.detector = Some(ctx.spawn_child("detector", detector));

        for i in 0..self.cfg.trackers.max(1) {
            let worker = TrackerWorker::new(i, collaborators.tracker_factory.clone());
            let addr = ctx.spawn_child(&format!("tracker{i}"), worker);
            self.trackers.push(addr);
        }
        info!(pool = self.trackers.len(), "tracker pool ready");

        self.source_factory = Some(collaborators.source_factory);
        let cameras: Vec<CameraConfig> = self.cfg.cameras.clone();
        for cam in cameras {
            self.add_camera(cam, ctx);
        }
    }

    fn handle(&mut self, msg: SupervisorMsg, ctx: &mut Context<Self>) -> Option<()> {
        match msg {
            SupervisorMsg::AddCamera(cam) => {
                self.add_camera(cam, ctx);
            }
            SupervisorMsg::StartPlayback { camera } => {
                // 显示器挂载参数 (环形缓冲位置) 在管理器手里, 转发
                match self.managers.get(&camera) {
                    Some(manager) => manager.tell(ManagerMsg::StartPlayback),
                    None => warn!(camera = %camera, "start_playback for unknown camera"),
                }
            }
            SupervisorMsg::StopPlayback { camera } => {
                if let Some(manager) = self.managers.get(&camera) {
                    manager.tell(ManagerMsg::StopPlayback);
                }
            }
            SupervisorMsg::QueryStatus { camera, reply } => {
                if let Some(manager) = self.managers.get(&camera) {
                    manager.ask(ManagerMsg::GetStatus, reply);
                }
                // 未知摄像头: 按寻址失败语义丢弃, 续延永不完成
            }
        }
        None
    }

    fn on_child_exited(&mut self, name: &str, _ctx: &mut Context<Self>) {
        self.managers.remove(name);
    }
}
