/// 多路摄像头目标计数
/// Multi-camera object flow counting
///
/// 架构: 每个 actor 一个邮箱一个线程, 帧数据走共享内存环形缓冲
/// 1. 主线程: 装配 Host → 雇 MultiFlow 总监 → 定期拉状态
/// 2. MultiFlow: 每路摄像头一个 FlowManager + 全局检测器/跟踪池
/// 3. 默认接合成帧源/检测器/跟踪器, 生产部署替换三个 trait 实现
use std::time::Duration;

use clap::Parser;
use mimalloc::MiMalloc;
use tracing_subscriber::EnvFilter;

use objectflow_rs::actor::{Continuation, Host};
use objectflow_rs::pipeline::supervisor::{Collaborators, MultiFlow, SupervisorMsg};
use objectflow_rs::pipeline::synthetic::{BrightnessTracker, SyntheticDetector, SyntheticSource};
use objectflow_rs::pipeline::StatusReport;
use objectflow_rs::SystemConfig;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// 目标过线计数程序
#[derive(Parser, Debug)]
#[command(author, version, about = "多路摄像头目标过线计数", long_about = None)]
struct Args {
    /// 系统配置文件路径
    #[arg(short, long, default_value = "config/system.json")]
    config: String,

    /// 只处理这一个视频, 忽略配置文件里的摄像头列表
    #[arg(short, long)]
    video: Option<String>,

    /// CSV 输出间隔 (分钟), 覆盖配置文件
    #[arg(short, long)]
    minutes: Option<u64>,

    /// 启动后为每路摄像头开显示观察者
    #[arg(short, long, default_value_t = true)]
    playback: bool,

    /// 运行时长 (秒), 0 = 一直跑
    #[arg(short, long, default_value_t = 0)]
    seconds: u64,

    /// 状态打印间隔 (秒)
    #[arg(long, default_value_t = 10)]
    status_every: u64,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let mut cfg = SystemConfig::load(&args.config)?;
    if let Some(video) = &args.video {
        cfg.override_single_video(video);
    }
    if let Some(minutes) = args.minutes {
        cfg.csv_minutes = minutes;
    }

    println!("🚀 objectflow 启动");
    println!("📦 配置文件: {}", args.config);
    println!("📹 摄像头: {} 路", cfg.cameras.len());
    println!("🎯 跟踪池: {} 个 worker", cfg.trackers);
    println!("📈 分析输出: {}", cfg.analytics_output_dir);
    println!();

    let camera_names: Vec<String> = cfg.cameras.iter().map(|c| c.name.clone()).collect();

    // 合成协作者: 真实部署替换成编解码器/检测模型/视觉跟踪器
    let collaborators = Collaborators {
        detector: Box::new(SyntheticDetector::default()),
        tracker_factory: std::sync::Arc::new(|| Box::new(BrightnessTracker::default())),
        source_factory: Box::new(|cam| {
            Box::new(SyntheticSource::new(cam.scaled_width as usize, {
                // 4:3 画幅
                (cam.scaled_width as usize) * 3 / 4
            }))
        }),
    };

    let mut host = Host::new();
    let supervisor = host.hire("supervisors", "MultiFlow", MultiFlow::new(cfg, collaborators));

    if args.playback {
        for name in &camera_names {
            supervisor.tell(SupervisorMsg::StartPlayback {
                camera: name.clone(),
            });
        }
    }

    println!("✅ 流水线启动完成, 开始处理...\n");

    let started = std::time::Instant::now();
    loop {
        std::thread::sleep(Duration::from_secs(args.status_every.max(1)));

        for name in &camera_names {
            let (reply, rx) = Continuation::channel();
            supervisor.tell(SupervisorMsg::QueryStatus {
                camera: name.clone(),
                reply,
            });
            if let Ok(status) = rx.recv_timeout(Duration::from_secs(2)) {
                print_status(&status);
            }
        }

        if args.seconds > 0 && started.elapsed().as_secs() >= args.seconds {
            break;
        }
    }

    println!("\n🛑 停机中...");
    host.shutdown_within(Duration::from_secs(10));
    println!("✅ 已退出");
    Ok(())
}

fn print_status(status: &StatusReport) {
    let lines: Vec<String> = status
        .lines
        .iter()
        .map(|l| format!("{}: {}↓ {}↑", l.name, l.counters.0, l.counters.1))
        .collect();
    println!(
        "📷 {} | 帧 {} | 在跟 {} | {}",
        status.camera,
        status.frame_number,
        status.items.len(),
        lines.join(" | ")
    );
}
