//! 采集节拍器
//! Capture pacing drum beat
//!
//! 按固定周期敲一下, 让解码器抓下一帧. 文件回放时可以在运行期
//! 加减周期, 把采集速度压到处理速度; 实时流保持摄像头帧率

use std::time::Duration;

use tracing::info;

use crate::actor::{Actor, Context};
use crate::pipeline::decoder::{DecoderMsg, VideoDecoder};
use crate::Addr;

pub struct DrumBeat {
    camera: String,
    period: Duration,
    paused: bool,
    target: Addr<VideoDecoder>,
}

#[derive(Debug)]
pub enum BeatMsg {
    /// 周期加长 (毫秒)
    IncPeriod(u64),
    /// 周期缩短 (毫秒)
    DecPeriod(u64),
    Pause,
    Resume,
}

impl DrumBeat {
    pub fn new(camera: &str, period_ms: u64, target: Addr<VideoDecoder>) -> Self {
        Self {
            camera: camera.to_string(),
            period: Duration::from_millis(period_ms),
            paused: false,
            target,
        }
    }
}

impl Actor for DrumBeat {
    type Msg = BeatMsg;
    type Reply = ();

    fn initialize(&mut self, ctx: &mut Context<Self>) {
        ctx.wakeup_after(self.period);
    }

    fn handle(&mut self, msg: BeatMsg, ctx: &mut Context<Self>) -> Option<()> {
        match msg {
            BeatMsg::IncPeriod(ms) => {
                self.period += Duration::from_millis(ms);
                info!(camera = %self.camera, period = ?self.period, "drum beat period increased");
            }
            BeatMsg::DecPeriod(ms) => {
                self.period = self
                    .period
                    .saturating_sub(Duration::from_millis(ms))
                    .max(Duration::from_millis(1));
                info!(camera = %self.camera, period = ?self.period, "drum beat period decreased");
            }
            BeatMsg::Pause => {
                self.paused = true;
                ctx.cancel_wakeup();
            }
            BeatMsg::Resume => {
                if self.paused {
                    self.paused = false;
                    ctx.wakeup_after(self.period);
                }
            }
        }
        None
    }

    fn on_wakeup(&mut self, ctx: &mut Context<Self>) {
        if self.paused {
            return;
        }
        self.target.tell(DecoderMsg::CaptureNext);
        ctx.wakeup_after(self.period);
    }
}
