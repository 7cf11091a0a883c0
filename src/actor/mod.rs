/// 邮箱式 actor 运行时
/// Mailbox actor runtime
///
/// 每个 actor 独占一个 OS 线程和一个邮箱, 消息逐条处理:
/// 1. tell: 发后即忘, 同一发送方到同一接收方保序
/// 2. ask:  请求/应答, 应答通过类型化续延送回调用方邮箱
/// 3. 生命周期: spawn → initialize → (消息循环) → 退出级联到子 actor
pub mod host;
pub mod mailbox;
pub mod registry;

pub use host::{Host, Target};
pub use mailbox::{spawn, Actor, Addr, Context, Continuation, ControlAddr};
pub use registry::Registry;
