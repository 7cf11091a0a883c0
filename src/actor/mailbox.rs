//! 单线程邮箱循环与类型化地址
//! Single-threaded mailbox loop and typed addresses

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, warn};

// ========== 消息信封 ==========

/// 内部信封: 消息本体 + 投递模式
/// 请求模式携带类型化续延, 处理函数返回后由运行时自动完成应答
pub(crate) enum Envelope<A: Actor> {
    Tell(A::Msg),
    Ask(A::Msg, Continuation<A::Reply>),
    ExitRequest,
    ChildReady(String),
    ChildExited(String),
}

/// 应答续延 (构造 ask 时捕获, 通常把应答投回调用方自己的邮箱)
pub struct Continuation<R>(Box<dyn FnOnce(R) + Send + 'static>);

impl<R: Send + 'static> Continuation<R> {
    pub fn new(f: impl FnOnce(R) + Send + 'static) -> Self {
        Self(Box::new(f))
    }

    /// 通道形式的续延, 给非 actor 调用方 (主线程/测试) 同步等待应答用
    pub fn channel() -> (Self, Receiver<R>) {
        let (tx, rx) = unbounded();
        (
            Self::new(move |r| {
                let _ = tx.send(r);
            }),
            rx,
        )
    }

    pub(crate) fn complete(self, reply: R) {
        (self.0)(reply)
    }
}

// ========== Actor 契约 ==========

/// 每个 actor 角色定义一个封闭的消息枚举和一个应答类型
/// 同一 actor 内消息串行处理, 无内部数据竞争
pub trait Actor: Send + Sized + 'static {
    type Msg: Send + 'static;
    type Reply: Send + 'static;

    /// 处理一条消息. 对请求模式的信封, 返回 Some(reply) 时由运行时
    /// 把应答送进续延; 返回 None 则记录日志并丢弃该请求
    fn handle(&mut self, msg: Self::Msg, ctx: &mut Context<Self>) -> Option<Self::Reply>;

    /// 入口初始化, 作为第一条被调度的工作执行
    fn initialize(&mut self, _ctx: &mut Context<Self>) {}

    /// 定时唤醒 (通过 Context::wakeup_after 预约)
    fn on_wakeup(&mut self, _ctx: &mut Context<Self>) {}

    /// 子 actor 初始化完成通知
    fn on_child_ready(&mut self, _name: &str, _ctx: &mut Context<Self>) {}

    /// 子 actor 终止通知 (默认忽略)
    fn on_child_exited(&mut self, _name: &str, _ctx: &mut Context<Self>) {}

    /// 收到退出请求, 邮箱循环结束前调用
    fn on_exit(&mut self, _ctx: &mut Context<Self>) {}
}

// ========== 地址 ==========

/// 类型化 actor 地址. 可随意克隆, actor 终止后发送会被静默丢弃
/// (日志可见), 地址不会被复用
pub struct Addr<A: Actor> {
    name: Arc<str>,
    tx: Sender<Envelope<A>>,
}

impl<A: Actor> Clone for Addr<A> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            tx: self.tx.clone(),
        }
    }
}

impl<A: Actor> Addr<A> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 发后即忘. 从不阻塞调用方
    pub fn tell(&self, msg: A::Msg) {
        if self.tx.send(Envelope::Tell(msg)).is_err() {
            debug!(actor = %self.name, "mailbox closed, tell dropped");
        }
    }

    /// 请求/应答. 续延在编译期强制存在, 应答作为一条独立消息
    /// 回到调用方邮箱, 发送方从不阻塞
    pub fn ask(&self, msg: A::Msg, k: Continuation<A::Reply>) {
        if self.tx.send(Envelope::Ask(msg, k)).is_err() {
            debug!(actor = %self.name, "mailbox closed, ask dropped");
        }
    }

    /// 类型擦除的控制句柄 (退出广播用)
    pub fn control(&self) -> ControlAddr {
        let tx = self.tx.clone();
        ControlAddr {
            name: self.name.clone(),
            exit: Arc::new(move || tx.send(Envelope::ExitRequest).is_ok()),
        }
    }

    pub(crate) fn send_child_ready(&self, child: String) {
        let _ = self.tx.send(Envelope::ChildReady(child));
    }

    pub(crate) fn send_child_exited(&self, child: String) {
        let _ = self.tx.send(Envelope::ChildExited(child));
    }
}

/// 去类型化控制地址: 只能请求退出
#[derive(Clone)]
pub struct ControlAddr {
    name: Arc<str>,
    exit: Arc<dyn Fn() -> bool + Send + Sync>,
}

impl ControlAddr {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 投递退出请求. 返回 false 表示 actor 已经终止
    pub fn exit_request(&self) -> bool {
        (self.exit)()
    }
}

// ========== 执行上下文 ==========

/// 邮箱循环传给处理函数的上下文: 自身地址, 子 actor 管理, 唤醒预约
pub struct Context<A: Actor> {
    name: Arc<str>,
    self_tx: Sender<Envelope<A>>,
    children: Vec<ControlAddr>,
    next_wakeup: Option<Instant>,
    exiting: bool,
}

impl<A: Actor> Context<A> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 自身地址 (发给别人, 让应答回到自己邮箱)
    pub fn addr(&self) -> Addr<A> {
        Addr {
            name: self.name.clone(),
            tx: self.self_tx.clone(),
        }
    }

    /// 构造一个续延: 应答到达时经 map 包装成自己的消息类型,
    /// 作为一条普通消息回到自己的邮箱被调度
    pub fn callback<R: Send + 'static>(
        &self,
        map: impl FnOnce(R) -> A::Msg + Send + 'static,
    ) -> Continuation<R> {
        let tx = self.self_tx.clone();
        let name = self.name.clone();
        Continuation::new(move |r| {
            if tx.send(Envelope::Tell(map(r))).is_err() {
                debug!(actor = %name, "caller gone, reply dropped");
            }
        })
    }

    /// 生成子 actor. 子线程先执行 initialize, 完成后父 actor 收到
    /// on_child_ready 通知; 子线程结束时父 actor 收到 on_child_exited.
    /// 父 actor 退出时自动向所有子 actor 级联退出请求
    pub fn spawn_child<C: Actor>(&mut self, name: &str, child: C) -> Addr<C> {
        let parent = self.addr();
        let ready = {
            let parent = parent.clone();
            move |child_name: String| parent.send_child_ready(child_name)
        };
        let exited = move |child_name: String| parent.send_child_exited(child_name);
        let (addr, _handle) = spawn_inner(name, child, Some(Box::new(ready)), Some(Box::new(exited)));
        self.children.push(addr.control());
        addr
    }

    /// 预约一次唤醒, 到点回调 on_wakeup. 重复预约取最新值
    pub fn wakeup_after(&mut self, delay: Duration) {
        self.next_wakeup = Some(Instant::now() + delay);
    }

    /// 取消已预约的唤醒
    pub fn cancel_wakeup(&mut self) {
        self.next_wakeup = None;
    }

    /// 主动请求结束自己的邮箱循环 (与收到退出请求等价)
    pub fn stop(&mut self) {
        self.exiting = true;
    }

    pub fn children(&self) -> &[ControlAddr] {
        &self.children
    }
}

// ========== 启动与邮箱循环 ==========

type LifecycleHook = Box<dyn FnOnce(String) + Send>;

/// 启动一个顶级 actor (无父). 返回地址与线程句柄
pub fn spawn<A: Actor>(name: &str, actor: A) -> (Addr<A>, JoinHandle<()>) {
    spawn_inner(name, actor, None, None)
}

fn spawn_inner<A: Actor>(
    name: &str,
    actor: A,
    ready: Option<LifecycleHook>,
    exited: Option<LifecycleHook>,
) -> (Addr<A>, JoinHandle<()>) {
    let (tx, rx) = unbounded::<Envelope<A>>();
    let name: Arc<str> = Arc::from(name);
    let addr = Addr {
        name: name.clone(),
        tx: tx.clone(),
    };

    let thread_name = name.to_string();
    let handle = std::thread::Builder::new()
        .name(thread_name)
        .spawn(move || run_loop(actor, name, tx, rx, ready, exited))
        .expect("failed to spawn actor thread");

    (addr, handle)
}

fn run_loop<A: Actor>(
    mut actor: A,
    name: Arc<str>,
    self_tx: Sender<Envelope<A>>,
    rx: Receiver<Envelope<A>>,
    ready: Option<LifecycleHook>,
    exited: Option<LifecycleHook>,
) {
    let mut ctx = Context {
        name: name.clone(),
        self_tx,
        children: Vec::new(),
        next_wakeup: None,
        exiting: false,
    };

    actor.initialize(&mut ctx);
    if let Some(hook) = ready {
        hook(name.to_string());
    }

    while !ctx.exiting {
        let envelope = match ctx.next_wakeup {
            Some(deadline) => match rx.recv_deadline(deadline) {
                Ok(e) => e,
                Err(RecvTimeoutError::Timeout) => {
                    ctx.next_wakeup = None;
                    actor.on_wakeup(&mut ctx);
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            },
            None => match rx.recv() {
                Ok(e) => e,
                Err(_) => break,
            },
        };

        match envelope {
            Envelope::Tell(msg) => {
                actor.handle(msg, &mut ctx);
            }
            Envelope::Ask(msg, k) => match actor.handle(msg, &mut ctx) {
                Some(reply) => k.complete(reply),
                None => warn!(actor = %name, "ask produced no reply, request dropped"),
            },
            Envelope::ExitRequest => {
                ctx.exiting = true;
            }
            Envelope::ChildReady(child) => actor.on_child_ready(&child, &mut ctx),
            Envelope::ChildExited(child) => actor.on_child_exited(&child, &mut ctx),
        }
    }

    actor.on_exit(&mut ctx);

    // 深度优先级联: 先让直接子 actor 退出, 它们各自再传给孙辈
    for child in ctx.children.drain(..) {
        child.exit_request();
    }

    if let Some(hook) = exited {
        hook(name.to_string());
    }
    debug!(actor = %name, "mailbox loop ended");
}
