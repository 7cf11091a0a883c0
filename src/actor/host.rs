//! Actor 主持者: 雇佣, 寻址, 停机
//! Actor host: hiring, addressing, shutdown
//!
//! Host 拥有注册表和全部顶级 actor 线程句柄. 寻址解析失败时
//! 记日志并丢弃消息 (发后即忘的降级语义), 调用方不感知错误

use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{info, warn};

use super::mailbox::{spawn, Actor, Addr, Continuation};
use super::registry::Registry;

/// 消息投递目标
/// Name: 组内一个名字; Group: 整组组播; All: 所有组的同类型成员
pub enum Target<'a> {
    Name(&'a str),
    Group,
    All,
}

pub struct Host {
    registry: Registry,
    handles: Vec<JoinHandle<()>>,
}

impl Default for Host {
    fn default() -> Self {
        Self::new()
    }
}

impl Host {
    pub fn new() -> Self {
        Self {
            registry: Registry::new(),
            handles: Vec::new(),
        }
    }

    /// 雇一个顶级 actor 并注册到 (group, name).
    /// 名字已存在时返回既有地址 (注册表记日志)
    pub fn hire<A: Actor>(&mut self, group: &str, name: &str, actor: A) -> Addr<A> {
        if self.registry.contains(group, name) {
            if let Some(existing) = self.registry.lookup::<A>(group, name) {
                warn!(group, name, "hire: name already exists, returning existing address");
                return existing;
            }
        }
        let (addr, handle) = spawn(name, actor);
        self.registry.insert(group, name, addr.clone());
        self.handles.push(handle);
        addr
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    /// 发后即忘寻址投递. 目标不存在时静默丢弃
    pub fn tell<A: Actor>(&self, group: &str, target: Target<'_>, msg: A::Msg)
    where
        A::Msg: Clone,
    {
        match target {
            Target::Name(name) => {
                if let Some(addr) = self.registry.lookup::<A>(group, name) {
                    addr.tell(msg);
                }
            }
            Target::Group => {
                for addr in self.registry.members::<A>(group) {
                    addr.tell(msg.clone());
                }
            }
            Target::All => {
                for addr in self.registry.members_everywhere::<A>() {
                    addr.tell(msg.clone());
                }
            }
        }
    }

    /// 单名字投递, 消息不要求可克隆 (组播才需要克隆)
    pub fn tell_one<A: Actor>(&self, group: &str, name: &str, msg: A::Msg) {
        if let Some(addr) = self.registry.lookup::<A>(group, name) {
            addr.tell(msg);
        }
    }

    /// 请求模式寻址投递 (单个名字). 目标不存在时续延被丢弃,
    /// 调用方永远收不到应答 —— 和发后即忘一样的降级语义
    pub fn ask<A: Actor>(
        &self,
        group: &str,
        name: &str,
        msg: A::Msg,
        k: Continuation<A::Reply>,
    ) {
        if let Some(addr) = self.registry.lookup::<A>(group, name) {
            addr.ask(msg, k);
        }
    }

    /// 停机: 向全体注册 actor 广播退出请求, 然后尽力等待线程结束
    pub fn shutdown(mut self) {
        info!("host shutdown: broadcasting exit to all actors");
        for control in self.registry.controls() {
            control.exit_request();
        }
        for handle in self.handles.drain(..) {
            // 子 actor 由父级联, 这里只等顶级线程
            if handle.join().is_err() {
                warn!("actor thread panicked during shutdown");
            }
        }
    }

    /// 带上限的停机, 避免某个 actor 卡死拖住整个进程
    pub fn shutdown_within(self, grace: Duration) {
        let (tx, rx) = crossbeam_channel::bounded(1);
        std::thread::spawn(move || {
            self.shutdown();
            let _ = tx.send(());
        });
        if rx.recv_timeout(grace).is_err() {
            warn!("shutdown did not finish within {:?}, detaching", grace);
        }
    }
}
