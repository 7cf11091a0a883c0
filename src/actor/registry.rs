//! (组, 名字) → 地址 的注册表
//! (group, name) → address registry
//!
//! 名字在组内唯一; 组在实践中是同一 actor 类型的同构集合,
//! 用于组播和按名解析. 解析失败记日志后丢弃, 不向调用方抛错

use std::any::Any;
use std::collections::HashMap;

use tracing::{info, warn};

use super::mailbox::{Actor, Addr, ControlAddr};

/// 注册表里的一个成员: 类型化地址 (Any 装箱) + 控制句柄
struct Entry {
    typed: Box<dyn Any + Send>,
    control: ControlAddr,
}

/// 归属主持者 (Host) 所有的注册表, 无全局/静态状态
#[derive(Default)]
pub struct Registry {
    groups: HashMap<String, HashMap<String, Entry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 不存在则静默创建组
    fn check_group(&mut self, group: &str) -> &mut HashMap<String, Entry> {
        if !self.groups.contains_key(group) {
            info!(group, "creating new group");
            self.groups.insert(group.to_string(), HashMap::new());
        }
        self.groups.get_mut(group).unwrap()
    }

    /// 注册成员. 名字冲突时保留旧地址并返回 false
    pub fn insert<A: Actor>(&mut self, group: &str, name: &str, addr: Addr<A>) -> bool {
        let members = self.check_group(group);
        if members.contains_key(name) {
            warn!(group, name, "name already registered in group, keeping the old address");
            return false;
        }
        members.insert(
            name.to_string(),
            Entry {
                control: addr.control(),
                typed: Box::new(addr),
            },
        );
        true
    }

    /// 安静的存在性检查 (不产生解析失败日志)
    pub fn contains(&self, group: &str, name: &str) -> bool {
        self.groups
            .get(group)
            .map_or(false, |m| m.contains_key(name))
    }

    pub fn remove(&mut self, group: &str, name: &str) {
        if let Some(members) = self.groups.get_mut(group) {
            members.remove(name);
        }
    }

    /// 按名解析一个地址. 未知组/名或类型不符: 记日志, 返回 None
    pub fn lookup<A: Actor>(&self, group: &str, name: &str) -> Option<Addr<A>> {
        let Some(members) = self.groups.get(group) else {
            info!(group, name, "unknown group, message will be dropped");
            return None;
        };
        let Some(entry) = members.get(name) else {
            info!(group, name, "actor is not in the group, message will be dropped");
            return None;
        };
        match entry.typed.downcast_ref::<Addr<A>>() {
            Some(addr) => Some(addr.clone()),
            None => {
                warn!(group, name, "actor registered with a different message type");
                None
            }
        }
    }

    /// 组内全部同类型成员 (组播用)
    pub fn members<A: Actor>(&self, group: &str) -> Vec<Addr<A>> {
        let Some(members) = self.groups.get(group) else {
            info!(group, "unknown group, broadcast dropped");
            return Vec::new();
        };
        members
            .values()
            .filter_map(|e| e.typed.downcast_ref::<Addr<A>>().cloned())
            .collect()
    }

    /// 所有组中类型为 A 的成员 ("all" 哨兵寻址)
    pub fn members_everywhere<A: Actor>(&self) -> Vec<Addr<A>> {
        self.groups
            .values()
            .flat_map(|m| m.values())
            .filter_map(|e| e.typed.downcast_ref::<Addr<A>>().cloned())
            .collect()
    }

    /// 全体成员的控制句柄 (停机广播)
    pub fn controls(&self) -> Vec<ControlAddr> {
        self.groups
            .values()
            .flat_map(|m| m.values())
            .map(|e| e.control.clone())
            .collect()
    }

    pub fn group_len(&self, group: &str) -> usize {
        self.groups.get(group).map_or(0, |m| m.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::mailbox::{spawn, Context, Continuation};
    use std::time::Duration;

    struct Counter {
        hits: u32,
    }

    enum CounterMsg {
        Bump,
        Get,
    }

    impl Actor for Counter {
        type Msg = CounterMsg;
        type Reply = u32;

        fn handle(&mut self, msg: CounterMsg, _ctx: &mut Context<Self>) -> Option<u32> {
            match msg {
                CounterMsg::Bump => {
                    self.hits += 1;
                    None
                }
                CounterMsg::Get => Some(self.hits),
            }
        }
    }

    fn hits(addr: &Addr<Counter>) -> u32 {
        let (k, rx) = Continuation::channel();
        addr.ask(CounterMsg::Get, k);
        rx.recv_timeout(Duration::from_secs(5)).unwrap()
    }

    // 未知名字/组: 静默丢弃而不是报错
    #[test]
    fn unknown_name_resolves_to_none() {
        let mut reg = Registry::new();
        let (addr, _h) = spawn("a", Counter { hits: 0 });
        reg.insert("workers", "a", addr);

        assert!(reg.lookup::<Counter>("workers", "missing").is_none());
        assert!(reg.lookup::<Counter>("nobody", "a").is_none());
        assert!(reg.members::<Counter>("nobody").is_empty());
    }

    // 同组重名: 保留旧注册
    #[test]
    fn duplicate_name_keeps_first_registration() {
        let mut reg = Registry::new();
        let (a1, _h1) = spawn("a", Counter { hits: 0 });
        let (a2, _h2) = spawn("a2", Counter { hits: 0 });
        assert!(reg.insert("workers", "a", a1.clone()));
        assert!(!reg.insert("workers", "a", a2));

        let resolved = reg.lookup::<Counter>("workers", "a").unwrap();
        resolved.tell(CounterMsg::Bump);
        assert_eq!(hits(&a1), 1);
    }

    // 组播覆盖组内全部成员
    #[test]
    fn group_broadcast_reaches_all_members() {
        let mut reg = Registry::new();
        let (a, _ha) = spawn("a", Counter { hits: 0 });
        let (b, _hb) = spawn("b", Counter { hits: 0 });
        reg.insert("workers", "a", a.clone());
        reg.insert("workers", "b", b.clone());

        for m in reg.members::<Counter>("workers") {
            m.tell(CounterMsg::Bump);
        }
        assert_eq!(hits(&a), 1);
        assert_eq!(hits(&b), 1);
    }
}
