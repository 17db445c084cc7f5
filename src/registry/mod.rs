//! 连接注册表
//!
//! 维护用户身份到会话句柄的绑定（每个用户至多一条，后注册者覆盖），
//! 以及会话ID到用户的反向索引。其它组件只读取绑定；绑定/解绑引发的
//! 在线状态变化由上层编排触发。

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::metrics::RealtimeMetrics;
use crate::session::SessionHandle;

/// 注册结果
#[derive(Debug)]
pub struct RegisterOutcome {
    /// 本次注册是否使用户从离线变为在线
    pub went_online: bool,
    /// 被覆盖的旧会话ID（后注册者覆盖时出现）
    pub displaced_session: Option<String>,
}

/// 连接注册表
pub struct ConnectionRegistry {
    /// user_id → 会话句柄
    bindings: DashMap<String, SessionHandle>,
    /// session_id → user_id 反向索引
    reverse: DashMap<String, String>,
    metrics: Arc<RealtimeMetrics>,
}

impl ConnectionRegistry {
    pub fn new(metrics: Arc<RealtimeMetrics>) -> Self {
        Self {
            bindings: DashMap::new(),
            reverse: DashMap::new(),
            metrics,
        }
    }

    /// 安装或覆盖用户绑定（后注册者覆盖）
    ///
    /// 被覆盖的旧会话保持连接但不再收到任何推送。该语义依赖客户端
    /// 不会为同一身份并发持有两条会话，覆盖发生时记录 warn 日志。
    pub fn register(&self, user_id: &str, session: SessionHandle) -> RegisterOutcome {
        let session_id = session.id().to_string();
        let previous = self.bindings.insert(user_id.to_string(), session);
        let went_online = previous.is_none();

        let displaced_session = match previous {
            Some(old) if old.id() != session_id => {
                self.reverse.remove(old.id());
                warn!(
                    user_id = %user_id,
                    old_session = %old.id(),
                    new_session = %session_id,
                    "Binding displaced by newer session, old session goes dark"
                );
                Some(old.id().to_string())
            }
            _ => None,
        };

        self.reverse.insert(session_id.clone(), user_id.to_string());
        self.metrics.connections_active.set(self.bindings.len() as i64);

        info!(
            user_id = %user_id,
            session_id = %session_id,
            "User session registered"
        );

        RegisterOutcome {
            went_online,
            displaced_session,
        }
    }

    /// 查询用户当前绑定的会话句柄，纯查找，不阻塞
    pub fn resolve(&self, user_id: &str) -> Option<SessionHandle> {
        self.bindings.get(user_id).map(|entry| entry.clone())
    }

    /// 用户当前是否在线（存在绑定）
    pub fn is_bound(&self, user_id: &str) -> bool {
        self.bindings.contains_key(user_id)
    }

    /// 通过反向索引查询会话对应的用户
    pub fn user_for_session(&self, session_id: &str) -> Option<String> {
        self.reverse.get(session_id).map(|entry| entry.clone())
    }

    /// 按会话ID解除绑定，返回被解绑的用户
    ///
    /// 幂等：重复解绑或解绑已被覆盖的旧会话返回 None，不影响现有绑定。
    pub fn unregister_session(&self, session_id: &str) -> Option<String> {
        let (_, user_id) = self.reverse.remove(session_id)?;
        let removed = self
            .bindings
            .remove_if(&user_id, |_, session| session.id() == session_id);
        self.metrics.connections_active.set(self.bindings.len() as i64);

        match removed {
            Some(_) => {
                info!(
                    user_id = %user_id,
                    session_id = %session_id,
                    "User session unregistered"
                );
                Some(user_id)
            }
            None => {
                debug!(
                    session_id = %session_id,
                    "Stale session unregistered without live binding"
                );
                None
            }
        }
    }

    /// 当前全部绑定的快照（user_id 与会话句柄）
    pub fn bindings_snapshot(&self) -> Vec<(String, SessionHandle)> {
        self.bindings
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// 当前绑定数
    pub fn bound_count(&self) -> usize {
        self.bindings.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ServerEvent;

    fn registry() -> ConnectionRegistry {
        ConnectionRegistry::new(Arc::new(RealtimeMetrics::new()))
    }

    /// 测试：后注册者覆盖，推送只到达最新会话
    #[tokio::test]
    async fn register_is_last_write_wins() {
        let registry = registry();
        let (session_a, mut rx_a) = SessionHandle::new("a");
        let (session_b, mut rx_b) = SessionHandle::new("b");

        let first = registry.register("u1", session_a);
        assert!(first.went_online);
        assert!(first.displaced_session.is_none());

        let second = registry.register("u1", session_b);
        assert!(!second.went_online);
        assert_eq!(second.displaced_session.as_deref(), Some("a"));

        let bound = registry.resolve("u1").unwrap();
        assert_eq!(bound.id(), "b");

        bound.push(ServerEvent::CallEnded);
        assert!(rx_b.recv().await.is_some());
        assert!(rx_a.try_recv().is_err());
    }

    /// 测试：解绑幂等，重复解绑不再返回用户
    #[tokio::test]
    async fn unregister_is_idempotent() {
        let registry = registry();
        let (session, _rx) = SessionHandle::new("a");
        registry.register("u1", session);

        assert_eq!(registry.unregister_session("a").as_deref(), Some("u1"));
        assert_eq!(registry.unregister_session("a"), None);
        assert_eq!(registry.unregister_session("never-bound"), None);
        assert!(!registry.is_bound("u1"));
    }

    /// 测试：被覆盖的旧会话解绑不影响新绑定
    #[tokio::test]
    async fn displaced_session_unbind_leaves_new_binding() {
        let registry = registry();
        let (session_a, _rx_a) = SessionHandle::new("a");
        let (session_b, _rx_b) = SessionHandle::new("b");
        registry.register("u1", session_a);
        registry.register("u1", session_b);

        // 旧会话的传输层断开晚于覆盖到达
        assert_eq!(registry.unregister_session("a"), None);
        assert!(registry.is_bound("u1"));
        assert_eq!(registry.resolve("u1").unwrap().id(), "b");
    }
}
