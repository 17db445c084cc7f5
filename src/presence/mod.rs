//! 在线状态跟踪器
//!
//! 根据注册表的绑定/解绑和显式状态变更维护在线状态记录，
//! 写穿到用户记录协作方，并向除本人外的所有在线会话广播。
//! 广播是 fire-and-forget 的 at-most-once 语义，丢失的广播由
//! 下一次状态变化或客户端轮询自愈。

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::events::ServerEvent;
use crate::metrics::RealtimeMetrics;
use crate::models::{PresenceRecord, UserStatus};
use crate::registry::ConnectionRegistry;
use crate::repository::PresenceStore;

/// 在线状态跟踪器
pub struct PresenceTracker {
    registry: Arc<ConnectionRegistry>,
    store: Arc<dyn PresenceStore>,
    /// 内存中的权威状态记录
    records: DashMap<String, PresenceRecord>,
    metrics: Arc<RealtimeMetrics>,
}

impl PresenceTracker {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        store: Arc<dyn PresenceStore>,
        metrics: Arc<RealtimeMetrics>,
    ) -> Self {
        Self {
            registry,
            store,
            records: DashMap::new(),
            metrics,
        }
    }

    /// 用户绑定会话（上线）
    pub async fn on_bind(&self, user_id: &str) {
        self.apply(user_id, true, UserStatus::Online).await;
    }

    /// 用户解除绑定（下线）
    pub async fn on_unbind(&self, user_id: &str) {
        self.apply(user_id, false, UserStatus::Offline).await;
    }

    /// 显式状态变更
    pub async fn on_status_change(&self, user_id: &str, status: UserStatus) {
        let is_online = self.registry.is_bound(user_id);
        self.apply(user_id, is_online, status).await;
    }

    /// 读取用户当前的内存状态记录
    pub fn record(&self, user_id: &str) -> Option<PresenceRecord> {
        self.records.get(user_id).map(|r| r.clone())
    }

    /// 更新记录、广播并写穿
    async fn apply(&self, user_id: &str, is_online: bool, status: UserStatus) {
        let record = PresenceRecord {
            user_id: user_id.to_string(),
            is_online,
            status,
            last_seen: Utc::now(),
        };
        self.records.insert(user_id.to_string(), record.clone());

        self.broadcast(&record);

        // 推送在前、持久化在后；写穿失败只记录日志（§错误处理）
        if let Err(err) = self.store.update_user_presence(&record).await {
            warn!(
                user_id = %user_id,
                error = %err,
                "Failed to write presence through to user store"
            );
        }
    }

    /// 向除本人外的所有在线会话广播状态变化
    fn broadcast(&self, record: &PresenceRecord) {
        let mut pushed = 0usize;
        for (user_id, session) in self.registry.bindings_snapshot() {
            if user_id == record.user_id {
                continue;
            }
            if session.push(ServerEvent::UserPresenceUpdate(record.clone())) {
                pushed += 1;
            }
        }
        self.metrics.presence_broadcast_total.inc();
        debug!(
            user_id = %record.user_id,
            is_online = record.is_online,
            status = ?record.status,
            receivers = pushed,
            "Presence update broadcast"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryPresenceStore;
    use crate::session::SessionHandle;

    fn tracker() -> (
        Arc<ConnectionRegistry>,
        Arc<InMemoryPresenceStore>,
        PresenceTracker,
    ) {
        let metrics = Arc::new(RealtimeMetrics::new());
        let registry = Arc::new(ConnectionRegistry::new(metrics.clone()));
        let store = Arc::new(InMemoryPresenceStore::new());
        let tracker = PresenceTracker::new(registry.clone(), store.clone(), metrics);
        (registry, store, tracker)
    }

    /// 测试：广播到达除本人外的所有在线会话
    #[tokio::test]
    async fn broadcast_reaches_everyone_but_subject() {
        let (registry, _store, tracker) = tracker();
        let (session_a, mut rx_a) = SessionHandle::new("a");
        let (session_b, mut rx_b) = SessionHandle::new("b");
        let (session_c, mut rx_c) = SessionHandle::new("c");
        registry.register("alice", session_a);
        registry.register("bob", session_b);
        registry.register("carol", session_c);

        tracker.on_status_change("alice", UserStatus::Busy).await;

        assert!(rx_a.try_recv().is_err());
        for rx in [&mut rx_b, &mut rx_c] {
            match rx.try_recv() {
                Ok(ServerEvent::UserPresenceUpdate(record)) => {
                    assert_eq!(record.user_id, "alice");
                    assert!(record.is_online);
                    assert_eq!(record.status, UserStatus::Busy);
                }
                other => panic!("expected presence update, got {:?}", other),
            }
        }
    }

    /// 测试：状态写穿到用户记录协作方
    #[tokio::test]
    async fn presence_is_written_through() {
        let (registry, store, tracker) = tracker();
        let (session, _rx) = SessionHandle::new("a");
        registry.register("alice", session);

        tracker.on_bind("alice").await;
        let record = store.record("alice").unwrap();
        assert!(record.is_online);
        assert_eq!(record.status, UserStatus::Online);

        tracker.on_unbind("alice").await;
        let record = store.record("alice").unwrap();
        assert!(!record.is_online);
        assert_eq!(record.status, UserStatus::Offline);
    }
}
