//! 通知扇出
//!
//! 从事件（消息/点赞/评论）派生通知记录，message 类型按
//! (recipient, sender) 未读去重，推送给在线接收方并写穿存储。
//! 去重的查改序列在每个 (recipient, sender) 键上串行化，
//! 避免并发发送同时观察到"无未读通知"而重复创建。

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{RealtimeError, RealtimeResult};
use crate::events::ServerEvent;
use crate::metrics::RealtimeMetrics;
use crate::models::{NotificationKind, NotificationRecord};
use crate::registry::ConnectionRegistry;
use crate::repository::NotificationStore;

/// 通知扇出
pub struct NotificationFanout {
    registry: Arc<ConnectionRegistry>,
    store: Arc<dyn NotificationStore>,
    /// (recipient, sender) 对的串行化写锁
    pair_locks: DashMap<String, Arc<Mutex<()>>>,
    metrics: Arc<RealtimeMetrics>,
}

impl NotificationFanout {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        store: Arc<dyn NotificationStore>,
        metrics: Arc<RealtimeMetrics>,
    ) -> Self {
        Self {
            registry,
            store,
            pair_locks: DashMap::new(),
            metrics,
        }
    }

    /// 派生并分发一条通知
    ///
    /// message 类型：若存在同对端的未读通知则抑制（不建新记录、不推送）。
    /// like/comment 类型：不去重，必须携带 related_post_id。
    /// 返回创建的记录；被抑制时返回 None。
    pub async fn notify(
        &self,
        kind: NotificationKind,
        recipient_id: &str,
        sender_id: &str,
        related_post_id: Option<Uuid>,
    ) -> RealtimeResult<Option<NotificationRecord>> {
        match kind {
            NotificationKind::Like | NotificationKind::Comment if related_post_id.is_none() => {
                return Err(RealtimeError::InvalidParameter(format!(
                    "{:?} notification requires related_post_id",
                    kind
                )));
            }
            _ => {}
        }

        if kind == NotificationKind::Message {
            let key = format!("{}|{}", recipient_id, sender_id);
            let lock = self.pair_lock(&key);
            let guard = lock.lock().await;
            let result = self
                .create_and_push(kind, recipient_id, sender_id, related_post_id, true)
                .await;
            drop(guard);
            // 无其他持有者（map 内一份 + 本地一份）时回收锁条目，
            // 避免锁表随出现过的 (recipient, sender) 对无界增长
            drop(lock);
            self.pair_locks
                .remove_if(&key, |_, lock| Arc::strong_count(lock) == 1);
            result
        } else {
            self.create_and_push(kind, recipient_id, sender_id, related_post_id, false)
                .await
        }
    }

    async fn create_and_push(
        &self,
        kind: NotificationKind,
        recipient_id: &str,
        sender_id: &str,
        related_post_id: Option<Uuid>,
        dedupe: bool,
    ) -> RealtimeResult<Option<NotificationRecord>> {
        if dedupe {
            let existing = self
                .store
                .find_unread_notification(recipient_id, sender_id, kind)
                .await?;
            if existing.is_some() {
                self.metrics.notifications_suppressed_total.inc();
                debug!(
                    recipient_id = %recipient_id,
                    sender_id = %sender_id,
                    "Unread notification exists, new one suppressed"
                );
                return Ok(None);
            }
        }

        let record = NotificationRecord {
            id: Uuid::new_v4(),
            recipient_id: recipient_id.to_string(),
            sender_id: sender_id.to_string(),
            kind,
            related_post_id,
            read: false,
            created_at: Utc::now(),
        };

        // 推送在前、持久化在后：接收方可能先看到消息再看到通知记录
        if let Some(session) = self.registry.resolve(recipient_id) {
            if session.push(ServerEvent::NewNotification(record.clone())) {
                self.metrics.notifications_pushed_total.inc();
            }
        } else {
            debug!(
                recipient_id = %recipient_id,
                "Recipient offline, notification persists for later retrieval"
            );
        }

        if let Err(err) = self.store.create_notification(&record).await {
            warn!(
                recipient_id = %recipient_id,
                sender_id = %sender_id,
                error = %err,
                "Failed to persist notification after push"
            );
        }

        Ok(Some(record))
    }

    fn pair_lock(&self, key: &str) -> Arc<Mutex<()>> {
        self.pair_locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
