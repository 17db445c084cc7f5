//! 进程内协作方实现
//!
//! 用于测试与本地装配，不做任何持久化。

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::{MessageEnvelope, NotificationKind, NotificationRecord, PresenceRecord};

use super::{GroupRoster, MessageStore, NotificationStore, PresenceStore};

/// 进程内消息日志
#[derive(Default)]
pub struct InMemoryMessageStore {
    messages: RwLock<Vec<MessageEnvelope>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 已保存消息的快照
    pub async fn saved(&self) -> Vec<MessageEnvelope> {
        self.messages.read().await.clone()
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn save_message(&self, message: &MessageEnvelope) -> anyhow::Result<()> {
        self.messages.write().await.push(message.clone());
        Ok(())
    }
}

/// 进程内群组名册
#[derive(Default)]
pub struct InMemoryGroupRoster {
    groups: DashMap<String, Vec<String>>,
}

impl InMemoryGroupRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册一个群组及其成员
    pub fn insert_group(&self, group_id: impl Into<String>, members: Vec<String>) {
        self.groups.insert(group_id.into(), members);
    }
}

#[async_trait]
impl GroupRoster for InMemoryGroupRoster {
    async fn find_group_members(&self, group_id: &str) -> anyhow::Result<Vec<String>> {
        self.groups
            .get(group_id)
            .map(|members| members.clone())
            .ok_or_else(|| anyhow::anyhow!("Group not found: {}", group_id))
    }
}

/// 进程内用户在线状态存储
#[derive(Default)]
pub struct InMemoryPresenceStore {
    records: DashMap<String, PresenceRecord>,
}

impl InMemoryPresenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 读取写穿后的状态记录
    pub fn record(&self, user_id: &str) -> Option<PresenceRecord> {
        self.records.get(user_id).map(|r| r.clone())
    }
}

#[async_trait]
impl PresenceStore for InMemoryPresenceStore {
    async fn update_user_presence(&self, record: &PresenceRecord) -> anyhow::Result<()> {
        self.records.insert(record.user_id.clone(), record.clone());
        Ok(())
    }
}

/// 进程内通知存储
#[derive(Default)]
pub struct InMemoryNotificationStore {
    notifications: RwLock<Vec<NotificationRecord>>,
}

impl InMemoryNotificationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 已保存通知的快照
    pub async fn saved(&self) -> Vec<NotificationRecord> {
        self.notifications.read().await.clone()
    }

    /// 把指定通知标记为已读（已读标记由范围外的 REST 层变更，
    /// 这里仅为测试提供等价入口）
    pub async fn mark_read(&self, id: Uuid) -> bool {
        let mut notifications = self.notifications.write().await;
        match notifications.iter_mut().find(|n| n.id == id) {
            Some(record) => {
                record.read = true;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl NotificationStore for InMemoryNotificationStore {
    async fn create_notification(&self, record: &NotificationRecord) -> anyhow::Result<()> {
        self.notifications.write().await.push(record.clone());
        Ok(())
    }

    async fn find_unread_notification(
        &self,
        recipient_id: &str,
        sender_id: &str,
        kind: NotificationKind,
    ) -> anyhow::Result<Option<NotificationRecord>> {
        let notifications = self.notifications.read().await;
        Ok(notifications
            .iter()
            .find(|n| {
                !n.read
                    && n.recipient_id == recipient_id
                    && n.sender_id == sender_id
                    && n.kind == kind
            })
            .cloned())
    }
}
