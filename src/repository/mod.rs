//! 持久化协作方接口
//!
//! 核心不拥有任何持久化实现：消息、群组、用户与通知的存储由外部
//! 服务提供，这里只定义消费侧的最小接口。`memory` 子模块提供
//! 进程内实现，用于测试与本地装配。

use async_trait::async_trait;

use crate::models::{MessageEnvelope, NotificationKind, NotificationRecord, PresenceRecord};

mod memory;
pub use memory::{
    InMemoryGroupRoster, InMemoryMessageStore, InMemoryNotificationStore, InMemoryPresenceStore,
};

/// 消息日志存储
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// 持久化一条消息（含未接来电与通话记录）
    async fn save_message(&self, message: &MessageEnvelope) -> anyhow::Result<()>;
}

/// 群组成员名册
#[async_trait]
pub trait GroupRoster: Send + Sync {
    /// 查询群组成员的用户ID列表
    async fn find_group_members(&self, group_id: &str) -> anyhow::Result<Vec<String>>;
}

/// 用户在线状态的写穿存储
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// 把最新在线状态写入用户记录
    async fn update_user_presence(&self, record: &PresenceRecord) -> anyhow::Result<()>;
}

/// 通知记录存储
#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// 持久化一条通知记录
    async fn create_notification(&self, record: &NotificationRecord) -> anyhow::Result<()>;

    /// 查询指定 (recipient, sender, kind) 的未读通知
    async fn find_unread_notification(
        &self,
        recipient_id: &str,
        sender_id: &str,
        kind: NotificationKind,
    ) -> anyhow::Result<Option<NotificationRecord>>;
}
