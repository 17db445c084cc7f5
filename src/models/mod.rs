//! 实时核心共享数据模型
//!
//! 消息信封由持久化协作方生成，核心只负责路由；
//! 在线状态与通知记录由核心内各组件维护。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 用户在线状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Online,
    Away,
    Busy,
    Offline,
}

/// 消息类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Text,
    Image,
    Video,
    Audio,
    File,
    Document,
    MissedCall,
    CallLog,
}

/// 消息信封
///
/// 单聊消息携带 `receiver_id`，群聊消息携带 `group_id`，两者互斥。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEnvelope {
    pub id: Uuid,
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    pub content: String,
    pub message_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    /// 文件大小（字节）
    #[serde(default)]
    pub file_size: u64,
    /// 音视频时长（秒）
    #[serde(default)]
    pub duration: u64,
    pub timestamp: DateTime<Utc>,
}

impl MessageEnvelope {
    /// 构造单聊文本消息
    pub fn direct_text(
        sender_id: impl Into<String>,
        receiver_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender_id: sender_id.into(),
            receiver_id: Some(receiver_id.into()),
            group_id: None,
            content: content.into(),
            message_type: MessageType::Text,
            media_url: None,
            file_name: None,
            file_size: 0,
            duration: 0,
            timestamp: Utc::now(),
        }
    }

    /// 构造未接来电记录，收件人为主叫方
    pub fn missed_call(caller_id: impl Into<String>, callee_id: impl Into<String>) -> Self {
        let callee_id = callee_id.into();
        Self {
            id: Uuid::new_v4(),
            sender_id: callee_id,
            receiver_id: Some(caller_id.into()),
            group_id: None,
            content: "Missed call".to_string(),
            message_type: MessageType::MissedCall,
            media_url: None,
            file_name: None,
            file_size: 0,
            duration: 0,
            timestamp: Utc::now(),
        }
    }

    /// 构造通话结束记录，携带通话时长（秒）
    pub fn call_log(
        sender_id: impl Into<String>,
        receiver_id: impl Into<String>,
        duration_secs: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender_id: sender_id.into(),
            receiver_id: Some(receiver_id.into()),
            group_id: None,
            content: format!("Call ended - Duration: {}s", duration_secs),
            message_type: MessageType::CallLog,
            media_url: None,
            file_name: None,
            file_size: 0,
            duration: duration_secs,
            timestamp: Utc::now(),
        }
    }
}

/// 在线状态记录
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    /// 用户ID
    pub user_id: String,
    /// 是否在线
    pub is_online: bool,
    /// 展示状态
    pub status: UserStatus,
    /// 最后活跃时间
    pub last_seen: DateTime<Utc>,
}

/// 通知类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Message,
    Like,
    Comment,
}

/// 通知记录
///
/// 不变式：同一 (recipient, sender) 对的 message 类型未读通知至多一条。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRecord {
    pub id: Uuid,
    pub recipient_id: String,
    pub sender_id: String,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_post_id: Option<Uuid>,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

/// 由两个参与者ID生成确定性的单聊会话标识
///
/// 参与者顺序无关：`(a, b)` 与 `(b, a)` 生成同一个标识。
pub fn direct_conversation_id(a: &str, b: &str) -> String {
    if a <= b {
        format!("{}:{}", a, b)
    } else {
        format!("{}:{}", b, a)
    }
}

/// 从单聊会话标识解析出两个参与者ID
///
/// 群聊会话标识不含分隔符，返回 None，由协作方解析成员列表。
pub fn direct_participants(conversation_id: &str) -> Option<(&str, &str)> {
    let mut parts = conversation_id.splitn(2, ':');
    match (parts.next(), parts.next()) {
        (Some(a), Some(b)) if !a.is_empty() && !b.is_empty() => Some((a, b)),
        _ => None,
    }
}
