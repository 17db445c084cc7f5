//! 传输事件定义
//!
//! 入站与出站事件各为一个封闭的 tagged union，在传输边界解码后
//! 由网关做穷尽匹配分发，保证新增事件类型在编译期暴露出来。
//! 线上的事件名沿用客户端既有的词汇（`addUser`、`receiveMessage` 等）。

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{MessageEnvelope, MessageType, NotificationRecord, PresenceRecord, UserStatus};

/// 入站事件（客户端 → 服务端）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    /// 绑定会话到用户身份
    #[serde(rename = "addUser", rename_all = "camelCase")]
    AddUser { user_id: String },

    /// 直发消息（遗留路径：先持久化再路由）
    #[serde(rename = "sendMessage", rename_all = "camelCase")]
    SendMessage {
        sender_id: String,
        #[serde(default)]
        receiver_id: Option<String>,
        #[serde(default)]
        group_id: Option<String>,
        content: String,
        #[serde(default)]
        message_type: Option<MessageType>,
        #[serde(default)]
        media_url: Option<String>,
    },

    /// 输入状态变化
    #[serde(rename = "typing", rename_all = "camelCase")]
    Typing {
        conversation_id: String,
        user_id: String,
        is_typing: bool,
    },

    /// 显式状态变更
    #[serde(rename = "updatePresence", rename_all = "camelCase")]
    UpdatePresence { user_id: String, status: UserStatus },

    /// 呼叫发起（offer）
    #[serde(rename = "callUser", rename_all = "camelCase")]
    CallUser {
        user_to_call: String,
        signal_data: serde_json::Value,
        from_user: String,
        #[serde(default)]
        name: String,
    },

    /// 被叫应答（answer）
    #[serde(rename = "answerCall", rename_all = "camelCase")]
    AnswerCall {
        to: String,
        signal: serde_json::Value,
        #[serde(default)]
        call_id: Option<Uuid>,
    },

    /// 挂断或拒接
    #[serde(rename = "endCall", rename_all = "camelCase")]
    EndCall {
        to: String,
        #[serde(default)]
        call_id: Option<Uuid>,
    },
}

/// 出站事件（服务端 → 客户端）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    /// 消息投递推送
    #[serde(rename = "receiveMessage")]
    ReceiveMessage(MessageEnvelope),

    /// 会话当前输入中的用户集合
    #[serde(rename = "typingUpdate", rename_all = "camelCase")]
    TypingUpdate {
        conversation_id: String,
        typing_users: Vec<String>,
    },

    /// 在线状态变化广播
    #[serde(rename = "userPresenceUpdate")]
    UserPresenceUpdate(PresenceRecord),

    /// 新通知推送
    #[serde(rename = "new_notification")]
    NewNotification(NotificationRecord),

    /// 转发给被叫的呼叫 offer
    #[serde(rename = "callUser", rename_all = "camelCase")]
    CallOffer {
        call_id: Uuid,
        signal_data: serde_json::Value,
        from_user: String,
        name: String,
    },

    /// 转发给主叫的应答信令
    #[serde(rename = "callAccepted", rename_all = "camelCase")]
    CallAccepted {
        call_id: Uuid,
        signal: serde_json::Value,
    },

    /// 呼叫建立失败
    #[serde(rename = "callFailed", rename_all = "camelCase")]
    CallFailed { reason: String },

    /// 对端挂断通知
    #[serde(rename = "callEnded")]
    CallEnded,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_event_decodes_legacy_wire_names() {
        let raw = r#"{"event":"addUser","data":{"userId":"u1"}}"#;
        let event: ClientEvent = serde_json::from_str(raw).unwrap();
        match event {
            ClientEvent::AddUser { user_id } => assert_eq!(user_id, "u1"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn typing_event_round_trips() {
        let raw = r#"{"event":"typing","data":{"conversationId":"a:b","userId":"a","isTyping":true}}"#;
        let event: ClientEvent = serde_json::from_str(raw).unwrap();
        let encoded = serde_json::to_string(&event).unwrap();
        assert!(encoded.contains("\"conversationId\""));
        assert!(encoded.contains("\"isTyping\""));
    }

    #[test]
    fn call_offer_forwards_under_call_user_name() {
        let event = ServerEvent::CallOffer {
            call_id: Uuid::new_v4(),
            signal_data: serde_json::json!({"sdp": "offer"}),
            from_user: "alice".to_string(),
            name: "Alice".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "callUser");
        assert_eq!(json["data"]["fromUser"], "alice");
    }
}
