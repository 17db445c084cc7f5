//! 消息投递路由器
//!
//! 给定一条已持久化的消息信封，解析接收方集合（单聊对端或群成员），
//! 把消息推送到当前绑定的会话。实时通道上的投递是 best-effort 的
//! at-most-once：接收方离线不是错误，持久化由范围外的存储协作方保证。

use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{RealtimeError, RealtimeResult};
use crate::events::ServerEvent;
use crate::metrics::RealtimeMetrics;
use crate::models::MessageEnvelope;
use crate::registry::ConnectionRegistry;
use crate::repository::GroupRoster;

/// 消息投递路由器
pub struct MessageDeliveryRouter {
    registry: Arc<ConnectionRegistry>,
    groups: Arc<dyn GroupRoster>,
    metrics: Arc<RealtimeMetrics>,
}

impl MessageDeliveryRouter {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        groups: Arc<dyn GroupRoster>,
        metrics: Arc<RealtimeMetrics>,
    ) -> Self {
        Self {
            registry,
            groups,
            metrics,
        }
    }

    /// 投递一条消息，返回实际推送到的用户ID列表
    ///
    /// 部分成员离线是预期情况而非错误；调用顺序即投递顺序，
    /// 本组件不重排也不合并。
    pub async fn deliver(&self, message: &MessageEnvelope) -> RealtimeResult<Vec<String>> {
        if let Some(receiver_id) = &message.receiver_id {
            return Ok(self.push_to(receiver_id, message));
        }

        if let Some(group_id) = &message.group_id {
            let members = self.groups.find_group_members(group_id).await?;
            let mut delivered = Vec::new();
            for member in members {
                if member == message.sender_id {
                    continue;
                }
                delivered.extend(self.push_to(&member, message));
            }
            info!(
                message_id = %message.id,
                group_id = %group_id,
                delivered = delivered.len(),
                "Group message fanned out"
            );
            return Ok(delivered);
        }

        Err(RealtimeError::InvalidParameter(
            "message envelope has neither receiver_id nor group_id".to_string(),
        ))
    }

    /// 推送给单个用户，离线时返回空
    fn push_to(&self, user_id: &str, message: &MessageEnvelope) -> Vec<String> {
        match self.registry.resolve(user_id) {
            Some(session) => {
                if session.push(ServerEvent::ReceiveMessage(message.clone())) {
                    self.metrics.messages_delivered_total.inc();
                    vec![user_id.to_string()]
                } else {
                    Vec::new()
                }
            }
            None => {
                debug!(
                    message_id = %message.id,
                    user_id = %user_id,
                    "Recipient offline, message stays durable in store only"
                );
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryGroupRoster;
    use crate::session::SessionHandle;

    fn router() -> (
        Arc<ConnectionRegistry>,
        Arc<InMemoryGroupRoster>,
        MessageDeliveryRouter,
    ) {
        let metrics = Arc::new(RealtimeMetrics::new());
        let registry = Arc::new(ConnectionRegistry::new(metrics.clone()));
        let groups = Arc::new(InMemoryGroupRoster::new());
        let router = MessageDeliveryRouter::new(registry.clone(), groups.clone(), metrics);
        (registry, groups, router)
    }

    /// 测试：单聊推送只到达绑定的接收方，离线是 no-op
    #[tokio::test]
    async fn direct_delivery_respects_binding() {
        let (registry, _groups, router) = router();
        let (session, mut rx) = SessionHandle::new("b");
        registry.register("bob", session);

        let message = MessageEnvelope::direct_text("alice", "bob", "hi");
        let delivered = router.deliver(&message).await.unwrap();
        assert_eq!(delivered, vec!["bob".to_string()]);
        assert!(matches!(
            rx.try_recv(),
            Ok(ServerEvent::ReceiveMessage(m)) if m.id == message.id
        ));

        // 接收方离线
        let offline = MessageEnvelope::direct_text("alice", "nobody", "hi");
        assert!(router.deliver(&offline).await.unwrap().is_empty());
    }

    /// 测试：三人群组只有两人在线时，推送恰好到达这两个会话
    #[tokio::test]
    async fn group_fanout_tolerates_offline_members() {
        let (registry, groups, router) = router();
        groups.insert_group(
            "g1",
            vec!["alice".to_string(), "bob".to_string(), "carol".to_string()],
        );
        let (session_b, mut rx_b) = SessionHandle::new("b");
        let (session_c, mut rx_c) = SessionHandle::new("c");
        registry.register("bob", session_b);
        registry.register("carol", session_c);
        // alice（发送方）在线与否都不应收到

        let mut message = MessageEnvelope::direct_text("alice", "ignored", "hello group");
        message.receiver_id = None;
        message.group_id = Some("g1".to_string());

        let mut delivered = router.deliver(&message).await.unwrap();
        delivered.sort();
        assert_eq!(delivered, vec!["bob".to_string(), "carol".to_string()]);
        assert!(rx_b.try_recv().is_ok());
        assert!(rx_c.try_recv().is_ok());
    }

    /// 测试：既无单聊接收方也无群组的信封被拒绝
    #[tokio::test]
    async fn envelope_without_recipient_is_invalid() {
        let (_registry, _groups, router) = router();
        let mut message = MessageEnvelope::direct_text("alice", "ignored", "hi");
        message.receiver_id = None;

        assert!(matches!(
            router.deliver(&message).await,
            Err(RealtimeError::InvalidParameter(_))
        ));
    }
}
