//! 实时网关
//!
//! 单一入口：把一条客户端事件分发到对应的子服务，并在断连时
//! 级联清理注册、呼叫、输入状态与在线状态。传输层只需要为每个
//! 连接创建一个 [`SessionHandle`]，把解码后的事件交给
//! [`RealtimeGateway::handle_event`]，断连时调用
//! [`RealtimeGateway::on_disconnect`]。

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::call::CallSignaling;
use crate::config::RealtimeConfig;
use crate::delivery::MessageDeliveryRouter;
use crate::error::{RealtimeError, RealtimeResult};
use crate::events::{ClientEvent, ServerEvent};
use crate::metrics::RealtimeMetrics;
use crate::models::{direct_participants, MessageEnvelope, MessageType, NotificationKind};
use crate::notify::NotificationFanout;
use crate::presence::PresenceTracker;
use crate::registry::ConnectionRegistry;
use crate::repository::{GroupRoster, MessageStore, NotificationStore, PresenceStore};
use crate::session::SessionHandle;
use crate::typing::TypingAggregator;

/// 网关依赖的持久化协作者
pub struct GatewayStores {
    pub messages: Arc<dyn MessageStore>,
    pub groups: Arc<dyn GroupRoster>,
    pub presence: Arc<dyn PresenceStore>,
    pub notifications: Arc<dyn NotificationStore>,
}

/// 实时网关，聚合全部子服务
pub struct RealtimeGateway {
    registry: Arc<ConnectionRegistry>,
    presence: Arc<PresenceTracker>,
    typing: Arc<TypingAggregator>,
    delivery: Arc<MessageDeliveryRouter>,
    notify: Arc<NotificationFanout>,
    calls: Arc<CallSignaling>,
    messages: Arc<dyn MessageStore>,
    groups: Arc<dyn GroupRoster>,
    sweeper: tokio::task::JoinHandle<()>,
}

impl RealtimeGateway {
    /// 按配置装配全部子服务，并启动输入状态清扫任务
    pub fn new(config: &RealtimeConfig, stores: GatewayStores, metrics: Arc<RealtimeMetrics>) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(metrics.clone()));
        let presence = Arc::new(PresenceTracker::new(
            registry.clone(),
            stores.presence,
            metrics.clone(),
        ));
        let typing = Arc::new(TypingAggregator::new(config.typing_idle_ttl(), metrics.clone()));
        // 清扫任务由网关持有：驱逐改变了对端可见的集合，必须跟着广播
        let sweeper = {
            let typing = typing.clone();
            let registry = registry.clone();
            let groups = stores.groups.clone();
            let sweep_interval = config.typing_sweep_interval();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(sweep_interval);
                loop {
                    ticker.tick().await;
                    for conversation_id in typing.sweep() {
                        let typing_users = typing.current(&conversation_id);
                        broadcast_typing_set(
                            &registry,
                            &groups,
                            &conversation_id,
                            None,
                            &typing_users,
                        )
                        .await;
                    }
                }
            })
        };
        let delivery = Arc::new(MessageDeliveryRouter::new(
            registry.clone(),
            stores.groups.clone(),
            metrics.clone(),
        ));
        let notify = Arc::new(NotificationFanout::new(
            registry.clone(),
            stores.notifications,
            metrics.clone(),
        ));
        let calls = Arc::new(CallSignaling::new(
            registry.clone(),
            stores.messages.clone(),
            config.ring_timeout(),
            metrics,
        ));
        Self {
            registry,
            presence,
            typing,
            delivery,
            notify,
            calls,
            messages: stores.messages,
            groups: stores.groups,
            sweeper,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn calls(&self) -> &Arc<CallSignaling> {
        &self.calls
    }

    pub fn typing(&self) -> &Arc<TypingAggregator> {
        &self.typing
    }

    /// 处理一条客户端事件
    pub async fn handle_event(
        &self,
        session: &SessionHandle,
        event: ClientEvent,
    ) -> RealtimeResult<()> {
        match event {
            ClientEvent::AddUser { user_id } => self.handle_add_user(session, &user_id).await,
            ClientEvent::SendMessage {
                sender_id,
                receiver_id,
                group_id,
                content,
                message_type,
                media_url,
            } => {
                self.handle_send_message(
                    sender_id,
                    receiver_id,
                    group_id,
                    content,
                    message_type,
                    media_url,
                )
                .await
            }
            ClientEvent::Typing {
                conversation_id,
                user_id,
                is_typing,
            } => {
                self.handle_typing(&conversation_id, &user_id, is_typing)
                    .await
            }
            ClientEvent::UpdatePresence { user_id, status } => {
                self.presence.on_status_change(&user_id, status).await;
                Ok(())
            }
            ClientEvent::CallUser {
                user_to_call,
                signal_data,
                from_user,
                name,
            } => {
                self.calls
                    .call_user(&from_user, &user_to_call, signal_data, &name);
                Ok(())
            }
            ClientEvent::AnswerCall { to, signal, call_id } => {
                let Some(actor) = self.registry.user_for_session(session.id()) else {
                    warn!(session_id = %session.id(), "answerCall from unbound session, ignored");
                    return Ok(());
                };
                self.calls.answer_call(&actor, &to, call_id, signal);
                Ok(())
            }
            ClientEvent::EndCall { to, call_id } => {
                let Some(actor) = self.registry.user_for_session(session.id()) else {
                    warn!(session_id = %session.id(), "endCall from unbound session, ignored");
                    return Ok(());
                };
                self.calls.end_call(&actor, Some(&to), call_id).await;
                Ok(())
            }
        }
    }

    /// 传输层报告断连：解除绑定并级联清理
    pub async fn on_disconnect(&self, session_id: &str) {
        let Some(user_id) = self.registry.unregister_session(session_id) else {
            debug!(session_id = %session_id, "Disconnect for unbound session");
            return;
        };
        info!(user_id = %user_id, session_id = %session_id, "Session disconnected");

        self.calls.on_disconnect(&user_id).await;

        for conversation_id in self.typing.clear_user(&user_id) {
            let typing_users = self.typing.current(&conversation_id);
            self.broadcast_typing(&conversation_id, &user_id, typing_users)
                .await;
        }

        self.presence.on_unbind(&user_id).await;
    }

    /// 绑定会话并应用上线状态
    ///
    /// `on_bind` 必须在绑定事件内同步完成：若推迟到后台任务，
    /// 紧随其后的断连可能先被处理，留下"离线后又上线"的脏记录。
    async fn handle_add_user(&self, session: &SessionHandle, user_id: &str) -> RealtimeResult<()> {
        if user_id.is_empty() {
            return Err(RealtimeError::InvalidParameter(
                "addUser requires a user id".to_string(),
            ));
        }
        let outcome = self.registry.register(user_id, session.clone());
        if outcome.went_online {
            self.presence.on_bind(user_id).await;
        }
        Ok(())
    }

    /// 接收消息落库并路由；信封的 id 与时间戳由服务端分配
    async fn handle_send_message(
        &self,
        sender_id: String,
        receiver_id: Option<String>,
        group_id: Option<String>,
        content: String,
        message_type: Option<MessageType>,
        media_url: Option<String>,
    ) -> RealtimeResult<()> {
        if content.is_empty() && media_url.is_none() {
            return Err(RealtimeError::InvalidParameter(
                "sendMessage requires content or media".to_string(),
            ));
        }
        if receiver_id.is_some() == group_id.is_some() {
            return Err(RealtimeError::InvalidParameter(
                "sendMessage requires exactly one of receiverId or groupId".to_string(),
            ));
        }

        let envelope = MessageEnvelope {
            id: uuid::Uuid::new_v4(),
            sender_id,
            receiver_id,
            group_id,
            content,
            message_type: message_type.unwrap_or(MessageType::Text),
            media_url,
            file_name: None,
            file_size: 0,
            duration: 0,
            timestamp: chrono::Utc::now(),
        };

        // 先持久化再投递，丢失的消息比迟到的消息更糟
        self.messages
            .save_message(&envelope)
            .await
            .map_err(|err| RealtimeError::Persistence(err.to_string()))?;

        let delivered = self.delivery.deliver(&envelope).await?;

        // 消息通知按收件人逐个去重创建
        let recipients: Vec<String> = match (&envelope.receiver_id, &envelope.group_id) {
            (Some(receiver), _) => vec![receiver.clone()],
            (None, Some(group_id)) => self
                .groups
                .find_group_members(group_id)
                .await
                .map_err(|err| RealtimeError::Persistence(err.to_string()))?
                .into_iter()
                .filter(|member| member != &envelope.sender_id)
                .collect(),
            (None, None) => Vec::new(),
        };
        let notifications = recipients.iter().map(|recipient| {
            self.notify
                .notify(NotificationKind::Message, recipient, &envelope.sender_id, None)
        });
        for result in futures::future::join_all(notifications).await {
            if let Err(err) = result {
                warn!(message_id = %envelope.id, error = %err, "Notification fanout failed");
            }
        }

        debug!(
            message_id = %envelope.id,
            delivered = delivered.len(),
            "Message handled"
        );
        Ok(())
    }

    async fn handle_typing(
        &self,
        conversation_id: &str,
        user_id: &str,
        is_typing: bool,
    ) -> RealtimeResult<()> {
        let typing_users = self.typing.set_typing(conversation_id, user_id, is_typing);
        self.broadcast_typing(conversation_id, user_id, typing_users)
            .await;
        Ok(())
    }

    /// 把会话的输入状态集合推给除动作发起者以外的参与者
    async fn broadcast_typing(
        &self,
        conversation_id: &str,
        actor_id: &str,
        typing_users: Vec<String>,
    ) {
        broadcast_typing_set(
            &self.registry,
            &self.groups,
            conversation_id,
            Some(actor_id),
            &typing_users,
        )
        .await;
    }
}

impl Drop for RealtimeGateway {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}

/// 把输入状态集合推给会话参与者，`exclude` 指定不接收的发起者
async fn broadcast_typing_set(
    registry: &ConnectionRegistry,
    groups: &Arc<dyn GroupRoster>,
    conversation_id: &str,
    exclude: Option<&str>,
    typing_users: &[String],
) {
    let participants: Vec<String> = match direct_participants(conversation_id) {
        Some((a, b)) => vec![a.to_string(), b.to_string()],
        None => match groups.find_group_members(conversation_id).await {
            Ok(members) => members,
            Err(err) => {
                debug!(
                    conversation_id = %conversation_id,
                    error = %err,
                    "Unknown conversation for typing broadcast"
                );
                return;
            }
        },
    };
    for participant in participants {
        if exclude == Some(participant.as_str()) {
            continue;
        }
        if let Some(session) = registry.resolve(&participant) {
            session.push(ServerEvent::TypingUpdate {
                conversation_id: conversation_id.to_string(),
                typing_users: typing_users.to_vec(),
            });
        }
    }
}
