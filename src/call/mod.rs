//! 呼叫信令状态机
//!
//! 每次呼叫尝试对应一个呼叫会话：RINGING → ACCEPTED → ENDED，
//! 或 RINGING 直接进入 ENDED（未接/拒接/主叫离线）。任何终态都是
//! 最终的，新的呼叫尝试创建新会话。同一无序 (主叫, 被叫) 对上
//! 同时只允许一路在途呼叫，第二次 callUser 收到 busy。
//!
//! 振铃定时器是唯一的显式定时器，离开 RINGING 时解除；未解除的
//! 定时器触发时发现状态已变迁会自行 no-op。过期或 callId 不匹配
//! 的信令被静默忽略，从不导致崩溃。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::events::ServerEvent;
use crate::metrics::RealtimeMetrics;
use crate::models::MessageEnvelope;
use crate::registry::ConnectionRegistry;
use crate::repository::MessageStore;

/// 呼叫状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    Ringing,
    Accepted,
    Ended,
}

/// 呼叫结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    /// 振铃超时未接
    Missed,
    /// 被叫拒接
    Declined,
    /// 通话后挂断（含主叫振铃期取消）
    Hangup,
    /// 建立失败（对端不可达）
    Failed,
}

impl CallOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            CallOutcome::Missed => "missed",
            CallOutcome::Declined => "declined",
            CallOutcome::Hangup => "hangup",
            CallOutcome::Failed => "failed",
        }
    }
}

/// 呼叫会话
#[derive(Debug, Clone)]
pub struct CallSession {
    pub call_id: Uuid,
    pub caller_id: String,
    pub callee_id: String,
    pub state: CallState,
    pub created_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
}

/// 在途呼叫条目，携带振铃定时器句柄
struct LiveCall {
    session: CallSession,
    ring_timer: Option<JoinHandle<()>>,
}

/// 呼叫信令服务
pub struct CallSignaling {
    registry: Arc<ConnectionRegistry>,
    messages: Arc<dyn MessageStore>,
    /// call_id → 在途呼叫
    calls: DashMap<Uuid, LiveCall>,
    /// 无序 (主叫, 被叫) 对 → 在途 call_id（单飞约束）
    pairs: DashMap<String, Uuid>,
    ring_timeout: Duration,
    metrics: Arc<RealtimeMetrics>,
}

impl CallSignaling {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        messages: Arc<dyn MessageStore>,
        ring_timeout: Duration,
        metrics: Arc<RealtimeMetrics>,
    ) -> Self {
        Self {
            registry,
            messages,
            calls: DashMap::new(),
            pairs: DashMap::new(),
            ring_timeout,
            metrics,
        }
    }

    /// 发起呼叫
    ///
    /// 成功进入 RINGING 时返回 call_id。所有建立失败都以
    /// `callFailed{reason}` 推回主叫，从不静默丢弃。
    pub fn call_user(
        self: &Arc<Self>,
        caller_id: &str,
        callee_id: &str,
        offer: serde_json::Value,
        caller_name: &str,
    ) -> Option<Uuid> {
        if caller_id == callee_id {
            self.fail_caller(caller_id, "cannot call yourself");
            return None;
        }

        // 单飞约束的占位必须原子：entry 占位成功者才能继续建会话，
        // 两路并发 callUser 不可能都越过这里
        let call_id = Uuid::new_v4();
        let key = pair_key(caller_id, callee_id);
        match self.pairs.entry(key.clone()) {
            Entry::Occupied(_) => {
                info!(
                    caller_id = %caller_id,
                    callee_id = %callee_id,
                    "Call attempt while another call is live for the pair"
                );
                self.fail_caller(caller_id, "busy");
                return None;
            }
            Entry::Vacant(slot) => {
                slot.insert(call_id);
            }
        }

        let callee_session = match self.registry.resolve(callee_id) {
            Some(session) => session,
            None => {
                self.pairs.remove_if(&key, |_, id| *id == call_id);
                info!(
                    caller_id = %caller_id,
                    callee_id = %callee_id,
                    "Callee offline, call ends before ringing"
                );
                self.fail_caller(caller_id, "user offline");
                self.metrics
                    .calls_ended_total
                    .with_label_values(&[CallOutcome::Failed.as_str()])
                    .inc();
                return None;
            }
        };

        let session = CallSession {
            call_id,
            caller_id: caller_id.to_string(),
            callee_id: callee_id.to_string(),
            state: CallState::Ringing,
            created_at: Utc::now(),
            accepted_at: None,
        };
        self.calls.insert(
            call_id,
            LiveCall {
                session,
                ring_timer: None,
            },
        );

        let forwarded = callee_session.push(ServerEvent::CallOffer {
            call_id,
            signal_data: offer,
            from_user: caller_id.to_string(),
            name: caller_name.to_string(),
        });
        if !forwarded {
            // 被叫通道已关闭但注册表还没感知到断连
            self.calls.remove(&call_id);
            self.pairs.remove_if(&key, |_, id| *id == call_id);
            self.fail_caller(caller_id, "user offline");
            self.metrics
                .calls_ended_total
                .with_label_values(&[CallOutcome::Failed.as_str()])
                .inc();
            return None;
        }

        // 装上振铃定时器；条目已存在，超时触发时若已离开 RINGING 会 no-op
        let signaling = Arc::clone(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(signaling.ring_timeout).await;
            signaling.ring_timeout_fired(call_id).await;
        });
        if let Some(mut live) = self.calls.get_mut(&call_id) {
            live.ring_timer = Some(timer);
        } else {
            timer.abort();
        }

        self.metrics.calls_started_total.inc();
        info!(
            call_id = %call_id,
            caller_id = %caller_id,
            callee_id = %callee_id,
            "Call ringing"
        );
        Some(call_id)
    }

    /// 被叫应答
    ///
    /// 仅在 RINGING 状态有效；重复应答或 callId 不匹配时 no-op。
    pub fn answer_call(
        &self,
        callee_id: &str,
        caller_id: &str,
        call_id: Option<Uuid>,
        answer: serde_json::Value,
    ) {
        let Some(call_id) = self.resolve_call_id(callee_id, caller_id, call_id) else {
            debug!(
                callee_id = %callee_id,
                caller_id = %caller_id,
                "answerCall without a live call, ignored"
            );
            return;
        };

        let accepted = {
            let Some(mut live) = self.calls.get_mut(&call_id) else {
                debug!(call_id = %call_id, "answerCall for unknown call, ignored");
                return;
            };
            if live.session.state != CallState::Ringing || live.session.callee_id != callee_id {
                debug!(
                    call_id = %call_id,
                    state = ?live.session.state,
                    "Stale answerCall ignored"
                );
                return;
            }
            live.session.state = CallState::Accepted;
            live.session.accepted_at = Some(Utc::now());
            if let Some(timer) = live.ring_timer.take() {
                timer.abort();
            }
            live.session.clone()
        };

        match self.registry.resolve(&accepted.caller_id) {
            Some(caller_session) => {
                caller_session.push(ServerEvent::CallAccepted {
                    call_id,
                    signal: answer,
                });
                info!(
                    call_id = %call_id,
                    caller_id = %accepted.caller_id,
                    callee_id = %callee_id,
                    "Call accepted"
                );
            }
            None => {
                // 主叫在应答到达前掉线：向应答方报告失败并拆除
                warn!(
                    call_id = %call_id,
                    caller_id = %accepted.caller_id,
                    "Caller unreachable at answer forward time"
                );
                if let Some((_, live)) = self.calls.remove(&call_id) {
                    self.remove_pair(&live.session, call_id);
                }
                if let Some(callee_session) = self.registry.resolve(callee_id) {
                    callee_session.push(ServerEvent::CallFailed {
                        reason: "user offline".to_string(),
                    });
                }
                self.metrics
                    .calls_ended_total
                    .with_label_values(&[CallOutcome::Failed.as_str()])
                    .inc();
            }
        }
    }

    /// 挂断或拒接
    ///
    /// RINGING 与 ACCEPTED 状态下有效，终态后的 endCall 是 no-op。
    /// 传输断连等价于该方发出 endCall。
    pub async fn end_call(&self, ender_id: &str, peer_id: Option<&str>, call_id: Option<Uuid>) {
        let resolved = call_id.or_else(|| {
            peer_id.and_then(|peer| self.pairs.get(&pair_key(ender_id, peer)).map(|id| *id))
        });
        let Some(call_id) = resolved else {
            debug!(ender_id = %ender_id, "endCall without a live call, ignored");
            return;
        };

        let Some((_, mut live)) = self.calls.remove_if(&call_id, |_, live| {
            live.session.caller_id == ender_id || live.session.callee_id == ender_id
        }) else {
            debug!(call_id = %call_id, ender_id = %ender_id, "Stale endCall ignored");
            return;
        };
        self.remove_pair(&live.session, call_id);
        if let Some(timer) = live.ring_timer.take() {
            timer.abort();
        }

        let now = Utc::now();
        let outcome = match live.session.state {
            CallState::Ringing if ender_id == live.session.callee_id => CallOutcome::Declined,
            CallState::Ringing => CallOutcome::Hangup,
            CallState::Accepted => CallOutcome::Hangup,
            CallState::Ended => return,
        };

        let peer = if ender_id == live.session.caller_id {
            &live.session.callee_id
        } else {
            &live.session.caller_id
        };
        if let Some(peer_session) = self.registry.resolve(peer) {
            peer_session.push(ServerEvent::CallEnded);
        }

        self.metrics
            .calls_ended_total
            .with_label_values(&[outcome.as_str()])
            .inc();
        info!(
            call_id = %call_id,
            ender_id = %ender_id,
            outcome = outcome.as_str(),
            "Call ended"
        );

        // 结果写穿到消息日志；失败只记录，不影响已完成的信令
        let record = match (outcome, live.session.accepted_at) {
            (CallOutcome::Declined, _) => Some(MessageEnvelope::missed_call(
                &live.session.caller_id,
                &live.session.callee_id,
            )),
            (CallOutcome::Hangup, Some(accepted_at)) => {
                let duration = (now - accepted_at).num_seconds().max(0) as u64;
                Some(MessageEnvelope::call_log(ender_id, peer, duration))
            }
            _ => None,
        };
        if let Some(record) = record {
            if let Err(err) = self.messages.save_message(&record).await {
                warn!(call_id = %call_id, error = %err, "Failed to log call outcome");
            }
        }
    }

    /// 一方断连时拆除其全部在途呼叫
    pub async fn on_disconnect(&self, user_id: &str) {
        let involved: Vec<Uuid> = self
            .calls
            .iter()
            .filter(|entry| {
                entry.session.caller_id == user_id || entry.session.callee_id == user_id
            })
            .map(|entry| entry.session.call_id)
            .collect();
        for call_id in involved {
            self.end_call(user_id, None, Some(call_id)).await;
        }
    }

    /// 查询某对参与者当前的在途呼叫
    pub fn live_call(&self, a: &str, b: &str) -> Option<CallSession> {
        let call_id = *self.pairs.get(&pair_key(a, b))?;
        self.calls.get(&call_id).map(|live| live.session.clone())
    }

    /// 振铃超时：仍处于 RINGING 时记未接并拆除
    async fn ring_timeout_fired(&self, call_id: Uuid) {
        let Some((_, live)) = self
            .calls
            .remove_if(&call_id, |_, live| live.session.state == CallState::Ringing)
        else {
            debug!(call_id = %call_id, "Ring timer fired after state change, no-op");
            return;
        };
        self.remove_pair(&live.session, call_id);

        for party in [&live.session.caller_id, &live.session.callee_id] {
            if let Some(session) = self.registry.resolve(party) {
                session.push(ServerEvent::CallEnded);
            }
        }

        self.metrics
            .calls_ended_total
            .with_label_values(&[CallOutcome::Missed.as_str()])
            .inc();
        info!(
            call_id = %call_id,
            caller_id = %live.session.caller_id,
            callee_id = %live.session.callee_id,
            "Call missed after ring timeout"
        );

        let record =
            MessageEnvelope::missed_call(&live.session.caller_id, &live.session.callee_id);
        if let Err(err) = self.messages.save_message(&record).await {
            warn!(call_id = %call_id, error = %err, "Failed to log missed call");
        }
    }

    /// 解析应答/挂断针对的 call_id，优先显式 callId，否则按参与者对查找
    fn resolve_call_id(&self, a: &str, b: &str, call_id: Option<Uuid>) -> Option<Uuid> {
        match call_id {
            Some(id) => Some(id),
            None => self.pairs.get(&pair_key(a, b)).map(|id| *id),
        }
    }

    fn remove_pair(&self, session: &CallSession, call_id: Uuid) {
        let key = pair_key(&session.caller_id, &session.callee_id);
        self.pairs.remove_if(&key, |_, id| *id == call_id);
    }

    fn fail_caller(&self, caller_id: &str, reason: &str) {
        match self.registry.resolve(caller_id) {
            Some(session) => {
                session.push(ServerEvent::CallFailed {
                    reason: reason.to_string(),
                });
            }
            None => {
                warn!(
                    caller_id = %caller_id,
                    reason = %reason,
                    "Cannot report call failure, caller unbound"
                );
            }
        }
    }
}

/// 无序参与者对的键
fn pair_key(a: &str, b: &str) -> String {
    if a <= b {
        format!("{}|{}", a, b)
    } else {
        format!("{}|{}", b, a)
    }
}
