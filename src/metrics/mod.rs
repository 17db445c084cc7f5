//! Prometheus 指标收集模块
//!
//! 为实时核心各组件提供统一的指标收集能力。

use once_cell::sync::Lazy;
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

/// 全局指标注册表
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

/// 实时核心指标
pub struct RealtimeMetrics {
    /// 当前绑定的会话数
    pub connections_active: IntGauge,
    /// 实时通道投递的消息总数
    pub messages_delivered_total: IntCounter,
    /// 推送的通知总数
    pub notifications_pushed_total: IntCounter,
    /// 因未读去重被抑制的通知总数
    pub notifications_suppressed_total: IntCounter,
    /// 在线状态广播总数
    pub presence_broadcast_total: IntCounter,
    /// 发起的呼叫总数
    pub calls_started_total: IntCounter,
    /// 结束的呼叫总数（按结果分类）
    pub calls_ended_total: IntCounterVec,
    /// 被空闲驱逐的输入状态条目总数
    pub typing_evicted_total: IntCounter,
}

impl RealtimeMetrics {
    pub fn new() -> Self {
        let connections_active = IntGauge::new(
            "connections_active",
            "Number of user sessions currently bound",
        )
        .expect("Failed to create connections_active metric");

        let messages_delivered_total = IntCounter::new(
            "messages_delivered_total",
            "Total number of messages pushed over live sessions",
        )
        .expect("Failed to create messages_delivered_total metric");

        let notifications_pushed_total = IntCounter::new(
            "notifications_pushed_total",
            "Total number of notifications pushed to recipients",
        )
        .expect("Failed to create notifications_pushed_total metric");

        let notifications_suppressed_total = IntCounter::new(
            "notifications_suppressed_total",
            "Total number of notifications suppressed by unread dedupe",
        )
        .expect("Failed to create notifications_suppressed_total metric");

        let presence_broadcast_total = IntCounter::new(
            "presence_broadcast_total",
            "Total number of presence updates broadcast",
        )
        .expect("Failed to create presence_broadcast_total metric");

        let calls_started_total = IntCounter::new(
            "calls_started_total",
            "Total number of call attempts that reached ringing",
        )
        .expect("Failed to create calls_started_total metric");

        let calls_ended_total = IntCounterVec::new(
            Opts::new("calls_ended_total", "Total number of ended calls"),
            &["outcome"],
        )
        .expect("Failed to create calls_ended_total metric");

        let typing_evicted_total = IntCounter::new(
            "typing_evicted_total",
            "Total number of typing entries evicted by idle TTL",
        )
        .expect("Failed to create typing_evicted_total metric");

        Self {
            connections_active,
            messages_delivered_total,
            notifications_pushed_total,
            notifications_suppressed_total,
            presence_broadcast_total,
            calls_started_total,
            calls_ended_total,
            typing_evicted_total,
        }
    }

    /// 注册所有指标到给定的注册表
    pub fn register(&self, registry: &Registry) -> prometheus::Result<()> {
        registry.register(Box::new(self.connections_active.clone()))?;
        registry.register(Box::new(self.messages_delivered_total.clone()))?;
        registry.register(Box::new(self.notifications_pushed_total.clone()))?;
        registry.register(Box::new(self.notifications_suppressed_total.clone()))?;
        registry.register(Box::new(self.presence_broadcast_total.clone()))?;
        registry.register(Box::new(self.calls_started_total.clone()))?;
        registry.register(Box::new(self.calls_ended_total.clone()))?;
        registry.register(Box::new(self.typing_evicted_total.clone()))?;
        Ok(())
    }
}

impl Default for RealtimeMetrics {
    fn default() -> Self {
        Self::new()
    }
}
