//! 输入状态聚合器
//!
//! 按会话标识维护"正在输入"的用户集合。set_typing 幂等；
//! 条目携带最后活跃时间，超过空闲 TTL 后被后台清理任务或
//! 读取路径驱逐，避免非正常断开留下永久的 true 状态。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

use crate::metrics::RealtimeMetrics;

/// 输入状态聚合器
pub struct TypingAggregator {
    /// conversation_id → (user_id → 最后活跃时间)
    conversations: DashMap<String, HashMap<String, Instant>>,
    idle_ttl: Duration,
    metrics: Arc<RealtimeMetrics>,
}

impl TypingAggregator {
    pub fn new(idle_ttl: Duration, metrics: Arc<RealtimeMetrics>) -> Self {
        Self {
            conversations: DashMap::new(),
            idle_ttl,
            metrics,
        }
    }

    /// 更新用户在某会话中的输入状态，返回当前集合
    ///
    /// 幂等：重复置 true 只刷新活跃时间；对非成员置 false 是 no-op。
    pub fn set_typing(&self, conversation_id: &str, user_id: &str, is_typing: bool) -> Vec<String> {
        let now = Instant::now();
        let mut entry = self.conversations.entry(conversation_id.to_string()).or_default();

        if is_typing {
            entry.insert(user_id.to_string(), now);
        } else {
            entry.remove(user_id);
        }
        Self::evict_idle(&mut entry, now, self.idle_ttl, &self.metrics);

        let mut current: Vec<String> = entry.keys().cloned().collect();
        drop(entry);
        current.sort();

        if current.is_empty() {
            self.conversations
                .remove_if(conversation_id, |_, users| users.is_empty());
        }
        current
    }

    /// 读取某会话当前的输入用户集合（过滤已过期条目）
    pub fn current(&self, conversation_id: &str) -> Vec<String> {
        let now = Instant::now();
        let mut current = match self.conversations.get_mut(conversation_id) {
            Some(mut entry) => {
                Self::evict_idle(&mut entry, now, self.idle_ttl, &self.metrics);
                entry.keys().cloned().collect::<Vec<_>>()
            }
            None => Vec::new(),
        };
        current.sort();
        current
    }

    /// 把用户从所有会话中移除（断连清理），返回受影响的会话
    pub fn clear_user(&self, user_id: &str) -> Vec<String> {
        let mut affected = Vec::new();
        for mut entry in self.conversations.iter_mut() {
            if entry.value_mut().remove(user_id).is_some() {
                affected.push(entry.key().clone());
            }
        }
        for conversation_id in &affected {
            self.conversations
                .remove_if(conversation_id, |_, users| users.is_empty());
        }
        affected
    }

    /// single pass：驱逐所有会话中过期的条目
    ///
    /// 返回发生过驱逐的会话列表。驱逐改变了对端可见的集合，
    /// 调用方（网关的清扫任务）据此广播更新后的 typingUpdate。
    pub fn sweep(&self) -> Vec<String> {
        let now = Instant::now();
        let mut affected = Vec::new();
        for mut entry in self.conversations.iter_mut() {
            let before = entry.len();
            Self::evict_idle(&mut entry, now, self.idle_ttl, &self.metrics);
            if entry.len() < before {
                affected.push(entry.key().clone());
            }
        }
        for conversation_id in &affected {
            self.conversations
                .remove_if(conversation_id, |_, users| users.is_empty());
        }
        affected
    }

    fn evict_idle(
        users: &mut HashMap<String, Instant>,
        now: Instant,
        ttl: Duration,
        metrics: &RealtimeMetrics,
    ) {
        let before = users.len();
        users.retain(|user_id, last_active| {
            let keep = now.duration_since(*last_active) < ttl;
            if !keep {
                debug!(user_id = %user_id, "Typing entry evicted by idle TTL");
            }
            keep
        });
        let evicted = before - users.len();
        if evicted > 0 {
            metrics.typing_evicted_total.inc_by(evicted as u64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aggregator(ttl_secs: u64) -> TypingAggregator {
        TypingAggregator::new(
            Duration::from_secs(ttl_secs),
            Arc::new(RealtimeMetrics::new()),
        )
    }

    /// 测试：重复置 true 幂等，置 false 移除，移除非成员是 no-op
    #[tokio::test]
    async fn set_typing_is_idempotent() {
        let typing = aggregator(15);

        assert_eq!(typing.set_typing("a:b", "a", true), vec!["a".to_string()]);
        assert_eq!(typing.set_typing("a:b", "a", true), vec!["a".to_string()]);

        assert!(typing.set_typing("a:b", "a", false).is_empty());
        // 对从未加入的用户置 false
        assert!(typing.set_typing("a:b", "carol", false).is_empty());
    }

    /// 测试：集合按用户排序且每个用户只出现一次
    #[tokio::test]
    async fn current_set_is_sorted_and_unique() {
        let typing = aggregator(15);
        typing.set_typing("g1", "bob", true);
        typing.set_typing("g1", "alice", true);
        typing.set_typing("g1", "bob", true);

        assert_eq!(
            typing.current("g1"),
            vec!["alice".to_string(), "bob".to_string()]
        );
    }

    /// 测试：超过空闲 TTL 的条目被驱逐
    #[tokio::test(start_paused = true)]
    async fn idle_entries_are_evicted() {
        let typing = aggregator(15);
        typing.set_typing("a:b", "a", true);

        tokio::time::advance(Duration::from_secs(16)).await;
        assert_eq!(typing.sweep(), vec!["a:b".to_string()]);
        assert!(typing.current("a:b").is_empty());
    }

    /// 测试：未到 TTL 的条目在读取路径下保留
    #[tokio::test(start_paused = true)]
    async fn fresh_entries_survive_reads() {
        let typing = aggregator(15);
        typing.set_typing("a:b", "a", true);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(typing.current("a:b"), vec!["a".to_string()]);
    }

    /// 测试：断连清理把用户从所有会话移除
    #[tokio::test]
    async fn clear_user_removes_from_all_conversations() {
        let typing = aggregator(15);
        typing.set_typing("a:b", "a", true);
        typing.set_typing("g1", "a", true);
        typing.set_typing("g1", "b", true);

        let mut affected = typing.clear_user("a");
        affected.sort();
        assert_eq!(affected, vec!["a:b".to_string(), "g1".to_string()]);
        assert!(typing.current("a:b").is_empty());
        assert_eq!(typing.current("g1"), vec!["b".to_string()]);
    }
}
