//! 实时核心配置模块
//!
//! 提供配置文件加载和环境变量覆盖：
//! - 从 TOML 配置文件加载（可选）
//! - 环境变量优先于配置文件
//! - 所有字段都有默认值

use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// 日志配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// 日志级别（trace/debug/info/warn/error）
    pub level: String,
    /// 是否输出模块路径
    pub with_target: bool,
    /// 是否输出线程ID
    pub with_thread_ids: bool,
    /// 是否输出源文件名
    pub with_file: bool,
    /// 是否输出行号
    pub with_line_number: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            with_target: true,
            with_thread_ids: false,
            with_file: false,
            with_line_number: false,
        }
    }
}

/// 实时核心配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// 呼叫振铃超时（秒）
    pub ring_timeout_secs: u64,
    /// 输入状态空闲驱逐时间（秒）
    pub typing_idle_ttl_secs: u64,
    /// 输入状态后台清理间隔（秒）
    pub typing_sweep_interval_secs: u64,
    /// 日志配置
    pub logging: LoggingConfig,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            ring_timeout_secs: 30,
            typing_idle_ttl_secs: 15,
            typing_sweep_interval_secs: 5,
            logging: LoggingConfig::default(),
        }
    }
}

impl RealtimeConfig {
    /// 从 TOML 配置文件加载，文件不存在时使用默认值
    ///
    /// 环境变量覆盖优先于配置文件：
    /// - `PULSE_RING_TIMEOUT_SECS`
    /// - `PULSE_TYPING_IDLE_TTL_SECS`
    /// - `PULSE_TYPING_SWEEP_INTERVAL_SECS`
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) if path.exists() => {
                let content = fs::read_to_string(path)
                    .with_context(|| format!("无法读取配置文件: {}", path.display()))?;
                toml::from_str(&content)
                    .with_context(|| format!("无效的配置格式: {}", path.display()))?
            }
            _ => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// 应用环境变量覆盖
    fn apply_env_overrides(&mut self) {
        self.ring_timeout_secs = env::var("PULSE_RING_TIMEOUT_SECS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(self.ring_timeout_secs);

        self.typing_idle_ttl_secs = env::var("PULSE_TYPING_IDLE_TTL_SECS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(self.typing_idle_ttl_secs);

        self.typing_sweep_interval_secs = env::var("PULSE_TYPING_SWEEP_INTERVAL_SECS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(self.typing_sweep_interval_secs);
    }

    /// 呼叫振铃超时
    pub fn ring_timeout(&self) -> Duration {
        Duration::from_secs(self.ring_timeout_secs)
    }

    /// 输入状态空闲驱逐时间
    pub fn typing_idle_ttl(&self) -> Duration {
        Duration::from_secs(self.typing_idle_ttl_secs)
    }

    /// 输入状态清理间隔
    pub fn typing_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.typing_sweep_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_all_fields() {
        let config = RealtimeConfig::default();
        assert_eq!(config.ring_timeout_secs, 30);
        assert_eq!(config.typing_idle_ttl_secs, 15);
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let config: RealtimeConfig = toml::from_str("ring_timeout_secs = 10").unwrap();
        assert_eq!(config.ring_timeout_secs, 10);
        assert_eq!(config.typing_idle_ttl_secs, 15);
        assert_eq!(config.logging.level, "info");
    }
}
