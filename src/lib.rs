//! pulse-realtime-core
//!
//! 社交应用的实时在线核心：连接注册、在线状态、消息投递、
//! 输入状态聚合、通知派生与 WebRTC 呼叫信令。不做传输层，
//! 任何能把连接映射到 [`session::SessionHandle`] 并递送
//! [`events::ClientEvent`] 的 WebSocket/长连接服务都可以接入
//! [`gateway::RealtimeGateway`]。

pub mod call;
pub mod config;
pub mod delivery;
pub mod error;
pub mod events;
pub mod gateway;
pub mod metrics;
pub mod models;
pub mod notify;
pub mod presence;
pub mod registry;
pub mod repository;
pub mod session;
pub mod tracing;
pub mod typing;

pub use crate::error::{RealtimeError, RealtimeResult};
pub use crate::gateway::{GatewayStores, RealtimeGateway};
pub use crate::session::SessionHandle;
