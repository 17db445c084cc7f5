//! 会话句柄
//!
//! 指向一条在线客户端连接的出站通道。推送是 fire-and-forget 的
//! at-most-once 语义：通道关闭只记录日志，不向调用方传播错误。

use tokio::sync::mpsc;
use tracing::debug;

use crate::events::ServerEvent;

/// 会话句柄：用户身份与传输连接之间绑定的值
#[derive(Debug, Clone)]
pub struct SessionHandle {
    session_id: String,
    sender: mpsc::UnboundedSender<ServerEvent>,
}

impl SessionHandle {
    /// 创建会话句柄及其出站事件接收端
    ///
    /// 接收端由传输层持有，负责把事件编码后写入连接。
    pub fn new(session_id: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<ServerEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                session_id: session_id.into(),
                sender,
            },
            receiver,
        )
    }

    /// 会话ID
    pub fn id(&self) -> &str {
        &self.session_id
    }

    /// 推送一条出站事件
    ///
    /// 返回 false 表示连接已关闭，事件被丢弃。
    pub fn push(&self, event: ServerEvent) -> bool {
        match self.sender.send(event) {
            Ok(()) => true,
            Err(_) => {
                debug!(session_id = %self.session_id, "Session channel closed, event dropped");
                false
            }
        }
    }
}
