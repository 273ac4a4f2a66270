use serde::{Deserialize, Serialize};

/// 推送目的地
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    // 用户私有通知队列：/user/{identity}/queue/notifications
    UserNotifications,
}

impl Destination {
    /// 生成目的地路径
    pub fn path(&self, identity: &str) -> String {
        match self {
            Destination::UserNotifications => format!("/user/{}/queue/notifications", identity),
        }
    }
}

/// 协议客户端状态机：Idle → Handshaking → Ready → Closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Idle,
    Handshaking,
    Ready,
    Closed,
}

/// 对外暴露的连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

impl From<ClientState> for ConnectionStatus {
    fn from(state: ClientState) -> Self {
        match state {
            ClientState::Idle => ConnectionStatus::Disconnected,
            ClientState::Handshaking => ConnectionStatus::Connecting,
            ClientState::Ready => ConnectionStatus::Connected,
            ClientState::Closed => ConnectionStatus::Closed,
        }
    }
}

/// 协议客户端生命周期事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// 握手完成
    Connected {
        version: Option<String>,
        server: Option<String>,
    },
    /// 服务端 ERROR 帧
    Error(String),
    /// 连接已关闭（传输失败、心跳超时、握手失败）
    Closed { reason: Option<String> },
}
