use thiserror::Error;
use tokio_tungstenite::tungstenite;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Authorization error: {0}")]
    Authorization(String),

    #[error("API error: {0}")]
    Api(String),

    #[error("External service error: {0}")]
    ExternalService(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Handshake timed out after {0} ms")]
    HandshakeTimeout(u64),

    #[error("Push channel is not connected")]
    NotConnected,

    #[error("Already subscribed to destination: {0}")]
    AlreadySubscribed(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    #[error("UTF-8 error: {0}")]
    Utf8(#[from] std::str::Utf8Error),
}

// 便利函数，用于创建常见错误
impl AppError {
    pub fn unauthorized(msg: &str) -> Self {
        Self::Authentication(msg.to_string())
    }

    pub fn forbidden(msg: &str) -> Self {
        Self::Authorization(msg.to_string())
    }

    pub fn api(msg: &str) -> Self {
        Self::Api(msg.to_string())
    }

    pub fn protocol(msg: &str) -> Self {
        Self::Protocol(msg.to_string())
    }

    pub fn transport(msg: &str) -> Self {
        Self::Transport(msg.to_string())
    }

    /// 会话过期（401）需要由外部协作方拆除会话
    pub fn is_session_expired(&self) -> bool {
        matches!(self, AppError::Authentication(_))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}
