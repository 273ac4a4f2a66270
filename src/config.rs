use serde::{Deserialize, Serialize};
use std::{env, time::Duration};

use crate::models::session::Session;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Runtime configuration
    pub environment: String,
    pub log_level: String,

    // REST collaborator
    pub api_base_url: String,
    pub request_timeout_ms: u64,

    // Push channel
    pub push_url: String,
    pub heartbeat_incoming_ms: u64,
    pub heartbeat_outgoing_ms: u64,
    pub handshake_timeout_ms: u64,

    // Reconnection policy
    pub reconnect_delay_ms: u64,
    pub max_reconnect_attempts: u32,

    // Notification cache
    pub notification_page_size: u32,
    pub recent_limit: usize,

    // Session credentials
    pub auth_token: Option<String>,
    pub user_id: Option<String>,
}

/// 推送通道协议客户端所需的设置
#[derive(Debug, Clone)]
pub struct PushSettings {
    pub url: String,
    pub heartbeat_incoming: Duration,
    pub heartbeat_outgoing: Duration,
    pub handshake_timeout: Duration,
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub auth_token: Option<String>,
}

impl Default for PushSettings {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8080/ws/websocket".to_string(),
            heartbeat_incoming: Duration::from_millis(4000),
            heartbeat_outgoing: Duration::from_millis(4000),
            handshake_timeout: Duration::from_millis(10000),
            reconnect_delay: Duration::from_millis(5000),
            max_reconnect_attempts: 5,
            auth_token: None,
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Config {
            environment: env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
            log_level: env::var("LOG_LEVEL")
                .unwrap_or_else(|_| "course_notify=debug".to_string()),

            api_base_url: env::var("API_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:8080/api".to_string()),
            request_timeout_ms: env::var("REQUEST_TIMEOUT_MS")
                .unwrap_or_else(|_| "10000".to_string())
                .parse()?,

            push_url: env::var("PUSH_URL")
                .unwrap_or_else(|_| "ws://localhost:8080/ws/websocket".to_string()),
            heartbeat_incoming_ms: env::var("HEARTBEAT_INCOMING_MS")
                .unwrap_or_else(|_| "4000".to_string())
                .parse()?,
            heartbeat_outgoing_ms: env::var("HEARTBEAT_OUTGOING_MS")
                .unwrap_or_else(|_| "4000".to_string())
                .parse()?,
            handshake_timeout_ms: env::var("HANDSHAKE_TIMEOUT_MS")
                .unwrap_or_else(|_| "10000".to_string())
                .parse()?,

            reconnect_delay_ms: env::var("RECONNECT_DELAY_MS")
                .unwrap_or_else(|_| "5000".to_string())
                .parse()?,
            max_reconnect_attempts: env::var("MAX_RECONNECT_ATTEMPTS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()?,

            notification_page_size: env::var("NOTIFICATION_PAGE_SIZE")
                .unwrap_or_else(|_| "10".to_string())
                .parse()?,
            recent_limit: env::var("RECENT_LIMIT")
                .unwrap_or_else(|_| "10".to_string())
                .parse()?,

            auth_token: env::var("AUTH_TOKEN").ok().filter(|t| !t.is_empty()),
            user_id: env::var("USER_ID").ok().filter(|id| !id.is_empty()),
        })
    }

    pub fn push_settings(&self) -> PushSettings {
        PushSettings {
            url: self.push_url.clone(),
            heartbeat_incoming: Duration::from_millis(self.heartbeat_incoming_ms),
            heartbeat_outgoing: Duration::from_millis(self.heartbeat_outgoing_ms),
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
            max_reconnect_attempts: self.max_reconnect_attempts,
            auth_token: self.auth_token.clone(),
        }
    }

    pub fn session(&self) -> Session {
        Session::new(self.user_id.clone(), self.auth_token.clone())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}
