//! 课程通知客户端核心：REST 拉取、STOMP 推送通道与通知状态缓存

pub mod config;
pub mod error;
pub mod models;
pub mod services;
pub mod state;
pub mod utils;

pub use config::{Config, PushSettings};
pub use error::{AppError, Result};
pub use state::{NotificationSnapshot, NotificationState};
