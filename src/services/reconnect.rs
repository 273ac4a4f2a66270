use std::time::Duration;

use tracing::{info, warn};

/// 固定延迟的重连策略
///
/// 每次握手成功后计数清零；连接关闭时若尚未达到上限则计数加一并返回重试延迟，
/// 达到上限后不再自动重试，直到调用方显式重新连接。
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    delay: Duration,
    max_attempts: u32,
    attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(delay: Duration, max_attempts: u32) -> Self {
        Self {
            delay,
            max_attempts,
            attempts: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// 握手成功
    pub fn on_connect(&mut self) {
        self.attempts = 0;
    }

    /// 连接关闭，返回下一次重试前的等待时间
    pub fn on_close(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            warn!(
                "Reconnect attempts exhausted ({}), giving up until an explicit reconnect",
                self.max_attempts
            );
            return None;
        }
        self.attempts += 1;
        info!(
            "Scheduling reconnect attempt {}/{} in {:?}",
            self.attempts, self.max_attempts, self.delay
        );
        Some(self.delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), 5)
    }
}
