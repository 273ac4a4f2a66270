use std::collections::VecDeque;

use serde::Serialize;

use crate::models::{
    notification::{Notification, NotificationId},
    websocket::ConnectionStatus,
};

/// 最近通知缓存的默认容量
pub const DEFAULT_RECENT_LIMIT: usize = 10;

/// 通知缓存的纯状态部分，不涉及任何 IO
///
/// `recent` 按到达时间倒序排列，最新的在最前；`unread` 永不为负。
#[derive(Debug, Clone)]
pub struct NotificationState {
    recent: VecDeque<Notification>,
    limit: usize,
    unread: u64,
    connection_status: ConnectionStatus,
    loading: bool,
    session_expired: bool,
}

/// 提供给界面层的只读快照
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationSnapshot {
    pub recent: Vec<Notification>,
    pub unread_count: u64,
    pub connection_status: ConnectionStatus,
    pub loading: bool,
    pub session_expired: bool,
}

impl NotificationState {
    pub fn new(limit: usize) -> Self {
        Self {
            recent: VecDeque::with_capacity(limit),
            limit,
            unread: 0,
            connection_status: ConnectionStatus::Disconnected,
            loading: false,
            session_expired: false,
        }
    }

    pub fn recent(&self) -> impl Iterator<Item = &Notification> {
        self.recent.iter()
    }

    pub fn len(&self) -> usize {
        self.recent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recent.is_empty()
    }

    pub fn unread_count(&self) -> u64 {
        self.unread
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.connection_status
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn is_session_expired(&self) -> bool {
        self.session_expired
    }

    /// 推送到达：放到最前，超出容量淘汰最旧的一条
    ///
    /// 未读数无条件加一，即使同一 id 已在缓存中。
    pub fn ingest(&mut self, notification: Notification) {
        self.recent.push_front(notification);
        self.recent.truncate(self.limit);
        self.unread += 1;
    }

    /// 用服务端返回的列表整体替换缓存
    pub fn replace_recent(&mut self, items: Vec<Notification>) {
        self.recent = items.into_iter().take(self.limit).collect();
    }

    pub fn set_unread(&mut self, count: u64) {
        self.unread = count;
    }

    /// 服务端确认单条已读后调用；返回是否有条目从未读变为已读
    pub fn apply_mark_read(&mut self, id: NotificationId) -> bool {
        let changed = self
            .recent
            .iter_mut()
            .find(|n| n.id == id)
            .map(Notification::mark_read)
            .unwrap_or(false);

        if changed {
            self.unread = self.unread.saturating_sub(1);
        }
        changed
    }

    /// 服务端确认全部已读后调用
    pub fn apply_mark_all_read(&mut self) {
        for notification in self.recent.iter_mut() {
            notification.mark_read();
        }
        self.unread = 0;
    }

    pub fn set_connection_status(&mut self, status: ConnectionStatus) {
        self.connection_status = status;
    }

    pub fn set_loading(&mut self, loading: bool) {
        self.loading = loading;
    }

    pub fn set_session_expired(&mut self, expired: bool) {
        self.session_expired = expired;
    }

    /// 会话结束，丢弃全部内存状态
    pub fn clear(&mut self) {
        self.recent.clear();
        self.unread = 0;
        self.connection_status = ConnectionStatus::Disconnected;
        self.loading = false;
    }

    pub fn snapshot(&self) -> NotificationSnapshot {
        NotificationSnapshot {
            recent: self.recent.iter().cloned().collect(),
            unread_count: self.unread,
            connection_status: self.connection_status,
            loading: self.loading,
            session_expired: self.session_expired,
        }
    }
}

impl Default for NotificationState {
    fn default() -> Self {
        Self::new(DEFAULT_RECENT_LIMIT)
    }
}
