use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::{
    error::{AppError, Result},
    models::{
        notification::{Notification, NotificationId},
        session::Session,
        websocket::ConnectionStatus,
    },
    services::{connection::ConnectionManager, notification::NotificationApi},
    state::{NotificationSnapshot, NotificationState},
};

/// `next_event` 返回的事件
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    /// 推送到达，已写入缓存
    Notification(Notification),
    /// 推送通道状态变化
    Status(ConnectionStatus),
}

/// 通知状态仓库
///
/// 会话级单例：汇总 REST 拉取结果与推送通道的实时通知，
/// 每次变更后通过 watch 通道发布新的快照。
pub struct NotificationStore {
    api: Arc<dyn NotificationApi>,
    connection: ConnectionManager,
    session: Session,
    page_size: u32,
    state: NotificationState,
    inbox_tx: mpsc::UnboundedSender<Notification>,
    inbox_rx: mpsc::UnboundedReceiver<Notification>,
    status_rx: watch::Receiver<ConnectionStatus>,
    snapshot_tx: watch::Sender<NotificationSnapshot>,
}

impl NotificationStore {
    pub fn new(
        api: Arc<dyn NotificationApi>,
        connection: ConnectionManager,
        session: Session,
        page_size: u32,
        recent_limit: usize,
    ) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let status_rx = connection.watch_status();
        let state = NotificationState::new(recent_limit);
        let (snapshot_tx, _) = watch::channel(state.snapshot());

        Self {
            api,
            connection,
            session,
            page_size,
            state,
            inbox_tx,
            inbox_rx,
            status_rx,
            snapshot_tx,
        }
    }

    /// 拉取未读数与第一页通知，然后建立推送连接
    ///
    /// 会话没有身份时直接返回，只记录日志。
    pub async fn init(&mut self) {
        let Some(identity) = self.session.identity().map(str::to_string) else {
            warn!("No authenticated session, skipping notification store init");
            return;
        };
        // `&mut self` 排除了并发调用，残留的 loading 只可能来自被取消的 init
        if self.state.is_loading() {
            debug!("Previous notification store init was interrupted, starting over");
        }

        self.state.set_loading(true);
        self.publish();

        if let Err(e) = self.fetch_unread_count().await {
            debug!("Initial unread count fetch failed: {}", e);
        }
        if let Err(e) = self.fetch_notifications().await {
            debug!("Initial notification fetch failed: {}", e);
        }

        self.state.set_loading(false);
        self.publish();

        if self.state.is_session_expired() {
            warn!("Session expired during init, push channel not started");
            return;
        }

        self.connection.connect(&identity, self.inbox_tx.clone()).await;
        info!("Notification store initialized for user {}", identity);
    }

    pub async fn fetch_unread_count(&mut self) -> Result<u64> {
        match self.api.unread_count().await {
            Ok(count) => {
                self.state.set_unread(count);
                self.publish();
                Ok(count)
            }
            Err(e) => Err(self.record_failure("Fetch unread count", e)),
        }
    }

    pub async fn fetch_notifications(&mut self) -> Result<()> {
        match self.api.list(0, self.page_size).await {
            Ok(items) => {
                self.state.replace_recent(items);
                self.publish();
                Ok(())
            }
            Err(e) => Err(self.record_failure("Fetch notifications", e)),
        }
    }

    /// 推送回调：写入缓存并把未读数加一
    pub fn ingest(&mut self, notification: Notification) {
        debug!("Ingesting notification {}", notification.id);
        self.state.ingest(notification);
        self.publish();
    }

    /// 服务端确认后才修改本地状态；返回是否有条目从未读变为已读
    pub async fn mark_read(&mut self, id: NotificationId) -> Result<bool> {
        match self.api.mark_read(id).await {
            Ok(()) => {
                let changed = self.state.apply_mark_read(id);
                self.publish();
                Ok(changed)
            }
            Err(e) => Err(self.record_failure("Mark notification read", e)),
        }
    }

    pub async fn mark_all_read(&mut self) -> Result<()> {
        match self.api.mark_all_read().await {
            Ok(()) => {
                self.state.apply_mark_all_read();
                self.publish();
                Ok(())
            }
            Err(e) => Err(self.record_failure("Mark all notifications read", e)),
        }
    }

    /// 会话结束：断开推送通道并丢弃内存状态
    pub async fn cleanup(&mut self) {
        self.connection.disconnect().await;
        while self.inbox_rx.try_recv().is_ok() {}
        self.state.clear();
        self.publish();
        info!("Notification store cleaned up");
    }

    /// 等待下一个推送或状态变化并应用到缓存
    pub async fn next_event(&mut self) -> Option<StoreEvent> {
        tokio::select! {
            Some(notification) = self.inbox_rx.recv() => {
                self.ingest(notification.clone());
                Some(StoreEvent::Notification(notification))
            }
            Ok(()) = self.status_rx.changed() => {
                let status = *self.status_rx.borrow_and_update();
                self.apply_status(status);
                Some(StoreEvent::Status(status))
            }
            else => None,
        }
    }

    /// 立即处理所有已排队的推送，返回处理条数
    pub fn process_pending(&mut self) -> usize {
        if self.status_rx.has_changed().unwrap_or(false) {
            let status = *self.status_rx.borrow_and_update();
            self.apply_status(status);
        }

        let mut processed = 0;
        while let Ok(notification) = self.inbox_rx.try_recv() {
            self.ingest(notification);
            processed += 1;
        }
        processed
    }

    pub fn recent(&self) -> Vec<Notification> {
        self.state.recent().cloned().collect()
    }

    pub fn unread_count(&self) -> u64 {
        self.state.unread_count()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn is_loading(&self) -> bool {
        self.state.is_loading()
    }

    pub fn is_session_expired(&self) -> bool {
        self.state.is_session_expired()
    }

    pub fn snapshot(&self) -> NotificationSnapshot {
        self.state.snapshot()
    }

    pub fn subscribe_snapshots(&self) -> watch::Receiver<NotificationSnapshot> {
        self.snapshot_tx.subscribe()
    }

    fn apply_status(&mut self, status: ConnectionStatus) {
        debug!("Push channel status: {:?}", status);
        self.state.set_connection_status(status);
        self.publish();
    }

    fn record_failure(&mut self, operation: &str, err: AppError) -> AppError {
        if err.is_session_expired() {
            warn!("{} failed, session expired: {}", operation, err);
            self.state.set_session_expired(true);
            self.publish();
        } else {
            error!("{} failed: {}", operation, err);
        }
        err
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(self.state.snapshot());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PushSettings;
    use crate::models::frame::{Command, Frame};
    use crate::services::notification::MockNotificationApi;
    use crate::services::transport::{MemoryAcceptor, MemoryConnector, MemoryPeer};
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use mockall::predicate::eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::{sync::Semaphore, time};

    fn notification(id: NotificationId, is_read: bool) -> Notification {
        Notification {
            id,
            title: format!("通知 {}", id),
            content: "内容".to_string(),
            notification_type: Some("COURSE".to_string()),
            related_id: None,
            is_read,
            created_at: NaiveDate::from_ymd_opt(2024, 5, 1)
                .unwrap()
                .and_hms_opt(10, 0, 0)
                .unwrap(),
        }
    }

    /// 未读数请求会一直挂起，直到测试放行
    struct GatedApi {
        gate: Semaphore,
        unread_calls: AtomicUsize,
        list_calls: AtomicUsize,
    }

    impl GatedApi {
        fn new() -> Self {
            Self {
                gate: Semaphore::new(0),
                unread_calls: AtomicUsize::new(0),
                list_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl NotificationApi for GatedApi {
        async fn list(&self, _page: u32, _size: u32) -> Result<Vec<Notification>> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![notification(1, false)])
        }

        async fn unread_count(&self) -> Result<u64> {
            self.unread_calls.fetch_add(1, Ordering::SeqCst);
            let _permit = self.gate.acquire().await.unwrap();
            Ok(4)
        }

        async fn mark_read(&self, _id: NotificationId) -> Result<()> {
            Ok(())
        }

        async fn mark_all_read(&self) -> Result<()> {
            Ok(())
        }
    }

    fn store(api: MockNotificationApi, session: Session) -> (NotificationStore, MemoryAcceptor) {
        store_with(Arc::new(api), session)
    }

    fn store_with(
        api: Arc<dyn NotificationApi>,
        session: Session,
    ) -> (NotificationStore, MemoryAcceptor) {
        let (connector, acceptor) = MemoryConnector::pair();
        let settings = PushSettings {
            url: "ws://push.test/ws/websocket".to_string(),
            ..PushSettings::default()
        };
        let connection = ConnectionManager::new(settings, Arc::new(connector));
        let store = NotificationStore::new(api, connection, session, 10, 10);
        (store, acceptor)
    }

    async fn serve(acceptor: &mut MemoryAcceptor) -> MemoryPeer {
        let mut peer = time::timeout(Duration::from_secs(5), acceptor.accept())
            .await
            .expect("no connection attempt")
            .unwrap();
        peer.recv().await.unwrap();
        peer.send(
            Frame::new(Command::Connected)
                .header("version", "1.2")
                .header("heart-beat", "0,0")
                .encode(),
        );
        let subscribe = peer.recv().await.unwrap();
        assert!(subscribe.contains("destination:/user/7/queue/notifications\n"));
        peer
    }

    async fn next_notification(store: &mut NotificationStore) -> Notification {
        loop {
            let event = time::timeout(Duration::from_secs(5), store.next_event())
                .await
                .expect("no event")
                .expect("store closed");
            if let StoreEvent::Notification(n) = event {
                return n;
            }
        }
    }

    #[tokio::test]
    async fn test_init_push_then_mark_read() {
        let mut api = MockNotificationApi::new();
        api.expect_unread_count().times(1).returning(|| Ok(3));
        api.expect_list()
            .with(eq(0), eq(10))
            .times(1)
            .returning(|_, _| Ok(vec![notification(2, false), notification(1, true)]));
        api.expect_mark_read().with(eq(99)).times(1).returning(|_| Ok(()));

        let (mut store, mut acceptor) = store(api, Session::authenticated("7", "tok"));
        store.init().await;
        assert_eq!(store.unread_count(), 3);
        assert_eq!(store.recent().len(), 2);
        assert!(!store.is_loading());

        let peer = serve(&mut acceptor).await;
        let body = serde_json::to_string(&notification(99, false)).unwrap();
        peer.send(
            Frame::new(Command::Message)
                .header("subscription", "sub-0")
                .header("destination", "/user/7/queue/notifications")
                .with_body(body)
                .encode(),
        );

        assert_eq!(next_notification(&mut store).await.id, 99);
        let recent = store.recent();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].id, 99);
        assert_eq!(store.unread_count(), 4);

        assert!(store.mark_read(99).await.unwrap());
        assert_eq!(store.unread_count(), 3);
        assert!(store.recent()[0].is_read);

        let snapshot = store.subscribe_snapshots().borrow().clone();
        assert_eq!(snapshot.unread_count, 3);
        assert_eq!(snapshot.recent.len(), 3);
    }

    #[tokio::test]
    async fn test_interrupted_init_can_be_retried() {
        let api = Arc::new(GatedApi::new());
        let (mut store, mut acceptor) = store_with(api.clone(), Session::authenticated("7", "tok"));
        let snapshots = store.subscribe_snapshots();

        // 未读数请求挂起期间 loading 可见，随后取消这次 init
        assert!(time::timeout(Duration::from_millis(50), store.init()).await.is_err());
        assert!(store.is_loading());
        assert!(snapshots.borrow().loading);
        assert_eq!(api.unread_calls.load(Ordering::SeqCst), 1);
        assert_eq!(api.list_calls.load(Ordering::SeqCst), 0);

        api.gate.add_permits(1);
        store.init().await;
        assert!(!store.is_loading());
        assert!(!snapshots.borrow().loading);
        assert_eq!(store.unread_count(), 4);
        assert_eq!(store.recent().len(), 1);
        assert_eq!(api.unread_calls.load(Ordering::SeqCst), 2);
        assert_eq!(api.list_calls.load(Ordering::SeqCst), 1);

        serve(&mut acceptor).await;
    }

    #[tokio::test]
    async fn test_init_without_identity_is_noop() {
        // 没有设置任何期望：一旦调用 REST 接口就会失败
        let api = MockNotificationApi::new();
        let (mut store, mut acceptor) = store(api, Session::new(Some("7".into()), None));

        store.init().await;
        assert_eq!(store.unread_count(), 0);
        assert!(store.recent().is_empty());
        assert!(time::timeout(Duration::from_millis(100), acceptor.accept()).await.is_err());
        assert_eq!(store.connection_status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_failed_mark_read_keeps_state() {
        let mut api = MockNotificationApi::new();
        api.expect_mark_read()
            .returning(|_| Err(AppError::api("通知不存在")));
        api.expect_mark_all_read()
            .returning(|| Err(AppError::ExternalService("boom".to_string())));

        let (mut store, _acceptor) = store(api, Session::authenticated("7", "tok"));
        store.ingest(notification(1, false));
        assert_eq!(store.unread_count(), 1);

        assert!(matches!(store.mark_read(1).await, Err(AppError::Api(_))));
        assert!(store.mark_all_read().await.is_err());
        assert_eq!(store.unread_count(), 1);
        assert!(!store.recent()[0].is_read);
        assert!(!store.is_session_expired());
    }

    #[tokio::test]
    async fn test_mark_all_read_and_unknown_id() {
        let mut api = MockNotificationApi::new();
        api.expect_mark_read().returning(|_| Ok(()));
        api.expect_mark_all_read().times(1).returning(|| Ok(()));

        let (mut store, _acceptor) = store(api, Session::authenticated("7", "tok"));
        store.ingest(notification(1, false));
        store.ingest(notification(2, false));

        assert!(!store.mark_read(404).await.unwrap());
        assert_eq!(store.unread_count(), 2);

        store.mark_all_read().await.unwrap();
        assert_eq!(store.unread_count(), 0);
        assert!(store.recent().iter().all(|n| n.is_read));
    }

    #[tokio::test]
    async fn test_unauthorized_marks_session_expired() {
        let mut api = MockNotificationApi::new();
        api.expect_unread_count()
            .returning(|| Err(AppError::unauthorized("Session expired")));
        api.expect_list()
            .returning(|_, _| Err(AppError::unauthorized("Session expired")));

        let (mut store, mut acceptor) = store(api, Session::authenticated("7", "tok"));
        let mut snapshots = store.subscribe_snapshots();
        store.init().await;

        assert!(store.is_session_expired());
        assert!(snapshots.borrow_and_update().session_expired);
        assert!(time::timeout(Duration::from_millis(100), acceptor.accept()).await.is_err());
    }

    #[tokio::test]
    async fn test_process_pending_and_cleanup() {
        let mut api = MockNotificationApi::new();
        api.expect_unread_count().returning(|| Ok(0));
        api.expect_list().returning(|_, _| Ok(Vec::new()));

        let (mut store, mut acceptor) = store(api, Session::authenticated("7", "tok"));
        store.init().await;
        let mut peer = serve(&mut acceptor).await;

        for id in [10, 11] {
            let body = serde_json::to_string(&notification(id, false)).unwrap();
            peer.send(
                Frame::new(Command::Message)
                    .header("subscription", "sub-0")
                    .with_body(body)
                    .encode(),
            );
        }
        assert_eq!(next_notification(&mut store).await.id, 10);
        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.process_pending(), 1);
        assert_eq!(store.unread_count(), 2);
        assert_eq!(store.snapshot().connection_status, ConnectionStatus::Connected);

        store.cleanup().await;
        assert!(store.recent().is_empty());
        assert_eq!(store.unread_count(), 0);
        assert_eq!(store.connection_status(), ConnectionStatus::Disconnected);
        assert!(peer.recv().await.unwrap().starts_with("DISCONNECT\n"));
    }
}
