use std::sync::Arc;

use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time,
};
use tracing::{debug, error, info, warn};

use crate::{
    config::PushSettings,
    models::{
        notification::Notification,
        websocket::{ClientEvent, ClientState, ConnectionStatus, Destination},
    },
    services::{reconnect::ReconnectPolicy, stomp::PushClient, transport::Connector},
};

/// 推送通道连接管理器
///
/// 每个会话只持有一个实例，并保证同一时刻只存在一条推送连接。
/// 连接由后台监督任务驱动：握手成功后订阅用户私有队列，断开后按重连策略重试。
pub struct ConnectionManager {
    settings: PushSettings,
    connector: Arc<dyn Connector>,
    status_tx: Arc<watch::Sender<ConnectionStatus>>,
    active: Option<ActiveConnection>,
}

struct ActiveConnection {
    identity: String,
    shutdown: Option<oneshot::Sender<()>>,
    supervisor: JoinHandle<()>,
}

impl ConnectionManager {
    pub fn new(settings: PushSettings, connector: Arc<dyn Connector>) -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            settings,
            connector,
            status_tx: Arc::new(status_tx),
            active: None,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status_tx.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.active.is_some() && self.status() == ConnectionStatus::Connected
    }

    /// 建立推送连接并把收到的通知转发给 `on_notification`
    ///
    /// 已存在就绪连接时不做任何事，避免重复订阅。其他情况下旧连接会先被拆除。
    pub async fn connect(
        &mut self,
        identity: &str,
        on_notification: mpsc::UnboundedSender<Notification>,
    ) {
        if self.is_connected() {
            debug!("Push channel already connected, ignoring connect for user {}", identity);
            return;
        }
        if self.active.is_some() {
            self.disconnect().await;
        }

        let (client, events) = PushClient::new(self.settings.clone(), self.connector.clone());
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let supervisor = Supervisor {
            client,
            events,
            destination: Destination::UserNotifications.path(identity),
            sink: on_notification,
            policy: ReconnectPolicy::new(
                self.settings.reconnect_delay,
                self.settings.max_reconnect_attempts,
            ),
            status_tx: self.status_tx.clone(),
        };

        info!("Connecting push channel for user {}", identity);
        self.active = Some(ActiveConnection {
            identity: identity.to_string(),
            shutdown: Some(shutdown_tx),
            supervisor: tokio::spawn(supervisor.run(shutdown_rx)),
        });
    }

    /// 关闭推送连接并取消所有后台定时器；未连接时调用也是安全的
    pub async fn disconnect(&mut self) {
        if let Some(mut active) = self.active.take() {
            if let Some(shutdown) = active.shutdown.take() {
                let _ = shutdown.send(());
            }
            if let Err(e) = (&mut active.supervisor).await {
                if !e.is_cancelled() {
                    error!("Push supervisor for user {} failed: {}", active.identity, e);
                }
            }
            info!("Push channel disconnected for user {}", active.identity);
        }
        self.status_tx.send_replace(ConnectionStatus::Disconnected);
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            active.supervisor.abort();
        }
    }
}

/// 连接监督任务：生命周期事件 → 订阅 / 重连
struct Supervisor {
    client: PushClient,
    events: mpsc::UnboundedReceiver<ClientEvent>,
    destination: String,
    sink: mpsc::UnboundedSender<Notification>,
    policy: ReconnectPolicy,
    status_tx: Arc<watch::Sender<ConnectionStatus>>,
}

impl Supervisor {
    async fn run(mut self, mut shutdown: oneshot::Receiver<()>) {
        let mut client_state = self.client.watch_state();
        self.client.activate();
        self.mirror(&mut client_state);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                changed = client_state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.mirror(&mut client_state);
                }
                event = self.events.recv() => match event {
                    Some(ClientEvent::Connected { .. }) => {
                        self.policy.on_connect();
                        match self.client.subscribe(&self.destination, self.sink.clone()).await {
                            Ok(id) => debug!("Notification subscription {} active", id),
                            Err(e) => error!("Failed to subscribe to {}: {}", self.destination, e),
                        }
                    }
                    Some(ClientEvent::Error(message)) => {
                        warn!("Push channel reported error: {}", message);
                    }
                    Some(ClientEvent::Closed { reason }) => {
                        self.mirror(&mut client_state);
                        let Some(delay) = self.policy.on_close() else {
                            warn!(
                                "Push channel closed ({}) and will stay closed",
                                reason.as_deref().unwrap_or("no reason")
                            );
                            continue;
                        };
                        tokio::select! {
                            _ = &mut shutdown => break,
                            _ = time::sleep(delay) => {
                                info!("Reconnecting push channel (attempt {})", self.policy.attempts());
                                self.client.activate();
                                self.mirror(&mut client_state);
                            }
                        }
                    }
                    None => break,
                }
            }
        }

        self.client.deactivate().await;
    }

    /// 连接状态由协议客户端状态机映射而来
    fn mirror(&self, client_state: &mut watch::Receiver<ClientState>) {
        let status = ConnectionStatus::from(*client_state.borrow_and_update());
        self.status_tx.send_replace(status);
    }
}
