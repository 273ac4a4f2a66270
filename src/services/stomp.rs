//! 推送通道协议客户端（STOMP over WebSocket）
//!
//! 每次 `activate()` 都会启动一个独立的连接实例任务，负责握手、心跳、订阅与帧分发。
//! 该层不做自动重连，关闭事件交由上层的重连策略处理。

use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::{self, Instant, Interval, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::{
    config::PushSettings,
    error::{AppError, Result},
    models::{
        frame::{Command, Decoded, Frame, FrameDecoder, HeartBeat, HEARTBEAT_EOL},
        notification::Notification,
        websocket::{ClientEvent, ClientState},
    },
    services::transport::{Connector, TransportEvent, TransportHandle},
};

const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

enum SessionCommand {
    Subscribe {
        destination: String,
        sink: mpsc::UnboundedSender<Notification>,
        reply: oneshot::Sender<Result<String>>,
    },
    Disconnect,
}

/// 推送通道协议客户端
pub struct PushClient {
    settings: PushSettings,
    connector: Arc<dyn Connector>,
    state_tx: Arc<watch::Sender<ClientState>>,
    events_tx: mpsc::UnboundedSender<ClientEvent>,
    commands: Option<mpsc::UnboundedSender<SessionCommand>>,
    task: Option<JoinHandle<()>>,
}

impl PushClient {
    /// 创建客户端，同时返回生命周期事件接收端
    pub fn new(
        settings: PushSettings,
        connector: Arc<dyn Connector>,
    ) -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ClientState::Idle);

        let client = Self {
            settings,
            connector,
            state_tx: Arc::new(state_tx),
            events_tx,
            commands: None,
            task: None,
        };
        (client, events_rx)
    }

    pub fn state(&self) -> ClientState {
        *self.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ClientState> {
        self.state_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ClientState::Ready
    }

    /// Idle/Closed → Handshaking：打开传输并发送握手帧
    pub fn activate(&mut self) {
        if matches!(self.state(), ClientState::Handshaking | ClientState::Ready) {
            debug!("Push client already active, ignoring activate");
            return;
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        self.state_tx.send_replace(ClientState::Handshaking);

        let session = Session::new(
            self.settings.clone(),
            self.state_tx.clone(),
            self.events_tx.clone(),
        );
        self.task = Some(tokio::spawn(session.run(self.connector.clone(), commands_rx)));
        self.commands = Some(commands_tx);
    }

    /// 订阅目的地；仅在 Ready 状态有效，同一连接实例内每个目的地只允许一个订阅
    pub async fn subscribe(
        &self,
        destination: &str,
        sink: mpsc::UnboundedSender<Notification>,
    ) -> Result<String> {
        if !self.is_connected() {
            return Err(AppError::NotConnected);
        }
        let commands = self.commands.as_ref().ok_or(AppError::NotConnected)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        commands
            .send(SessionCommand::Subscribe {
                destination: destination.to_string(),
                sink,
                reply: reply_tx,
            })
            .map_err(|_| AppError::NotConnected)?;

        reply_rx.await.map_err(|_| AppError::NotConnected)?
    }

    /// 任意状态 → Closed；可重复调用
    pub async fn deactivate(&mut self) {
        if let Some(commands) = self.commands.take() {
            let _ = commands.send(SessionCommand::Disconnect);
        }
        if let Some(mut task) = self.task.take() {
            if time::timeout(DISCONNECT_GRACE, &mut task).await.is_err() {
                warn!("Push session did not stop within {:?}, aborting", DISCONNECT_GRACE);
                task.abort();
            }
        }
        self.state_tx.send_replace(ClientState::Closed);
    }
}

impl Drop for PushClient {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct Subscription {
    destination: String,
    sink: mpsc::UnboundedSender<Notification>,
}

/// 帧处理结果
enum FrameOutcome {
    Continue,
    Connected {
        send_every: Option<Duration>,
        expect_every: Option<Duration>,
    },
    Close(String),
}

/// 单个连接实例
struct Session {
    settings: PushSettings,
    state_tx: Arc<watch::Sender<ClientState>>,
    events_tx: mpsc::UnboundedSender<ClientEvent>,
    subscriptions: HashMap<String, Subscription>,
    next_subscription: u64,
    decoder: FrameDecoder,
    ready: bool,
}

impl Session {
    fn new(
        settings: PushSettings,
        state_tx: Arc<watch::Sender<ClientState>>,
        events_tx: mpsc::UnboundedSender<ClientEvent>,
    ) -> Self {
        Self {
            settings,
            state_tx,
            events_tx,
            subscriptions: HashMap::new(),
            next_subscription: 0,
            decoder: FrameDecoder::new(),
            ready: false,
        }
    }

    fn client_heart_beat(&self) -> HeartBeat {
        HeartBeat::new(self.settings.heartbeat_outgoing, self.settings.heartbeat_incoming)
    }

    async fn run(
        mut self,
        connector: Arc<dyn Connector>,
        mut commands: mpsc::UnboundedReceiver<SessionCommand>,
    ) {
        let url = self.settings.url.clone();
        let mut transport = match connector.open(&url).await {
            Ok(transport) => transport,
            Err(e) => {
                warn!("Failed to open push transport {}: {}", url, e);
                self.finish(Some(e.to_string()));
                return;
            }
        };

        let host = url::Url::parse(&url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| "localhost".to_string());
        let connect = Frame::connect(
            &host,
            self.client_heart_beat(),
            self.settings.auth_token.as_deref(),
        );
        transport.send(connect.encode());
        debug!("Sent CONNECT to {}", host);

        let handshake_deadline = time::sleep(self.settings.handshake_timeout);
        tokio::pin!(handshake_deadline);

        let mut last_activity = Instant::now();
        let mut outgoing: Option<Interval> = None;
        let mut incoming: Option<Interval> = None;
        let mut incoming_ttl = Duration::ZERO;

        let reason = loop {
            tokio::select! {
                _ = &mut handshake_deadline, if !self.ready => {
                    warn!("Push handshake timed out after {:?}", self.settings.handshake_timeout);
                    let millis = u64::try_from(self.settings.handshake_timeout.as_millis())
                        .unwrap_or(u64::MAX);
                    break AppError::HandshakeTimeout(millis).to_string();
                }
                event = transport.recv() => match event {
                    Some(TransportEvent::Data(text)) => {
                        last_activity = Instant::now();
                        self.decoder.extend(text.as_bytes());
                        match self.drain_frames() {
                            FrameOutcome::Continue => {}
                            FrameOutcome::Connected { send_every, expect_every } => {
                                outgoing = send_every.map(keep_alive);
                                incoming = expect_every.map(keep_alive);
                                incoming_ttl = expect_every.unwrap_or_default();
                            }
                            FrameOutcome::Close(reason) => break reason,
                        }
                    }
                    Some(TransportEvent::Closed(reason)) => {
                        break reason.unwrap_or_else(|| "transport closed".to_string());
                    }
                    None => break "transport closed".to_string(),
                },
                command = commands.recv() => match command {
                    Some(SessionCommand::Subscribe { destination, sink, reply }) => {
                        let _ = reply.send(self.subscribe(&transport, destination, sink));
                    }
                    Some(SessionCommand::Disconnect) | None => {
                        self.shutdown(&mut transport);
                        return;
                    }
                },
                _ = tick(&mut outgoing) => {
                    transport.send(HEARTBEAT_EOL);
                }
                _ = tick(&mut incoming) => {
                    let silent_for = last_activity.elapsed();
                    if silent_for > incoming_ttl * 2 {
                        warn!("No data from server for {:?}, closing push channel", silent_for);
                        break format!("heart-beat timeout after {:?}", silent_for);
                    }
                }
            }
        };

        transport.close();
        self.finish(Some(reason));
    }

    /// 取出缓冲区内所有完整帧并处理
    fn drain_frames(&mut self) -> FrameOutcome {
        let mut outcome = FrameOutcome::Continue;
        while let Some(decoded) = self.decoder.next_frame() {
            match decoded {
                Ok(Decoded::HeartBeat) => {}
                Ok(Decoded::Frame(frame)) => match self.handle_frame(frame) {
                    FrameOutcome::Continue => {}
                    FrameOutcome::Close(reason) => return FrameOutcome::Close(reason),
                    connected => outcome = connected,
                },
                Err(e) => warn!("Dropping malformed frame: {}", e),
            }
        }
        outcome
    }

    fn handle_frame(&mut self, frame: Frame) -> FrameOutcome {
        match frame.command {
            Command::Connected if !self.ready => self.on_connected(&frame),
            Command::Message if self.ready => {
                self.dispatch(frame);
                FrameOutcome::Continue
            }
            Command::Error => {
                let message = frame
                    .get("message")
                    .map(str::to_string)
                    .unwrap_or_else(|| frame.body.clone());
                error!("STOMP error: {}", message);
                let _ = self.events_tx.send(ClientEvent::Error(message.clone()));
                if self.ready {
                    FrameOutcome::Continue
                } else {
                    FrameOutcome::Close(format!("handshake rejected: {}", message))
                }
            }
            Command::Receipt => {
                debug!("Received receipt: {:?}", frame.get("receipt-id"));
                FrameOutcome::Continue
            }
            other => {
                warn!("Unexpected {} frame in state ready={}", other.as_str(), self.ready);
                FrameOutcome::Continue
            }
        }
    }

    fn on_connected(&mut self, frame: &Frame) -> FrameOutcome {
        let server_heart_beat = match frame.get("heart-beat").map(HeartBeat::parse) {
            Some(Ok(hb)) => hb,
            Some(Err(e)) => {
                warn!("Ignoring server heart-beat header: {}", e);
                HeartBeat::default()
            }
            None => HeartBeat::default(),
        };
        let (send_every, expect_every) = self.client_heart_beat().negotiate(&server_heart_beat);

        self.ready = true;
        self.state_tx.send_replace(ClientState::Ready);
        info!(
            "Push channel connected (version {:?}, send heart-beat {:?}, expect heart-beat {:?})",
            frame.get("version"),
            send_every,
            expect_every
        );

        let _ = self.events_tx.send(ClientEvent::Connected {
            version: frame.get("version").map(str::to_string),
            server: frame.get("server").map(str::to_string),
        });

        FrameOutcome::Connected {
            send_every,
            expect_every,
        }
    }

    fn subscribe(
        &mut self,
        transport: &TransportHandle,
        destination: String,
        sink: mpsc::UnboundedSender<Notification>,
    ) -> Result<String> {
        if !self.ready {
            return Err(AppError::NotConnected);
        }
        if self.subscriptions.values().any(|s| s.destination == destination) {
            return Err(AppError::AlreadySubscribed(destination));
        }

        let id = format!("sub-{}", self.next_subscription);
        self.next_subscription += 1;

        transport.send(Frame::subscribe(&id, &destination).encode());
        info!("Subscribed to {} as {}", destination, id);
        self.subscriptions
            .insert(id.clone(), Subscription { destination, sink });
        Ok(id)
    }

    /// 按 `subscription` 头部路由，缺失时按 `destination` 匹配
    fn dispatch(&self, frame: Frame) {
        let subscription = frame
            .get("subscription")
            .and_then(|id| self.subscriptions.get(id))
            .or_else(|| {
                frame.get("destination").and_then(|destination| {
                    self.subscriptions
                        .values()
                        .find(|s| s.destination == destination)
                })
            });

        let Some(subscription) = subscription else {
            warn!(
                "Dropping MESSAGE for unknown subscription {:?}",
                frame.get("subscription")
            );
            return;
        };

        match serde_json::from_str::<Notification>(&frame.body) {
            Ok(notification) => {
                debug!("Notification {} received on {}", notification.id, subscription.destination);
                if subscription.sink.send(notification).is_err() {
                    warn!("Notification receiver for {} is gone", subscription.destination);
                }
            }
            Err(e) => {
                warn!(
                    "Dropping undecodable notification on {}: {}",
                    subscription.destination, e
                );
            }
        }
    }

    fn shutdown(&mut self, transport: &mut TransportHandle) {
        if self.ready {
            transport.send(Frame::disconnect().encode());
        }
        transport.close();
        self.ready = false;
        self.state_tx.send_replace(ClientState::Closed);
        info!("Push channel deactivated");
    }

    fn finish(&mut self, reason: Option<String>) {
        self.ready = false;
        self.state_tx.send_replace(ClientState::Closed);
        info!("Push channel closed: {}", reason.as_deref().unwrap_or("no reason"));
        let _ = self.events_tx.send(ClientEvent::Closed { reason });
    }
}

impl Drop for Session {
    // 任务 panic 时仍需上报关闭，否则上层会一直认为连接可用
    fn drop(&mut self) {
        if std::thread::panicking() {
            error!("Push session task panicked, reporting channel as closed");
            self.state_tx.send_replace(ClientState::Closed);
            let _ = self.events_tx.send(ClientEvent::Closed {
                reason: Some("push session task panicked".to_string()),
            });
        }
    }
}

fn keep_alive(period: Duration) -> Interval {
    let mut interval = time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::transport::{MemoryAcceptor, MemoryConnector, MemoryPeer};

    fn settings() -> PushSettings {
        PushSettings {
            url: "ws://push.test:8080/ws/websocket".to_string(),
            handshake_timeout: Duration::from_secs(1),
            ..PushSettings::default()
        }
    }

    fn client() -> (PushClient, mpsc::UnboundedReceiver<ClientEvent>, MemoryAcceptor) {
        let (connector, acceptor) = MemoryConnector::pair();
        let (client, events) = PushClient::new(settings(), Arc::new(connector));
        (client, events, acceptor)
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<ClientEvent>) -> ClientEvent {
        time::timeout(Duration::from_secs(60), events.recv())
            .await
            .expect("timed out waiting for client event")
            .expect("event channel closed")
    }

    async fn accept_and_handshake(acceptor: &mut MemoryAcceptor, server_heart_beat: &str) -> (MemoryPeer, String) {
        let mut peer = acceptor.accept().await.unwrap();
        let connect = peer.recv().await.unwrap();
        peer.send(
            Frame::new(Command::Connected)
                .header("version", "1.2")
                .header("heart-beat", server_heart_beat)
                .encode(),
        );
        (peer, connect)
    }

    fn message(subscription: &str, body: &str) -> String {
        Frame::new(Command::Message)
            .header("subscription", subscription)
            .header("destination", "/user/7/queue/notifications")
            .header("message-id", "m-1")
            .with_body(body)
            .encode()
    }

    const PAYLOAD: &str = r#"{"id":99,"title":"新通知","content":"课程已更新","isRead":false,"createdAt":"2024-05-01T10:00:00"}"#;

    #[tokio::test]
    async fn test_handshake_subscribe_and_deliver() {
        let (mut client, mut events, mut acceptor) = client();
        client.activate();
        assert_eq!(client.state(), ClientState::Handshaking);

        let (mut peer, connect) = accept_and_handshake(&mut acceptor, "0,0").await;
        assert!(connect.starts_with("CONNECT\n"));
        assert!(connect.contains("host:push.test\n"));
        assert!(connect.contains("heart-beat:4000,4000\n"));

        assert!(matches!(next_event(&mut events).await, ClientEvent::Connected { .. }));
        assert!(client.is_connected());

        let (sink, mut notifications) = mpsc::unbounded_channel();
        let id = client
            .subscribe("/user/7/queue/notifications", sink)
            .await
            .unwrap();
        assert_eq!(id, "sub-0");

        let subscribe = peer.recv().await.unwrap();
        assert!(subscribe.starts_with("SUBSCRIBE\n"));
        assert!(subscribe.contains("destination:/user/7/queue/notifications\n"));

        peer.send(message("sub-0", PAYLOAD));
        let notification = notifications.recv().await.unwrap();
        assert_eq!(notification.id, 99);
        assert_eq!(notification.title, "新通知");
    }

    #[tokio::test]
    async fn test_subscribe_requires_ready_state() {
        let (mut client, _events, _acceptor) = client();
        let (sink, _rx) = mpsc::unbounded_channel();
        assert!(matches!(
            client.subscribe("/user/7/queue/notifications", sink.clone()).await,
            Err(AppError::NotConnected)
        ));

        client.activate();
        assert!(matches!(
            client.subscribe("/user/7/queue/notifications", sink).await,
            Err(AppError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_one_subscription_per_destination() {
        let (mut client, mut events, mut acceptor) = client();
        client.activate();
        let (_peer, _) = accept_and_handshake(&mut acceptor, "0,0").await;
        next_event(&mut events).await;

        let (sink, _rx) = mpsc::unbounded_channel();
        client.subscribe("/user/7/queue/notifications", sink.clone()).await.unwrap();
        assert!(matches!(
            client.subscribe("/user/7/queue/notifications", sink).await,
            Err(AppError::AlreadySubscribed(_))
        ));
    }

    #[tokio::test]
    async fn test_malformed_payload_is_dropped() {
        let (mut client, mut events, mut acceptor) = client();
        client.activate();
        let (mut peer, _) = accept_and_handshake(&mut acceptor, "0,0").await;
        next_event(&mut events).await;

        let (sink, mut notifications) = mpsc::unbounded_channel();
        client.subscribe("/user/7/queue/notifications", sink).await.unwrap();
        peer.recv().await.unwrap();

        peer.send(message("sub-0", "not json"));
        peer.send("GARBAGE\n\n\0");
        peer.send(message("sub-0", PAYLOAD));

        assert_eq!(notifications.recv().await.unwrap().id, 99);
        assert!(notifications.try_recv().is_err());
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_transport_failure_closes() {
        let (mut client, mut events, mut acceptor) = client();
        client.activate();
        let (peer, _) = accept_and_handshake(&mut acceptor, "0,0").await;
        next_event(&mut events).await;

        peer.disconnect(Some("connection reset"));
        assert_eq!(
            next_event(&mut events).await,
            ClientEvent::Closed {
                reason: Some("connection reset".to_string())
            }
        );
        assert_eq!(client.state(), ClientState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout() {
        let (mut client, mut events, mut acceptor) = client();
        client.activate();
        let mut peer = acceptor.accept().await.unwrap();
        peer.recv().await.unwrap();

        match next_event(&mut events).await {
            ClientEvent::Closed { reason } => {
                assert!(reason.unwrap().contains("Handshake timed out"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(client.state(), ClientState::Closed);
    }

    #[tokio::test]
    async fn test_error_frame_during_handshake() {
        let (mut client, mut events, mut acceptor) = client();
        client.activate();
        let mut peer = acceptor.accept().await.unwrap();
        peer.recv().await.unwrap();

        peer.send(
            Frame::new(Command::Error)
                .header("message", "Access denied")
                .encode(),
        );

        assert_eq!(
            next_event(&mut events).await,
            ClientEvent::Error("Access denied".to_string())
        );
        assert!(matches!(next_event(&mut events).await, ClientEvent::Closed { .. }));
        assert_eq!(client.state(), ClientState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heart_beats_and_silence_timeout() {
        let (mut client, mut events, mut acceptor) = client();
        client.activate();
        let (mut peer, _) = accept_and_handshake(&mut acceptor, "1000,1000").await;
        next_event(&mut events).await;

        // 客户端按协商周期发送心跳
        assert_eq!(peer.recv().await.as_deref(), Some(HEARTBEAT_EOL));

        match next_event(&mut events).await {
            ClientEvent::Closed { reason } => assert!(reason.unwrap().contains("heart-beat timeout")),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_deactivate_is_idempotent() {
        let (mut client, mut events, mut acceptor) = client();
        client.activate();
        let (mut peer, _) = accept_and_handshake(&mut acceptor, "0,0").await;
        next_event(&mut events).await;

        client.deactivate().await;
        assert_eq!(client.state(), ClientState::Closed);
        assert!(peer.recv().await.unwrap().starts_with("DISCONNECT\n"));
        assert_eq!(peer.recv().await, None);

        client.deactivate().await;
        assert_eq!(client.state(), ClientState::Closed);
    }

    #[tokio::test]
    async fn test_reactivate_starts_fresh_instance() {
        let (mut client, mut events, mut acceptor) = client();
        client.activate();
        let (peer, _) = accept_and_handshake(&mut acceptor, "0,0").await;
        next_event(&mut events).await;
        let (sink, _rx) = mpsc::unbounded_channel();
        client.subscribe("/user/7/queue/notifications", sink.clone()).await.unwrap();

        peer.disconnect(None);
        assert!(matches!(next_event(&mut events).await, ClientEvent::Closed { .. }));

        client.activate();
        let (_peer, _) = accept_and_handshake(&mut acceptor, "0,0").await;
        next_event(&mut events).await;
        let id = client
            .subscribe("/user/7/queue/notifications", sink)
            .await
            .unwrap();
        assert_eq!(id, "sub-0");
    }

    #[tokio::test]
    async fn test_panicking_session_reports_closed() {
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ClientState::Ready);
        let session = Session::new(settings(), Arc::new(state_tx), events_tx);

        let task = tokio::spawn(async move {
            let _session = session;
            panic!("decoder bug");
        });
        assert!(task.await.unwrap_err().is_panic());

        assert_eq!(*state_rx.borrow(), ClientState::Closed);
        assert!(matches!(
            next_event(&mut events).await,
            ClientEvent::Closed { reason: Some(r) } if r.contains("panicked")
        ));
    }

    #[tokio::test]
    async fn test_hostile_frame_keeps_channel_alive() {
        let (mut client, mut events, mut acceptor) = client();
        client.activate();
        let (peer, _) = accept_and_handshake(&mut acceptor, "0,0").await;
        assert!(matches!(next_event(&mut events).await, ClientEvent::Connected { .. }));

        let (sink, mut notifications) = mpsc::unbounded_channel();
        client
            .subscribe("/user/7/queue/notifications", sink)
            .await
            .unwrap();

        peer.send("MESSAGE\nsubscription:sub-0\ncontent-length:18446744073709551615\n\nx\0");
        peer.send("MESSAGE\nsubscription:sub-0\ncontent-length:1000000\n\nx\0");
        peer.send(message("sub-0", PAYLOAD));

        let notification = time::timeout(Duration::from_secs(5), notifications.recv())
            .await
            .expect("notification not delivered after bad frames")
            .unwrap();
        assert_eq!(notification.id, 99);
        assert!(client.is_connected());
    }
}
