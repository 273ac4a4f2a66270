//! 传输适配层：全双工文本传输的最小抽象
//!
//! 网络错误不会从 `send` 抛出，只会以 `TransportEvent::Closed` 的形式上报。

use async_trait::async_trait;
use futures::{sink::SinkExt, stream::StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::error::{AppError, Result};

/// 传输层向上投递的事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Data(String),
    Closed(Option<String>),
}

/// 发往传输层的指令
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Data(String),
    Close,
}

/// 单个连接实例的句柄
#[derive(Debug)]
pub struct TransportHandle {
    outbound: mpsc::UnboundedSender<Outbound>,
    inbound: mpsc::UnboundedReceiver<TransportEvent>,
    closed: bool,
}

impl TransportHandle {
    pub fn new(
        outbound: mpsc::UnboundedSender<Outbound>,
        inbound: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Self {
        Self {
            outbound,
            inbound,
            closed: false,
        }
    }

    /// 发送文本，失败静默忽略（连接关闭会通过 `recv` 上报）
    pub fn send(&self, data: impl Into<String>) {
        if self.closed {
            return;
        }
        if self.outbound.send(Outbound::Data(data.into())).is_err() {
            debug!("Transport writer already gone, dropping outbound data");
        }
    }

    /// 接收下一个事件；关闭后始终返回 `None`
    pub async fn recv(&mut self) -> Option<TransportEvent> {
        if self.closed {
            return None;
        }
        match self.inbound.recv().await {
            Some(event) => Some(event),
            None => {
                self.closed = true;
                Some(TransportEvent::Closed(None))
            }
        }
    }

    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.outbound.send(Outbound::Close);
        self.inbound.close();
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for TransportHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// 打开传输连接
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, url: &str) -> Result<TransportHandle>;
}

/// 基于 tokio-tungstenite 的 WebSocket 传输
#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self, url: &str) -> Result<TransportHandle> {
        let (websocket, _response) = connect_async(url).await?;
        info!("WebSocket transport opened: {}", url);

        let (mut ws_tx, mut ws_rx) = websocket.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        // 处理发送任务
        let writer_events = inbound_tx.clone();
        tokio::spawn(async move {
            while let Some(outbound) = outbound_rx.recv().await {
                match outbound {
                    Outbound::Data(text) => {
                        if let Err(e) = ws_tx.send(Message::Text(text)).await {
                            warn!("Failed to send WebSocket message: {}", e);
                            let _ = writer_events.send(TransportEvent::Closed(Some(e.to_string())));
                            break;
                        }
                    }
                    Outbound::Close => {
                        if let Err(e) = ws_tx.close().await {
                            debug!("WebSocket close handshake failed: {}", e);
                        }
                        break;
                    }
                }
            }
            debug!("WebSocket writer task ended");
        });

        // 处理接收任务
        tokio::spawn(async move {
            let reason = loop {
                match ws_rx.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if inbound_tx.send(TransportEvent::Data(text)).is_err() {
                            break None;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        let text = String::from_utf8_lossy(&data).into_owned();
                        if inbound_tx.send(TransportEvent::Data(text)).is_err() {
                            break None;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        info!("WebSocket closed by peer");
                        break frame.map(|f| f.reason.into_owned());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("WebSocket receive error: {}", e);
                        break Some(e.to_string());
                    }
                    None => break None,
                }
            };
            let _ = inbound_tx.send(TransportEvent::Closed(reason));
            debug!("WebSocket reader task ended");
        });

        Ok(TransportHandle::new(outbound_tx, inbound_rx))
    }
}

/// 进程内传输：每次 `open` 都会把对端交给 `MemoryAcceptor`
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    accept_tx: mpsc::UnboundedSender<MemoryPeer>,
}

/// 接收 `MemoryConnector` 打开的连接
#[derive(Debug)]
pub struct MemoryAcceptor {
    accept_rx: mpsc::UnboundedReceiver<MemoryPeer>,
}

/// 进程内连接的服务端一侧
#[derive(Debug)]
pub struct MemoryPeer {
    pub url: String,
    from_client: mpsc::UnboundedReceiver<Outbound>,
    to_client: mpsc::UnboundedSender<TransportEvent>,
}

impl MemoryConnector {
    pub fn pair() -> (MemoryConnector, MemoryAcceptor) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        (MemoryConnector { accept_tx }, MemoryAcceptor { accept_rx })
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn open(&self, url: &str) -> Result<TransportHandle> {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let peer = MemoryPeer {
            url: url.to_string(),
            from_client: outbound_rx,
            to_client: inbound_tx,
        };
        self.accept_tx
            .send(peer)
            .map_err(|_| AppError::transport("connection refused"))?;

        Ok(TransportHandle::new(outbound_tx, inbound_rx))
    }
}

impl MemoryAcceptor {
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.accept_rx.recv().await
    }
}

impl MemoryPeer {
    /// 读取客户端发来的下一段文本；客户端关闭连接时返回 `None`
    pub async fn recv(&mut self) -> Option<String> {
        match self.from_client.recv().await {
            Some(Outbound::Data(text)) => Some(text),
            Some(Outbound::Close) | None => None,
        }
    }

    pub fn send(&self, data: impl Into<String>) -> bool {
        self.to_client.send(TransportEvent::Data(data.into())).is_ok()
    }

    /// 模拟网络断开
    pub fn disconnect(self, reason: Option<&str>) {
        let _ = self
            .to_client
            .send(TransportEvent::Closed(reason.map(str::to_string)));
    }
}
