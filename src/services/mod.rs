pub mod connection;
pub mod notification;
pub mod reconnect;
pub mod stomp;
pub mod store;
pub mod transport;

// 重新导出常用类型
pub use connection::ConnectionManager;
pub use notification::{NotificationApi, NotificationService};
pub use reconnect::ReconnectPolicy;
pub use stomp::PushClient;
pub use store::{NotificationStore, StoreEvent};
pub use transport::{Connector, MemoryAcceptor, MemoryConnector, MemoryPeer, WebSocketConnector};
