pub mod frame;
pub mod notification;
pub mod response;
pub mod session;
pub mod websocket;

// 重新导出常用类型
pub use notification::{Notification, NotificationId, NotificationPage};
pub use response::ApiResponse;
pub use session::Session;
pub use websocket::{ClientEvent, ClientState, ConnectionStatus, Destination};
