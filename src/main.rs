use std::sync::Arc;

use course_notify::{
    config::Config,
    services::{
        ConnectionManager, NotificationService, NotificationStore, StoreEvent, WebSocketConnector,
    },
};
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 加载配置
    dotenv::dotenv().ok();
    let config = Config::from_env()?;

    // 初始化日志：生产环境输出 JSON
    let production = config.is_production();
    tracing_subscriber::registry()
        .with(EnvFilter::new(&config.log_level))
        .with(production.then(|| fmt::layer().json()))
        .with((!production).then(|| fmt::layer()))
        .init();

    info!("Starting course notification client ({})", config.environment);

    let session = config.session();
    if session.identity().is_none() {
        warn!("USER_ID or AUTH_TOKEN not set, push channel will not be started");
    }

    let api = NotificationService::new(&config, session.clone())?;
    let connection = ConnectionManager::new(config.push_settings(), Arc::new(WebSocketConnector::new()));
    let mut store = NotificationStore::new(
        Arc::new(api),
        connection,
        session,
        config.notification_page_size,
        config.recent_limit,
    );

    store.init().await;
    info!(
        "Loaded {} recent notifications, {} unread",
        store.recent().len(),
        store.unread_count()
    );

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown signal received");
                break;
            }
            event = store.next_event() => match event {
                Some(StoreEvent::Notification(n)) => {
                    info!(
                        "[{}] {}: {} (unread: {})",
                        n.notification_type.as_deref().unwrap_or("NOTICE"),
                        n.title,
                        n.content,
                        store.unread_count()
                    );
                }
                Some(StoreEvent::Status(status)) => info!("Push channel status: {:?}", status),
                None => break,
            }
        }

        if store.is_session_expired() {
            warn!("Session expired, please log in again");
            break;
        }
    }

    store.cleanup().await;
    info!("Course notification client stopped");
    Ok(())
}
