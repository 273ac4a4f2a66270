use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, error, warn};
use url::Url;

use crate::{
    config::Config,
    error::{AppError, Result},
    models::{
        notification::{Notification, NotificationId, NotificationPage},
        response::ApiResponse,
        session::Session,
    },
};

/// 通知相关的 REST 接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationApi: Send + Sync {
    /// `GET /notifications?page&size`
    async fn list(&self, page: u32, size: u32) -> Result<Vec<Notification>>;

    /// `GET /notifications/unread-count`
    async fn unread_count(&self) -> Result<u64>;

    /// `PUT /notifications/{id}/read`
    async fn mark_read(&self, id: NotificationId) -> Result<()>;

    /// `PUT /notifications/read-all`
    async fn mark_all_read(&self) -> Result<()>;
}

/// 基于 reqwest 的通知接口实现
#[derive(Clone)]
pub struct NotificationService {
    http_client: Client,
    base_url: Url,
    session: Session,
}

impl NotificationService {
    pub fn new(config: &Config, session: Session) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Self::with_client(http_client, &config.api_base_url, session)
    }

    pub fn with_client(http_client: Client, base_url: &str, session: Session) -> Result<Self> {
        // 保证结尾有 `/`，否则 join 会替换掉最后一段路径
        let base_url = if base_url.ends_with('/') {
            Url::parse(base_url)?
        } else {
            Url::parse(&format!("{}/", base_url))?
        };

        Ok(Self {
            http_client,
            base_url,
            session,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        Ok(self.base_url.join(path)?)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match self.session.bearer() {
            Some(bearer) => request.header("Authorization", bearer),
            None => request,
        }
    }

    async fn execute<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<ApiResponse<T>> {
        let response = self.authorize(request).send().await.map_err(|e| {
            error!("Notification request failed: {}", e);
            AppError::ExternalService(format!("Notification service unreachable: {}", e))
        })?;

        let response = check_status(response).await?;

        response.json::<ApiResponse<T>>().await.map_err(|e| {
            error!("Failed to parse notification service response: {}", e);
            AppError::ExternalService("Invalid response from notification service".to_string())
        })
    }
}

async fn check_status(response: Response) -> Result<Response> {
    match response.status() {
        status if status.is_success() => Ok(response),
        StatusCode::UNAUTHORIZED => {
            warn!("Notification service rejected credentials (401)");
            Err(AppError::unauthorized("Session expired"))
        }
        StatusCode::FORBIDDEN => {
            warn!("Notification service denied access (403)");
            Err(AppError::forbidden("Access to notifications denied"))
        }
        status => {
            // 错误响应也可能带有信封，优先使用其中的 message
            let message = response
                .json::<ApiResponse<serde_json::Value>>()
                .await
                .ok()
                .and_then(|envelope| envelope.message);
            warn!("Notification service returned error status: {} ({:?})", status, message);
            Err(AppError::ExternalService(match message {
                Some(message) => format!("Notification service returned {}: {}", status, message),
                None => format!("Notification service returned {}", status),
            }))
        }
    }
}

#[async_trait]
impl NotificationApi for NotificationService {
    async fn list(&self, page: u32, size: u32) -> Result<Vec<Notification>> {
        let url = self.endpoint("notifications")?;
        let request = self
            .http_client
            .get(url)
            .query(&[("page", page), ("size", size)]);

        let items = self
            .execute::<NotificationPage>(request)
            .await?
            .into_data()?
            .into_items();
        debug!("Fetched {} notifications (page {}, size {})", items.len(), page, size);
        Ok(items)
    }

    async fn unread_count(&self) -> Result<u64> {
        let url = self.endpoint("notifications/unread-count")?;
        let count = self
            .execute::<u64>(self.http_client.get(url))
            .await?
            .into_data()?;
        debug!("Unread notification count: {}", count);
        Ok(count)
    }

    async fn mark_read(&self, id: NotificationId) -> Result<()> {
        let url = self.endpoint(&format!("notifications/{}/read", id))?;
        self.execute::<serde_json::Value>(self.http_client.put(url))
            .await?
            .into_result()?;
        Ok(())
    }

    async fn mark_all_read(&self) -> Result<()> {
        let url = self.endpoint("notifications/read-all")?;
        self.execute::<serde_json::Value>(self.http_client.put(url))
            .await?
            .into_result()?;
        Ok(())
    }
}
