use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// 标准API响应格式
///
/// 确认类接口（标记已读）只返回 `success` 与 `message`，因此 `data` 可缺省。
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T> ApiResponse<T> {
    /// `success: false` 与传输层失败同等对待
    pub fn into_result(self) -> Result<Option<T>> {
        if self.success {
            Ok(self.data)
        } else {
            Err(AppError::Api(
                self.message
                    .unwrap_or_else(|| "request was not successful".to_string()),
            ))
        }
    }

    /// 要求响应携带数据
    pub fn into_data(self) -> Result<T> {
        self.into_result()?
            .ok_or_else(|| AppError::api("response envelope carried no data"))
    }
}
