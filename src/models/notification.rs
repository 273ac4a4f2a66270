use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::utils::serde_helpers::java_datetime;

/// 服务端分配的通知ID
pub type NotificationId = i64;

/// 通知记录（REST 与推送通道共用同一 JSON 形态）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: NotificationId,
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub notification_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_id: Option<i64>,
    #[serde(default)]
    pub is_read: bool,
    #[serde(with = "java_datetime")]
    pub created_at: NaiveDateTime,
}

impl Notification {
    /// 标记为已读；仅在未读时生效，返回是否发生了状态变化
    pub fn mark_read(&mut self) -> bool {
        if self.is_read {
            return false;
        }
        self.is_read = true;
        true
    }
}

/// Spring `Page` 结构中客户端关心的部分
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub content: Vec<T>,
    #[serde(default)]
    pub total_elements: u64,
    #[serde(default)]
    pub total_pages: u32,
    #[serde(default)]
    pub number: u32,
    #[serde(default)]
    pub size: u32,
}

/// 通知列表接口可能返回分页对象，也可能直接返回数组
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum NotificationPage {
    Paged(Page<Notification>),
    List(Vec<Notification>),
}

impl NotificationPage {
    pub fn into_items(self) -> Vec<Notification> {
        match self {
            NotificationPage::Paged(page) => page.content,
            NotificationPage::List(items) => items,
        }
    }
}
