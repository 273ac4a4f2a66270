use serde::{Deserialize, Serialize};

/// 已认证会话的身份信息，由登录流程（外部协作方）提供
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub user_id: Option<String>,
    pub token: Option<String>,
}

impl Session {
    pub fn new(user_id: Option<String>, token: Option<String>) -> Self {
        Self { user_id, token }
    }

    pub fn authenticated(user_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            token: Some(token.into()),
        }
    }

    /// 用户身份；缺少身份或令牌时视为未登录
    pub fn identity(&self) -> Option<&str> {
        match (&self.user_id, &self.token) {
            (Some(id), Some(token)) if !id.is_empty() && !token.is_empty() => Some(id.as_str()),
            _ => None,
        }
    }

    pub fn bearer(&self) -> Option<String> {
        self.token.as_ref().map(|t| format!("Bearer {}", t))
    }
}
