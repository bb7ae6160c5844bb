use serde::{Deserialize, Serialize};
use std::fmt;

use crate::models::provider::Provider;

/// 供应商凭证
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiKeyConfig {
    pub provider: Provider,
    pub api_key: String,
    /// 首次使用后写入：成功为 true，被供应商拒绝为 false
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_valid: Option<bool>,
}

impl ApiKeyConfig {
    pub fn new(provider: Provider, api_key: impl Into<String>) -> Self {
        Self {
            provider,
            api_key: api_key.into(),
            is_valid: None,
        }
    }

    /// 空白 key 视为未配置
    pub fn is_present(&self) -> bool {
        !self.api_key.trim().is_empty()
    }
}

// 避免 key 出现在日志里
impl fmt::Debug for ApiKeyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiKeyConfig")
            .field("provider", &self.provider)
            .field("api_key", &format_args!("***{}", key_suffix(&self.api_key)))
            .field("is_valid", &self.is_valid)
            .finish()
    }
}

fn key_suffix(key: &str) -> &str {
    let start = key
        .char_indices()
        .rev()
        .nth(3)
        .map(|(i, _)| i)
        .unwrap_or(0);
    &key[start..]
}
