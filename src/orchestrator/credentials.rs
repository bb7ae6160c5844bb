//! 供应商凭证存储

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use tracing::{debug, info, warn};

use crate::models::credential::ApiKeyConfig;
use crate::models::provider::Provider;

/// provider → 凭证，可在运行时替换
#[derive(Debug, Default)]
pub struct CredentialStore {
    keys: RwLock<HashMap<Provider, ApiKeyConfig>>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从各供应商的环境变量读取 key，未设置或为空的跳过
    pub fn from_env() -> Self {
        let store = Self::new();
        for provider in Provider::ALL {
            if let Ok(key) = std::env::var(provider.api_key_env()) {
                if !key.trim().is_empty() {
                    debug!(provider = %provider, env = provider.api_key_env(), "Loaded API key from environment");
                    store.set(ApiKeyConfig::new(provider, key));
                }
            }
        }
        store
    }

    /// 设置或替换凭证；替换后有效性重新未知
    pub fn set(&self, mut config: ApiKeyConfig) {
        config.is_valid = None;
        info!(provider = %config.provider, "API key configured");
        self.keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(config.provider, config);
    }

    /// 取凭证；空白 key 视为不存在
    pub fn get(&self, provider: Provider) -> Option<ApiKeyConfig> {
        self.keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&provider)
            .filter(|c| c.is_present())
            .cloned()
    }

    pub fn remove(&self, provider: Provider) -> Option<ApiKeyConfig> {
        self.keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&provider)
    }

    /// 记录首次使用后的结果
    pub fn mark_validity(&self, provider: Provider, valid: bool) {
        let mut keys = self.keys.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(config) = keys.get_mut(&provider) {
            if config.is_valid != Some(valid) {
                if !valid {
                    warn!(provider = %provider, "API key rejected by provider");
                }
                config.is_valid = Some(valid);
            }
        }
    }

    /// 已配置凭证的供应商
    pub fn providers(&self) -> Vec<Provider> {
        let keys = self.keys.read().unwrap_or_else(PoisonError::into_inner);
        let mut providers: Vec<Provider> = keys
            .values()
            .filter(|c| c.is_present())
            .map(|c| c.provider)
            .collect();
        providers.sort();
        providers
    }
}
