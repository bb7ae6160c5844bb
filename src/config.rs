//! # 编排配置
//!
//! JSON 文件 + 环境变量。文件中缺省的字段使用默认值；
//! 环境变量里的 API Key 覆盖文件中的值。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::llm_api::utils::client::{BaseClient, ClientConfig, RetryConfig, TimeoutConfig};
use crate::logger::LogConfig;
use crate::models::credential::ApiKeyConfig;
use crate::models::provider::{ModelConfig, Provider, DEFAULT_MODELS};
use crate::orchestrator::credentials::CredentialStore;
use crate::orchestrator::dispatcher::Dispatcher;
use crate::orchestrator::limiter::{LimiterConfig, DEFAULT_MAX_CONCURRENT};

/// HTTP 客户端参数（秒 / 毫秒为单位，便于写在 JSON 里）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    pub connect_timeout_secs: u64,
    pub response_timeout_secs: u64,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub rate_limit_delay_ms: u64,
    pub user_agent: Option<String>,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 30,
            response_timeout_secs: 60,
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            rate_limit_delay_ms: 2000,
            user_agent: None,
        }
    }
}

impl HttpSettings {
    pub fn to_client_config(&self) -> ClientConfig {
        let timeout = TimeoutConfig::new()
            .with_connect_timeout(Duration::from_secs(self.connect_timeout_secs))
            .with_response_timeout(Duration::from_secs(self.response_timeout_secs));
        let retry = RetryConfig::new()
            .with_max_attempts(self.max_attempts)
            .with_base_delay(Duration::from_millis(self.base_delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
            .with_rate_limit_delay(Duration::from_millis(self.rate_limit_delay_ms));
        let config = ClientConfig::new().with_timeout(timeout).with_retry(retry);
        match &self.user_agent {
            Some(user_agent) => config.with_user_agent(user_agent.clone()),
            None => config,
        }
    }
}

/// 顶层配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// 单次模型调用的最长时间
    pub call_timeout_secs: u64,
    pub default_max_concurrent: usize,
    pub max_concurrent: HashMap<Provider, usize>,
    pub http: HttpSettings,
    /// 供应商地址覆盖（代理、私有部署）
    pub base_urls: HashMap<Provider, String>,
    pub api_keys: HashMap<Provider, String>,
    /// 为空时使用内置模型目录
    pub models: Vec<ModelConfig>,
    pub log: LogConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            call_timeout_secs: 120,
            default_max_concurrent: DEFAULT_MAX_CONCURRENT,
            max_concurrent: HashMap::new(),
            http: HttpSettings::default(),
            base_urls: HashMap::new(),
            api_keys: HashMap::new(),
            models: Vec::new(),
            log: LogConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Invalid orchestrator config")
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = Self::from_json_str(&content)?;
        info!(path = %path.display(), "Config loaded");
        Ok(config)
    }

    /// 用环境变量中的 API Key 覆盖配置
    pub fn with_env_keys(mut self) -> Self {
        for provider in Provider::ALL {
            if let Ok(key) = std::env::var(provider.api_key_env()) {
                if !key.trim().is_empty() {
                    debug!(provider = %provider, "API key taken from environment");
                    self.api_keys.insert(provider, key);
                }
            }
        }
        self
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs.max(1))
    }

    pub fn limiter_config(&self) -> LimiterConfig {
        LimiterConfig {
            default_max_concurrent: self.default_max_concurrent,
            per_provider: self.max_concurrent.clone(),
        }
    }

    /// 配置的模型目录，未配置时为内置目录
    pub fn model_catalog(&self) -> Vec<ModelConfig> {
        if self.models.is_empty() {
            DEFAULT_MODELS.clone()
        } else {
            self.models.clone()
        }
    }

    pub fn credential_store(&self) -> CredentialStore {
        let store = CredentialStore::new();
        for (&provider, key) in &self.api_keys {
            store.set(ApiKeyConfig::new(provider, key.clone()));
        }
        store
    }

    /// 按配置构造带默认适配器和模型目录的分发器
    pub async fn build_dispatcher(&self) -> Result<Dispatcher> {
        let client = BaseClient::new(self.http.to_client_config())?;
        let dispatcher = Dispatcher::with_default_adapters(
            self.limiter_config(),
            Arc::new(self.credential_store()),
            client,
            &self.base_urls,
        )
        .with_call_timeout(self.call_timeout());
        dispatcher.register_models(self.model_catalog()).await;
        Ok(dispatcher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_json() {
        let config = OrchestratorConfig::from_json_str("{}").unwrap();
        assert_eq!(config.call_timeout(), Duration::from_secs(120));
        assert_eq!(config.limiter_config().capacity_for(Provider::Kimi), 3);
        assert_eq!(config.model_catalog().len(), DEFAULT_MODELS.len());
        assert!(config.credential_store().providers().is_empty());
    }

    #[test]
    fn test_parse_full_config() {
        let json = r#"{
            "call_timeout_secs": 30,
            "default_max_concurrent": 2,
            "max_concurrent": {"claude": 1},
            "http": {"max_attempts": 5, "base_delay_ms": 10},
            "base_urls": {"deepseek": "http://localhost:8080"},
            "api_keys": {"kimi": "sk-kimi"},
            "models": [{"id": "k", "name": "K", "provider": "kimi", "model_id": "moonshot-v1-8k"}],
            "log": {"level": "debug"}
        }"#;
        let config = OrchestratorConfig::from_json_str(json).unwrap();
        assert_eq!(config.call_timeout(), Duration::from_secs(30));
        assert_eq!(config.limiter_config().capacity_for(Provider::Claude), 1);
        assert_eq!(config.limiter_config().capacity_for(Provider::Aliyun), 2);
        assert_eq!(config.base_urls[&Provider::Deepseek], "http://localhost:8080");
        assert_eq!(config.model_catalog().len(), 1);
        assert_eq!(config.credential_store().get(Provider::Kimi).unwrap().api_key, "sk-kimi");

        let client = config.http.to_client_config();
        assert_eq!(client.retry.max_attempts, 5);
        assert_eq!(client.retry.base_delay, Duration::from_millis(10));
        assert_eq!(client.timeout.response_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_unknown_provider_is_rejected() {
        assert!(OrchestratorConfig::from_json_str(r#"{"api_keys": {"openai": "sk"}}"#).is_err());
    }

    #[test]
    fn test_from_json_file() {
        let path = std::env::temp_dir().join(format!("model_arena_{}.json", uuid::Uuid::new_v4()));
        std::fs::write(&path, r#"{"call_timeout_secs": 5}"#).unwrap();
        let config = OrchestratorConfig::from_json_file(&path).unwrap();
        assert_eq!(config.call_timeout_secs, 5);
        std::fs::remove_file(&path).unwrap();

        assert!(OrchestratorConfig::from_json_file("/nonexistent/model_arena.json").is_err());
    }

    #[tokio::test]
    async fn test_build_dispatcher_registers_catalog() {
        let dispatcher = OrchestratorConfig::default().build_dispatcher().await.unwrap();
        assert!(dispatcher.model("claude-sonnet-4").await.is_some());
        assert_eq!(dispatcher.get_queue_status().len(), Provider::COUNT);
    }
}
