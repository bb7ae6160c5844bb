//! # 供应商与模型配置
//!
//! 定义封闭的供应商集合以及每个可选模型的静态配置

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use lazy_static::lazy_static;

/// 支持的模型供应商（封闭集合，每个供应商对应一个适配器）
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Deepseek,
    Aliyun,
    Volcengine,
    Kimi,
    Claude,
}

impl Provider {
    /// 供应商总数
    pub const COUNT: usize = 5;

    /// 全部供应商，顺序固定
    pub const ALL: [Provider; Provider::COUNT] = [
        Provider::Deepseek,
        Provider::Aliyun,
        Provider::Volcengine,
        Provider::Kimi,
        Provider::Claude,
    ];

    /// 在 `ALL` 中的下标，用于定长数组索引
    pub fn index(self) -> usize {
        match self {
            Provider::Deepseek => 0,
            Provider::Aliyun => 1,
            Provider::Volcengine => 2,
            Provider::Kimi => 3,
            Provider::Claude => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Provider::Deepseek => "deepseek",
            Provider::Aliyun => "aliyun",
            Provider::Volcengine => "volcengine",
            Provider::Kimi => "kimi",
            Provider::Claude => "claude",
        }
    }

    /// 读取 API Key 时使用的环境变量名
    pub fn api_key_env(self) -> &'static str {
        match self {
            Provider::Deepseek => "DEEPSEEK_API_KEY",
            Provider::Aliyun => "DASHSCOPE_API_KEY",
            Provider::Volcengine => "ARK_API_KEY",
            Provider::Kimi => "MOONSHOT_API_KEY",
            Provider::Claude => "ANTHROPIC_API_KEY",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "deepseek" => Ok(Provider::Deepseek),
            "aliyun" | "ali" | "dashscope" | "qwen" => Ok(Provider::Aliyun),
            "volcengine" | "ark" | "doubao" => Ok(Provider::Volcengine),
            "kimi" | "moonshot" => Ok(Provider::Kimi),
            "claude" | "anthropic" => Ok(Provider::Claude),
            other => Err(format!("Unknown provider: {}", other)),
        }
    }
}

/// 单个可选模型的配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelConfig {
    /// 模型在本系统内的唯一 ID（响应矩阵的行键）
    pub id: String,
    /// 展示名称
    pub name: String,
    pub provider: Provider,
    /// 供应商侧的模型 ID（火山方舟可以是推理接入点 ID）
    pub model_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    /// 是否支持图像输入
    #[serde(default)]
    pub supports_vision: bool,
    /// 是否为推理模型（会输出 reasoning_content）
    #[serde(default)]
    pub is_reasoning: bool,
    /// 每 token 成本
    #[serde(default)]
    pub cost_per_token: f64,
}

impl ModelConfig {
    pub fn new(id: &str, name: &str, provider: Provider, model_id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            provider,
            model_id: model_id.to_string(),
            max_tokens: None,
            temperature: None,
            top_p: None,
            supports_vision: false,
            is_reasoning: false,
            cost_per_token: 0.0,
        }
    }

    pub fn with_vision(mut self) -> Self {
        self.supports_vision = true;
        self
    }

    pub fn with_reasoning(mut self) -> Self {
        self.is_reasoning = true;
        self
    }

    pub fn with_cost_per_token(mut self, cost: f64) -> Self {
        self.cost_per_token = cost;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// 按 token 数计算成本
    pub fn cost_for(&self, tokens: u32) -> f64 {
        tokens as f64 * self.cost_per_token
    }
}

lazy_static! {
    /// 内置模型目录，配置文件未提供模型时使用
    pub static ref DEFAULT_MODELS: Vec<ModelConfig> = vec![
        ModelConfig::new("deepseek-chat", "DeepSeek V3", Provider::Deepseek, "deepseek-chat")
            .with_cost_per_token(0.000002),
        ModelConfig::new("deepseek-reasoner", "DeepSeek R1", Provider::Deepseek, "deepseek-reasoner")
            .with_reasoning()
            .with_cost_per_token(0.000004),
        ModelConfig::new("qwen-plus", "通义千问 Plus", Provider::Aliyun, "qwen-plus")
            .with_cost_per_token(0.0000008),
        ModelConfig::new("qwen-max", "通义千问 Max", Provider::Aliyun, "qwen-max")
            .with_cost_per_token(0.0000024),
        ModelConfig::new("qwen-vl-plus", "通义千问 VL Plus", Provider::Aliyun, "qwen-vl-plus")
            .with_vision()
            .with_cost_per_token(0.0000015),
        ModelConfig::new("qwq-plus", "通义千问 QwQ", Provider::Aliyun, "qwq-plus")
            .with_reasoning()
            .with_cost_per_token(0.0000016),
        ModelConfig::new("doubao-pro", "豆包 1.5 Pro", Provider::Volcengine, "doubao-1-5-pro-32k-250115")
            .with_cost_per_token(0.0000008),
        ModelConfig::new("doubao-vision", "豆包 1.5 Vision Pro", Provider::Volcengine, "doubao-1-5-vision-pro-32k-250115")
            .with_vision()
            .with_cost_per_token(0.000003),
        ModelConfig::new("ark-deepseek-r1", "DeepSeek R1 (方舟)", Provider::Volcengine, "deepseek-r1-250120")
            .with_reasoning()
            .with_cost_per_token(0.000004),
        ModelConfig::new("moonshot-v1-8k", "Kimi 8K", Provider::Kimi, "moonshot-v1-8k")
            .with_cost_per_token(0.000012),
        ModelConfig::new("moonshot-v1-8k-vision", "Kimi 8K Vision", Provider::Kimi, "moonshot-v1-8k-vision-preview")
            .with_vision()
            .with_cost_per_token(0.000012),
        ModelConfig::new("claude-sonnet-4", "Claude Sonnet 4", Provider::Claude, "claude-sonnet-4-20250514")
            .with_vision()
            .with_max_tokens(4096)
            .with_cost_per_token(0.000015),
        ModelConfig::new("claude-3-7-sonnet-thinking", "Claude 3.7 Sonnet (Thinking)", Provider::Claude, "claude-3-7-sonnet-20250219")
            .with_vision()
            .with_reasoning()
            .with_max_tokens(8192)
            .with_cost_per_token(0.000015),
    ];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_parse_aliases() {
        assert_eq!("DeepSeek".parse::<Provider>().unwrap(), Provider::Deepseek);
        assert_eq!("dashscope".parse::<Provider>().unwrap(), Provider::Aliyun);
        assert_eq!("ark".parse::<Provider>().unwrap(), Provider::Volcengine);
        assert_eq!("moonshot".parse::<Provider>().unwrap(), Provider::Kimi);
        assert_eq!("anthropic".parse::<Provider>().unwrap(), Provider::Claude);
        assert!("openai".parse::<Provider>().is_err());
    }

    #[test]
    fn test_provider_index_matches_all() {
        for (i, provider) in Provider::ALL.iter().enumerate() {
            assert_eq!(provider.index(), i);
        }
    }

    #[test]
    fn test_provider_serde_lowercase() {
        let json = serde_json::to_string(&Provider::Volcengine).unwrap();
        assert_eq!(json, "\"volcengine\"");
        let parsed: Provider = serde_json::from_str("\"claude\"").unwrap();
        assert_eq!(parsed, Provider::Claude);
    }

    #[test]
    fn test_default_catalog_covers_every_provider() {
        for provider in Provider::ALL {
            assert!(DEFAULT_MODELS.iter().any(|m| m.provider == provider), "{} missing", provider);
        }
    }

    #[test]
    fn test_cost_for() {
        let model = ModelConfig::new("m", "M", Provider::Kimi, "m").with_cost_per_token(0.5);
        assert_eq!(model.cost_for(4), 2.0);
    }
}
