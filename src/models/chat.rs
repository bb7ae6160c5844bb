//! # 请求与流式块
//!
//! `ChatRequest` 是一次分发的输入，`StreamChunk` 是所有适配器统一输出的唯一形状

use serde::{Deserialize, Serialize};

use crate::llm_api::error::ResponseError;
use crate::models::message::Message;

/// 一次分发的聊天请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    /// 目标模型 ID；批量分发时由分发器按模型填写
    #[serde(default)]
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// 是否流式，默认 true
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
}

impl ChatRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            model: String::new(),
            temperature: None,
            max_tokens: None,
            system_prompt: None,
            stream: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = Some(stream);
        self
    }

    pub fn is_stream(&self) -> bool {
        self.stream.unwrap_or(true)
    }

    /// 响应矩阵列键：最后一条消息的 ID
    pub fn message_id(&self) -> Option<&str> {
        self.messages.last().map(|m| m.id.as_str())
    }
}

/// 归一化的流式块
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StreamChunk {
    /// 正文增量
    #[serde(default)]
    pub content: String,
    /// 推理内容增量
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    /// 是否为终止块
    #[serde(default)]
    pub finished: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    /// 仅终止块可携带
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

impl StreamChunk {
    /// 正文增量块
    pub fn content(delta: impl Into<String>) -> Self {
        Self {
            content: delta.into(),
            ..Self::default()
        }
    }

    /// 推理内容增量块
    pub fn reasoning(delta: impl Into<String>) -> Self {
        Self {
            reasoning_content: Some(delta.into()),
            ..Self::default()
        }
    }

    /// 成功终止块
    pub fn finished(tokens: Option<u32>, cost: Option<f64>) -> Self {
        Self {
            finished: true,
            tokens,
            cost,
            ..Self::default()
        }
    }

    /// 失败终止块
    pub fn failed(error: impl Into<ResponseError>) -> Self {
        Self {
            finished: true,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    /// 没有任何增量的块（供应商的心跳或角色块）
    pub fn is_empty_delta(&self) -> bool {
        !self.finished
            && self.content.is_empty()
            && self.reasoning_content.as_deref().is_none_or(str::is_empty)
            && self.tokens.is_none()
            && self.cost.is_none()
    }
}
