//! # OpenAI 兼容协议
//!
//! DeepSeek、火山方舟、Kimi 都提供 OpenAI 兼容的 `/chat/completions` 接口，
//! 差异（默认地址、温度范围、usage 位置、推理模型参数）通过 `OpenAiCompatProfile` 描述。

use eventsource_stream::Event;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::warn;

use crate::llm_api::adapter::{bearer_headers, ProviderRequest, VendorCodec};
use crate::llm_api::error::{AiError, ErrorKind, ResponseError};
use crate::llm_api::utils::sse::SseDecoder;
use crate::models::chat::StreamChunk;
use crate::models::credential::ApiKeyConfig;
use crate::models::provider::Provider;

/// 某个 OpenAI 兼容供应商的差异描述
#[derive(Debug, Clone, Copy)]
pub struct OpenAiCompatProfile {
    pub provider: Provider,
    pub default_base_url: &'static str,
    /// 温度的合法区间，超出时截断
    pub temperature_range: (f32, f32),
    /// 是否发送 `stream_options.include_usage`
    pub include_usage: bool,
    /// 推理模型是否接受 temperature/top_p
    pub reasoning_accepts_sampling: bool,
}

/// OpenAI 兼容协议编解码
#[derive(Debug, Clone)]
pub struct OpenAiCompatCodec {
    profile: OpenAiCompatProfile,
    base_url: String,
}

impl OpenAiCompatCodec {
    pub fn new(profile: OpenAiCompatProfile, base_url: Option<String>) -> Self {
        let base_url = base_url.unwrap_or_else(|| profile.default_base_url.to_string());
        Self {
            profile,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn build_messages(&self, request: &ProviderRequest) -> Vec<Value> {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = &request.system_prompt {
            messages.push(json!({ "role": "system", "content": system }));
        }
        for message in &request.messages {
            let images = request.images_of(message);
            let content = if images.is_empty() {
                Value::String(message.content.clone())
            } else {
                let mut parts: Vec<Value> = images
                    .iter()
                    .map(|url| json!({ "type": "image_url", "image_url": { "url": url } }))
                    .collect();
                parts.push(json!({ "type": "text", "text": message.content }));
                Value::Array(parts)
            };
            messages.push(json!({ "role": message.role.as_str(), "content": content }));
        }
        messages
    }
}

impl VendorCodec for OpenAiCompatCodec {
    type Decoder = OpenAiCompatDecoder;

    fn provider(&self) -> Provider {
        self.profile.provider
    }

    fn endpoint(&self, _request: &ProviderRequest) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn headers(&self, request: &ProviderRequest, credentials: &ApiKeyConfig) -> Result<HeaderMap, AiError> {
        let mut headers = bearer_headers(credentials)?;
        if request.stream {
            headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
        }
        Ok(headers)
    }

    fn build_body(&self, request: &ProviderRequest) -> Result<Value, AiError> {
        let mut body = Map::new();
        body.insert("model".into(), json!(request.model.model_id));
        body.insert("messages".into(), Value::Array(self.build_messages(request)));
        body.insert("stream".into(), json!(request.stream));
        if request.stream && self.profile.include_usage {
            body.insert("stream_options".into(), json!({ "include_usage": true }));
        }

        let sampling = !request.model.is_reasoning || self.profile.reasoning_accepts_sampling;
        if sampling {
            if let Some(temperature) = request.temperature {
                let (lo, hi) = self.profile.temperature_range;
                body.insert("temperature".into(), json!(temperature.clamp(lo, hi)));
            }
            if let Some(top_p) = request.top_p {
                body.insert("top_p".into(), json!(top_p));
            }
        }
        if let Some(max_tokens) = request.max_tokens {
            body.insert("max_tokens".into(), json!(max_tokens));
        }
        Ok(Value::Object(body))
    }

    fn decoder(&self, request: &ProviderRequest) -> Self::Decoder {
        OpenAiCompatDecoder::new(request.clone())
    }

    fn parse_full(&self, body: Value, request: &ProviderRequest) -> Result<StreamChunk, AiError> {
        if let Some(error) = vendor_error(&body) {
            return Ok(StreamChunk::failed(error));
        }
        let response: ChatCompletion = serde_json::from_value(body)?;
        let message = response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .ok_or_else(|| AiError::Protocol("Response contains no choices".to_string()))?;

        let mut chunk = request.terminal(response.usage.as_ref().and_then(Usage::total));
        chunk.content = message.content.unwrap_or_default();
        chunk.reasoning_content = message.reasoning_content.filter(|r| !r.is_empty());
        Ok(chunk)
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamEvent {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<StreamDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
    /// Kimi 把 usage 放在结束的 choice 里
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: Option<u32>,
    #[serde(default)]
    completion_tokens: Option<u32>,
    #[serde(default)]
    total_tokens: Option<u32>,
}

impl Usage {
    fn total(&self) -> Option<u32> {
        self.total_tokens.or(match (self.prompt_tokens, self.completion_tokens) {
            (None, None) => None,
            (p, c) => Some(p.unwrap_or(0).saturating_add(c.unwrap_or(0))),
        })
    }
}

/// `{"error": {...}}` 形式的错误体
fn vendor_error(value: &Value) -> Option<ResponseError> {
    let error = value.get("error")?;
    if error.is_null() {
        return None;
    }
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("unknown vendor error")
        .to_string();
    let code = error
        .get("code")
        .or_else(|| error.get("type"))
        .map(|c| c.to_string().to_ascii_lowercase())
        .unwrap_or_default();
    let kind = if code.contains("rate") || code.contains("429") {
        ErrorKind::RateLimit
    } else if code.contains("auth") || code.contains("api_key") {
        ErrorKind::Configuration
    } else {
        ErrorKind::Protocol
    };
    Some(ResponseError::new(kind, message))
}

/// OpenAI 兼容 SSE 解码器
pub struct OpenAiCompatDecoder {
    request: ProviderRequest,
    tokens: Option<u32>,
    finish_reason: Option<String>,
}

impl OpenAiCompatDecoder {
    pub fn new(request: ProviderRequest) -> Self {
        Self {
            request,
            tokens: None,
            finish_reason: None,
        }
    }
}

impl SseDecoder for OpenAiCompatDecoder {
    fn on_event(&mut self, event: &Event) -> Vec<StreamChunk> {
        let data = event.data.trim();
        if data.is_empty() {
            return Vec::new();
        }
        if data == "[DONE]" {
            return vec![self.request.terminal(self.tokens)];
        }

        let value: Value = match serde_json::from_str(data) {
            Ok(value) => value,
            Err(e) => {
                warn!(provider = %self.request.model.provider, error = %e, "Failed to parse stream event");
                return vec![StreamChunk::failed(ResponseError::protocol(format!(
                    "Malformed stream event: {}",
                    e
                )))];
            }
        };
        if let Some(error) = vendor_error(&value) {
            return vec![StreamChunk::failed(error)];
        }
        let parsed: StreamEvent = match serde_json::from_value(value) {
            Ok(parsed) => parsed,
            Err(e) => {
                return vec![StreamChunk::failed(ResponseError::protocol(format!(
                    "Unexpected stream event: {}",
                    e
                )))];
            }
        };

        if let Some(tokens) = parsed.usage.as_ref().and_then(Usage::total) {
            self.tokens = Some(tokens);
        }

        let mut chunks = Vec::new();
        for choice in parsed.choices {
            if let Some(tokens) = choice.usage.as_ref().and_then(Usage::total) {
                self.tokens = Some(tokens);
            }
            if let Some(delta) = choice.delta {
                if let Some(reasoning) = delta.reasoning_content.filter(|r| !r.is_empty()) {
                    chunks.push(StreamChunk::reasoning(reasoning));
                }
                if let Some(content) = delta.content.filter(|c| !c.is_empty()) {
                    chunks.push(StreamChunk::content(content));
                }
            }
            if let Some(reason) = choice.finish_reason {
                self.finish_reason = Some(reason);
            }
        }
        chunks
    }

    fn on_end(&mut self) -> StreamChunk {
        // 部分供应商不发送 [DONE]，收到过 finish_reason 即视为正常结束
        match self.finish_reason {
            Some(_) => self.request.terminal(self.tokens),
            None => StreamChunk::failed(ResponseError::protocol("Stream ended before completion")),
        }
    }
}
