//! # Anthropic Claude API 客户端
//!
//! Messages API（`/v1/messages`）。推理模型开启 extended thinking，
//! `thinking_delta` 映射为推理内容；system 角色的消息合并进顶层 `system` 字段。

use eventsource_stream::Event;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::llm_api::adapter::{HttpAdapter, ProviderRequest, VendorCodec};
use crate::llm_api::error::{AiError, ErrorKind, ResponseError};
use crate::llm_api::utils::client::BaseClient;
use crate::llm_api::utils::sse::SseDecoder;
use crate::models::chat::StreamChunk;
use crate::models::credential::ApiKeyConfig;
use crate::models::message::{parse_image, ImageSource, Role};
use crate::models::provider::Provider;

pub const CLAUDE_BASE_URL: &str = "https://api.anthropic.com";
pub const ANTHROPIC_VERSION: &str = "2023-06-01";
/// Claude 要求必须给出 max_tokens
pub const DEFAULT_MAX_TOKENS: u32 = 4096;
const MIN_THINKING_BUDGET: u32 = 1024;

/// Messages API 请求体
#[derive(Serialize, Debug, Clone)]
pub struct ClaudeRequest {
    pub model: String,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub messages: Vec<ClaudeMessage>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<ThinkingConfig>,
}

#[derive(Serialize, Debug, Clone)]
pub struct ClaudeMessage {
    pub role: &'static str,
    pub content: Vec<ContentBlock>,
}

#[derive(Serialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    Image { source: ImageBlockSource },
}

#[derive(Serialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ImageBlockSource {
    Base64 { media_type: String, data: String },
    Url { url: String },
}

#[derive(Serialize, Debug, Clone)]
pub struct ThinkingConfig {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub budget_tokens: u32,
}

/// 思考预算：至少 1024，且必须小于 max_tokens
fn thinking_budget(max_tokens: u32) -> (u32, u32) {
    let budget = (max_tokens / 2).max(MIN_THINKING_BUDGET);
    let max_tokens = if max_tokens <= budget {
        budget + MIN_THINKING_BUDGET
    } else {
        max_tokens
    };
    (budget, max_tokens)
}

fn image_block(image: &str) -> ContentBlock {
    let source = match parse_image(image) {
        ImageSource::Base64 { media_type, data } => ImageBlockSource::Base64 {
            media_type: media_type.to_string(),
            data: data.to_string(),
        },
        ImageSource::Url(url) => ImageBlockSource::Url { url: url.to_string() },
    };
    ContentBlock::Image { source }
}

/// Claude 错误类型 → 错误类别
fn error_from_type(error_type: &str, message: &str) -> ResponseError {
    let kind = match error_type {
        "rate_limit_error" => ErrorKind::RateLimit,
        "overloaded_error" | "api_error" => ErrorKind::Network,
        "authentication_error" | "permission_error" => ErrorKind::Configuration,
        _ => ErrorKind::Protocol,
    };
    ResponseError::new(kind, format!("{}: {}", error_type, message))
}

fn vendor_error(value: &Value) -> Option<ResponseError> {
    let error = value.get("error")?;
    let error_type = error.get("type").and_then(Value::as_str).unwrap_or("unknown_error");
    let message = error.get("message").and_then(Value::as_str).unwrap_or_default();
    Some(error_from_type(error_type, message))
}

#[derive(Deserialize, Debug, Default)]
struct ClaudeUsage {
    #[serde(default)]
    input_tokens: Option<u32>,
    #[serde(default)]
    output_tokens: Option<u32>,
}

#[derive(Deserialize, Debug)]
struct ClaudeResponse {
    #[serde(default)]
    content: Vec<Value>,
    #[serde(default)]
    usage: ClaudeUsage,
}

/// Claude 协议编解码
#[derive(Debug, Clone)]
pub struct ClaudeCodec {
    base_url: String,
}

impl ClaudeCodec {
    pub fn new(base_url: Option<String>) -> Self {
        let base_url = base_url.unwrap_or_else(|| CLAUDE_BASE_URL.to_string());
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn build_request(&self, request: &ProviderRequest) -> ClaudeRequest {
        let mut system: Vec<&str> = request.system_prompt.iter().map(String::as_str).collect();
        let mut messages = Vec::with_capacity(request.messages.len());

        for message in &request.messages {
            let role = match message.role {
                Role::System => {
                    system.push(&message.content);
                    continue;
                }
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            let mut content: Vec<ContentBlock> = request
                .images_of(message)
                .iter()
                .map(|image| image_block(image))
                .collect();
            content.push(ContentBlock::Text {
                text: message.content.clone(),
            });
            messages.push(ClaudeMessage { role, content });
        }

        let max_tokens = request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS);
        let (max_tokens, thinking, temperature, top_p) = if request.model.is_reasoning {
            let (budget, max_tokens) = thinking_budget(max_tokens);
            let thinking = ThinkingConfig {
                kind: "enabled",
                budget_tokens: budget,
            };
            // 开启 thinking 时不接受采样参数
            (max_tokens, Some(thinking), None, None)
        } else {
            (
                max_tokens,
                None,
                request.temperature.map(|t| t.clamp(0.0, 1.0)),
                request.top_p,
            )
        };

        ClaudeRequest {
            model: request.model.model_id.clone(),
            max_tokens,
            system: (!system.is_empty()).then(|| system.join("\n\n")),
            messages,
            stream: request.stream,
            temperature,
            top_p,
            thinking,
        }
    }
}

impl VendorCodec for ClaudeCodec {
    type Decoder = ClaudeDecoder;

    fn provider(&self) -> Provider {
        Provider::Claude
    }

    fn endpoint(&self, _request: &ProviderRequest) -> String {
        format!("{}/v1/messages", self.base_url)
    }

    fn headers(&self, request: &ProviderRequest, credentials: &ApiKeyConfig) -> Result<HeaderMap, AiError> {
        if !credentials.is_present() {
            return Err(AiError::Configuration(format!(
                "No API key configured for provider '{}'",
                credentials.provider
            )));
        }
        let mut headers = HeaderMap::new();
        let key = HeaderValue::from_str(credentials.api_key.trim())
            .map_err(|_| AiError::Configuration("API key contains invalid header characters".to_string()))?;
        headers.insert("x-api-key", key);
        headers.insert("anthropic-version", HeaderValue::from_static(ANTHROPIC_VERSION));
        if request.stream {
            headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
        }
        Ok(headers)
    }

    fn build_body(&self, request: &ProviderRequest) -> Result<Value, AiError> {
        Ok(serde_json::to_value(self.build_request(request))?)
    }

    fn decoder(&self, request: &ProviderRequest) -> Self::Decoder {
        ClaudeDecoder::new(request.clone())
    }

    fn parse_full(&self, body: Value, request: &ProviderRequest) -> Result<StreamChunk, AiError> {
        if let Some(error) = vendor_error(&body) {
            return Ok(StreamChunk::failed(error));
        }
        let response: ClaudeResponse = serde_json::from_value(body)?;

        let mut content = String::new();
        let mut thinking = String::new();
        for block in &response.content {
            match block.get("type").and_then(Value::as_str) {
                Some("text") => content.push_str(block.get("text").and_then(Value::as_str).unwrap_or_default()),
                Some("thinking") => {
                    thinking.push_str(block.get("thinking").and_then(Value::as_str).unwrap_or_default())
                }
                _ => {}
            }
        }

        let usage = &response.usage;
        let tokens = sum_tokens(usage.input_tokens, usage.output_tokens);
        let mut chunk = request.terminal(tokens);
        chunk.content = content;
        chunk.reasoning_content = (!thinking.is_empty()).then_some(thinking);
        Ok(chunk)
    }
}

/// Claude SSE 解码器
pub struct ClaudeDecoder {
    request: ProviderRequest,
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
    stop_reason: Option<String>,
}

/// 输入与输出 token 之和，溢出时饱和
fn sum_tokens(input: Option<u32>, output: Option<u32>) -> Option<u32> {
    match (input, output) {
        (None, None) => None,
        (i, o) => Some(i.unwrap_or(0).saturating_add(o.unwrap_or(0))),
    }
}

impl ClaudeDecoder {
    pub fn new(request: ProviderRequest) -> Self {
        Self {
            request,
            input_tokens: None,
            output_tokens: None,
            stop_reason: None,
        }
    }

    fn tokens(&self) -> Option<u32> {
        sum_tokens(self.input_tokens, self.output_tokens)
    }

    fn record_usage(&mut self, usage: Option<&Value>) {
        let Some(usage) = usage else { return };
        if let Some(input) = usage.get("input_tokens").and_then(Value::as_u64) {
            self.input_tokens = Some(u32::try_from(input).unwrap_or(u32::MAX));
        }
        if let Some(output) = usage.get("output_tokens").and_then(Value::as_u64) {
            self.output_tokens = Some(u32::try_from(output).unwrap_or(u32::MAX));
        }
    }
}

impl SseDecoder for ClaudeDecoder {
    fn on_event(&mut self, event: &Event) -> Vec<StreamChunk> {
        let data = event.data.trim();
        if data.is_empty() {
            return Vec::new();
        }
        let value: Value = match serde_json::from_str(data) {
            Ok(value) => value,
            Err(e) => {
                warn!(model_id = %self.request.model.id, error = %e, "Failed to parse Claude event");
                return vec![StreamChunk::failed(ResponseError::protocol(format!(
                    "Malformed stream event: {}",
                    e
                )))];
            }
        };

        // 事件名缺失时回退到 data 里的 type 字段
        let event_type = if event.event.is_empty() || event.event == "message" {
            value.get("type").and_then(Value::as_str).unwrap_or_default()
        } else {
            event.event.as_str()
        };

        match event_type {
            "message_start" => {
                self.record_usage(value.get("message").and_then(|m| m.get("usage")));
                Vec::new()
            }
            "content_block_delta" => {
                let Some(delta) = value.get("delta") else {
                    return Vec::new();
                };
                match delta.get("type").and_then(Value::as_str) {
                    Some("text_delta") => delta
                        .get("text")
                        .and_then(Value::as_str)
                        .map(|t| vec![StreamChunk::content(t)])
                        .unwrap_or_default(),
                    Some("thinking_delta") => delta
                        .get("thinking")
                        .and_then(Value::as_str)
                        .map(|t| vec![StreamChunk::reasoning(t)])
                        .unwrap_or_default(),
                    _ => Vec::new(),
                }
            }
            "message_delta" => {
                self.record_usage(value.get("usage"));
                if let Some(reason) = value
                    .get("delta")
                    .and_then(|d| d.get("stop_reason"))
                    .and_then(Value::as_str)
                {
                    debug!(model_id = %self.request.model.id, stop_reason = reason, "Claude message stopped");
                    self.stop_reason = Some(reason.to_string());
                }
                Vec::new()
            }
            "message_stop" => vec![self.request.terminal(self.tokens())],
            "error" => vec![StreamChunk::failed(
                vendor_error(&value).unwrap_or_else(|| ResponseError::protocol("Claude stream error")),
            )],
            _ => Vec::new(),
        }
    }

    fn on_end(&mut self) -> StreamChunk {
        match self.stop_reason {
            Some(_) => self.request.terminal(self.tokens()),
            None => StreamChunk::failed(ResponseError::protocol("Stream ended before completion")),
        }
    }
}

pub type ClaudeAdapter = HttpAdapter<ClaudeCodec>;

pub fn claude_adapter(client: BaseClient, base_url: Option<String>) -> ClaudeAdapter {
    HttpAdapter::new(ClaudeCodec::new(base_url), client)
}
