//! # 阿里云通义千问 API 客户端
//!
//! 使用 DashScope 原生接口：纯文本走 text-generation，带图像走 multimodal-generation。
//! 非推理模型的流式输出是累积全文（`incremental_output = false`），在这里裁剪成增量；
//! 推理模型开启增量输出，`reasoning_content` 直接透传。

use eventsource_stream::Event;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::llm_api::adapter::{bearer_headers, HttpAdapter, ProviderRequest, VendorCodec};
use crate::llm_api::error::{AiError, ErrorKind, ResponseError};
use crate::llm_api::utils::client::BaseClient;
use crate::llm_api::utils::cumulative::CumulativeText;
use crate::llm_api::utils::sse::SseDecoder;
use crate::models::chat::StreamChunk;
use crate::models::credential::ApiKeyConfig;
use crate::models::provider::Provider;

pub const DASHSCOPE_BASE_URL: &str = "https://dashscope.aliyuncs.com";
const DASHSCOPE_API_PATH: &str = "/api/v1";

/// DashScope 请求体
#[derive(Serialize, Debug, Clone)]
pub struct AliChatRequest {
    /// 模型名称，如 "qwen-plus"、"qwen-vl-plus"
    pub model: String,
    pub input: AliInput,
    pub parameters: AliParameters,
}

#[derive(Serialize, Debug, Clone)]
pub struct AliInput {
    pub messages: Vec<AliMessage>,
}

#[derive(Serialize, Debug, Clone)]
pub struct AliMessage {
    pub role: String,
    pub content: AliContent,
}

/// 文本接口用字符串，多模态接口用内容数组
#[derive(Serialize, Debug, Clone)]
#[serde(untagged)]
pub enum AliContent {
    Text(String),
    Parts(Vec<AliPart>),
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "lowercase")]
pub enum AliPart {
    Image(String),
    Text(String),
}

/// 生成参数
#[derive(Serialize, Debug, Clone)]
pub struct AliParameters {
    /// 固定为 "message"
    pub result_format: &'static str,
    /// 是否增量输出（仅流式有意义）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub incremental_output: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/// DashScope 响应（流式事件与非流式响应同构）
#[derive(Deserialize, Debug, Default)]
struct AliResponse {
    #[serde(default)]
    output: Option<AliOutput>,
    #[serde(default)]
    usage: Option<AliUsage>,
    /// 出错时返回的错误码
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
struct AliOutput {
    #[serde(default)]
    choices: Vec<AliChoice>,
}

#[derive(Deserialize, Debug)]
struct AliChoice {
    #[serde(default)]
    message: Option<AliOutputMessage>,
    /// 未结束时为字符串 "null"
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct AliOutputMessage {
    #[serde(default)]
    content: Option<Value>,
    #[serde(default)]
    reasoning_content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct AliUsage {
    #[serde(default)]
    total_tokens: Option<u32>,
    #[serde(default)]
    input_tokens: Option<u32>,
    #[serde(default)]
    output_tokens: Option<u32>,
}

impl AliUsage {
    fn total(&self) -> Option<u32> {
        self.total_tokens.or(match (self.input_tokens, self.output_tokens) {
            (None, None) => None,
            (i, o) => Some(i.unwrap_or(0).saturating_add(o.unwrap_or(0))),
        })
    }
}

impl AliChoice {
    fn is_finished(&self) -> bool {
        matches!(self.finish_reason.as_deref(), Some(reason) if !reason.is_empty() && reason != "null")
    }
}

/// 文本内容可能是字符串，也可能是 `[{"text": ..}]`
fn content_text(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect(),
        _ => String::new(),
    }
}

/// DashScope 错误码 → 错误类别
fn error_from_code(code: &str, message: &str) -> ResponseError {
    let kind = if code.starts_with("Throttling") {
        ErrorKind::RateLimit
    } else if code == "InvalidApiKey" || code.starts_with("AccessDenied") {
        ErrorKind::Configuration
    } else {
        ErrorKind::Protocol
    };
    ResponseError::new(kind, format!("{}: {}", code, message))
}

/// DashScope 协议编解码
#[derive(Debug, Clone)]
pub struct DashScopeCodec {
    base_url: String,
}

impl DashScopeCodec {
    pub fn new(base_url: Option<String>) -> Self {
        let base_url = base_url.unwrap_or_else(|| DASHSCOPE_BASE_URL.to_string());
        let base_url = base_url.trim_end_matches('/');
        // 兼容已经带上 API 路径的配置
        let base_url = base_url.strip_suffix(DASHSCOPE_API_PATH).unwrap_or(base_url);
        Self {
            base_url: base_url.to_string(),
        }
    }

    pub fn build_request(&self, request: &ProviderRequest) -> AliChatRequest {
        let multimodal = request.has_images();
        let mut messages = Vec::with_capacity(request.messages.len() + 1);

        let text = |content: &str| {
            if multimodal {
                AliContent::Parts(vec![AliPart::Text(content.to_string())])
            } else {
                AliContent::Text(content.to_string())
            }
        };

        if let Some(system) = &request.system_prompt {
            messages.push(AliMessage {
                role: "system".to_string(),
                content: text(system),
            });
        }
        for message in &request.messages {
            let images = request.images_of(message);
            let content = if images.is_empty() {
                text(&message.content)
            } else {
                let mut parts: Vec<AliPart> = images.iter().cloned().map(AliPart::Image).collect();
                parts.push(AliPart::Text(message.content.clone()));
                AliContent::Parts(parts)
            };
            messages.push(AliMessage {
                role: message.role.as_str().to_string(),
                content,
            });
        }

        AliChatRequest {
            model: request.model.model_id.clone(),
            input: AliInput { messages },
            parameters: AliParameters {
                result_format: "message",
                incremental_output: request.stream.then_some(request.model.is_reasoning),
                temperature: request.temperature,
                top_p: request.top_p,
                max_tokens: request.max_tokens,
            },
        }
    }
}

impl VendorCodec for DashScopeCodec {
    type Decoder = DashScopeDecoder;

    fn provider(&self) -> Provider {
        Provider::Aliyun
    }

    fn endpoint(&self, request: &ProviderRequest) -> String {
        let service = if request.has_images() {
            "multimodal-generation"
        } else {
            "text-generation"
        };
        format!("{}{}/services/aigc/{}/generation", self.base_url, DASHSCOPE_API_PATH, service)
    }

    fn headers(&self, request: &ProviderRequest, credentials: &ApiKeyConfig) -> Result<HeaderMap, AiError> {
        let mut headers = bearer_headers(credentials)?;
        if request.stream {
            headers.insert("X-DashScope-SSE", HeaderValue::from_static("enable"));
            headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
        }
        Ok(headers)
    }

    fn build_body(&self, request: &ProviderRequest) -> Result<Value, AiError> {
        Ok(serde_json::to_value(self.build_request(request))?)
    }

    fn decoder(&self, request: &ProviderRequest) -> Self::Decoder {
        DashScopeDecoder::new(request.clone())
    }

    fn parse_full(&self, body: Value, request: &ProviderRequest) -> Result<StreamChunk, AiError> {
        let response: AliResponse = serde_json::from_value(body)?;
        if let Some(code) = response.code.as_deref().filter(|c| !c.is_empty()) {
            return Ok(StreamChunk::failed(error_from_code(
                code,
                response.message.as_deref().unwrap_or_default(),
            )));
        }
        let message = response
            .output
            .and_then(|o| o.choices.into_iter().next())
            .and_then(|c| c.message)
            .ok_or_else(|| AiError::Protocol("Response contains no choices".to_string()))?;

        let mut chunk = request.terminal(response.usage.as_ref().and_then(AliUsage::total));
        chunk.content = message.content.as_ref().map(content_text).unwrap_or_default();
        chunk.reasoning_content = message.reasoning_content.filter(|r| !r.is_empty());
        Ok(chunk)
    }
}

/// DashScope SSE 解码器
pub struct DashScopeDecoder {
    request: ProviderRequest,
    /// 非增量模式下记录已输出的全文
    content: Option<CumulativeText>,
    reasoning: Option<CumulativeText>,
    tokens: Option<u32>,
}

impl DashScopeDecoder {
    pub fn new(request: ProviderRequest) -> Self {
        let cumulative = !request.model.is_reasoning;
        Self {
            request,
            content: cumulative.then(CumulativeText::new),
            reasoning: cumulative.then(CumulativeText::new),
            tokens: None,
        }
    }

    fn error_event(&self, data: &str) -> StreamChunk {
        let parsed: AliResponse = serde_json::from_str(data).unwrap_or_default();
        match parsed.code.as_deref() {
            Some(code) => StreamChunk::failed(error_from_code(code, parsed.message.as_deref().unwrap_or_default())),
            None => StreamChunk::failed(ResponseError::protocol(format!("DashScope stream error: {}", data))),
        }
    }
}

impl SseDecoder for DashScopeDecoder {
    fn on_event(&mut self, event: &Event) -> Vec<StreamChunk> {
        let data = event.data.trim();
        if event.event == "error" {
            return vec![self.error_event(data)];
        }
        if data.is_empty() {
            return Vec::new();
        }

        let parsed: AliResponse = match serde_json::from_str(data) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(model_id = %self.request.model.id, error = %e, "Failed to parse DashScope event");
                return vec![StreamChunk::failed(ResponseError::protocol(format!(
                    "Malformed stream event: {}",
                    e
                )))];
            }
        };
        if let Some(code) = parsed.code.as_deref().filter(|c| !c.is_empty()) {
            return vec![StreamChunk::failed(error_from_code(
                code,
                parsed.message.as_deref().unwrap_or_default(),
            ))];
        }
        if let Some(tokens) = parsed.usage.as_ref().and_then(AliUsage::total) {
            self.tokens = Some(tokens);
        }

        let mut chunks = Vec::new();
        let mut finished = false;
        for choice in parsed.output.map(|o| o.choices).unwrap_or_default() {
            finished |= choice.is_finished();
            let Some(message) = choice.message else { continue };

            if let Some(reasoning) = message.reasoning_content {
                let delta = match self.reasoning.as_mut() {
                    Some(seen) => seen.delta(&reasoning),
                    None => reasoning,
                };
                chunks.push(StreamChunk::reasoning(delta));
            }
            if let Some(content) = message.content.as_ref().map(content_text) {
                let delta = match self.content.as_mut() {
                    Some(seen) => seen.delta(&content),
                    None => content,
                };
                chunks.push(StreamChunk::content(delta));
            }
        }
        if finished {
            chunks.push(self.request.terminal(self.tokens));
        }
        chunks
    }

    fn on_end(&mut self) -> StreamChunk {
        StreamChunk::failed(ResponseError::protocol("Stream ended before completion"))
    }
}

pub type AliyunAdapter = HttpAdapter<DashScopeCodec>;

pub fn aliyun_adapter(client: BaseClient, base_url: Option<String>) -> AliyunAdapter {
    HttpAdapter::new(DashScopeCodec::new(base_url), client)
}
