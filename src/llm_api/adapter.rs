//! # 供应商适配器
//!
//! 所有供应商都实现同一个 `ProviderAdapter::send`：
//! 输入归一化请求，输出惰性、可取消（drop 即中断连接）、有限的 `StreamChunk` 序列。
//! 序列以恰好一个终止块结束；任何供应商侧错误都在这里被转换成带错误描述的终止块。

use async_stream::stream;
use futures_util::{Stream, StreamExt};
use reqwest::header::HeaderMap;
use serde_json::Value;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::llm_api::error::AiError;
use crate::llm_api::utils::client::BaseClient;
use crate::llm_api::utils::sse::{decode_events, sse_events, SseDecoder};
use crate::models::chat::{ChatRequest, StreamChunk};
use crate::models::credential::ApiKeyConfig;
use crate::models::message::Message;
use crate::models::provider::{ModelConfig, Provider};

/// 归一化块的流
pub type ChunkStream = Pin<Box<dyn Stream<Item = StreamChunk> + Send>>;

/// 交给适配器的归一化请求：请求参数已与模型默认值合并
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub model: ModelConfig,
    pub messages: Vec<Message>,
    pub system_prompt: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
    pub stream: bool,
}

impl ProviderRequest {
    /// 合并请求参数与模型配置，请求优先
    pub fn from_chat(request: &ChatRequest, model: &ModelConfig) -> Self {
        Self {
            model: model.clone(),
            messages: request.messages.clone(),
            system_prompt: request
                .system_prompt
                .clone()
                .filter(|p| !p.trim().is_empty()),
            temperature: request.temperature.or(model.temperature),
            max_tokens: request.max_tokens.or(model.max_tokens),
            top_p: model.top_p,
            stream: request.is_stream(),
        }
    }

    /// 模型支持视觉时返回消息的图像，否则丢弃并记录
    pub fn images_of<'a>(&self, message: &'a Message) -> &'a [String] {
        if message.images.is_empty() {
            return &[];
        }
        if self.model.supports_vision {
            &message.images
        } else {
            warn!(
                model_id = %self.model.id,
                dropped = message.images.len(),
                "Model does not support images, attachments dropped"
            );
            &[]
        }
    }

    /// 是否有任何需要发送的图像
    pub fn has_images(&self) -> bool {
        self.model.supports_vision && self.messages.iter().any(Message::has_images)
    }

    /// 带成本的成功终止块
    pub fn terminal(&self, tokens: Option<u32>) -> StreamChunk {
        StreamChunk::finished(tokens, tokens.map(|t| self.model.cost_for(t)))
    }
}

/// 供应商适配器
pub trait ProviderAdapter: Send + Sync {
    fn provider(&self) -> Provider;

    /// 构造流；在被轮询之前不会发起任何网络请求
    fn send(&self, request: ProviderRequest, credentials: ApiKeyConfig) -> ChunkStream;
}

/// 某个供应商 HTTP 协议的编解码
pub trait VendorCodec: Send + Sync + 'static {
    type Decoder: SseDecoder + 'static;

    fn provider(&self) -> Provider;

    /// 请求地址
    fn endpoint(&self, request: &ProviderRequest) -> String;

    /// 认证与协议头
    fn headers(&self, request: &ProviderRequest, credentials: &ApiKeyConfig) -> Result<HeaderMap, AiError>;

    /// 供应商请求体
    fn build_body(&self, request: &ProviderRequest) -> Result<Value, AiError>;

    /// 流式事件解码器
    fn decoder(&self, request: &ProviderRequest) -> Self::Decoder;

    /// 解析非流式响应，返回单个终止块
    fn parse_full(&self, body: Value, request: &ProviderRequest) -> Result<StreamChunk, AiError>;
}

/// 基于 HTTP 的通用适配器，具体协议由 `VendorCodec` 决定
pub struct HttpAdapter<C: VendorCodec> {
    codec: Arc<C>,
    client: BaseClient,
}

impl<C: VendorCodec> HttpAdapter<C> {
    pub fn new(codec: C, client: BaseClient) -> Self {
        Self {
            codec: Arc::new(codec),
            client,
        }
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }
}

impl<C: VendorCodec> ProviderAdapter for HttpAdapter<C> {
    fn provider(&self) -> Provider {
        self.codec.provider()
    }

    fn send(&self, request: ProviderRequest, credentials: ApiKeyConfig) -> ChunkStream {
        let codec = self.codec.clone();
        let client = self.client.clone();

        Box::pin(stream! {
            let headers = match codec.headers(&request, &credentials) {
                Ok(headers) => headers,
                Err(error) => {
                    yield StreamChunk::failed(error);
                    return;
                }
            };
            let body = match codec.build_body(&request) {
                Ok(body) => body,
                Err(error) => {
                    yield StreamChunk::failed(error);
                    return;
                }
            };
            let url = codec.endpoint(&request);
            debug!(provider = %codec.provider(), model_id = %request.model.id, url = %url, stream = request.stream, "Sending vendor request");

            let response = match client.open(&url, headers, &body).await {
                Ok(response) => response,
                Err(error) => {
                    yield StreamChunk::failed(error);
                    return;
                }
            };

            if request.stream {
                let decoder = codec.decoder(&request);
                let mut chunks = Box::pin(decode_events(sse_events(response), decoder));
                while let Some(chunk) = chunks.next().await {
                    yield chunk;
                }
            } else {
                let chunk = match response.json::<Value>().await {
                    Ok(body) => codec.parse_full(body, &request).unwrap_or_else(StreamChunk::failed),
                    Err(error) => StreamChunk::failed(AiError::Protocol(format!("Failed to read response: {}", error))),
                };
                yield chunk;
            }
        })
    }
}

/// `Authorization: Bearer` 头，key 为空时报配置错误
pub fn bearer_headers(credentials: &ApiKeyConfig) -> Result<HeaderMap, AiError> {
    if !credentials.is_present() {
        return Err(AiError::Configuration(format!(
            "No API key configured for provider '{}'",
            credentials.provider
        )));
    }
    let mut headers = HeaderMap::new();
    let value = format!("Bearer {}", credentials.api_key.trim())
        .parse()
        .map_err(|_| AiError::Configuration("API key contains invalid header characters".to_string()))?;
    headers.insert(reqwest::header::AUTHORIZATION, value);
    Ok(headers)
}
