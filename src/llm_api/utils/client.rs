//! # 通用 LLM HTTP 客户端
//!
//! 提供统一的客户端基础设施，包括：
//! - 连接超时与响应头超时
//! - 重试机制（网络错误/5xx 指数退避，限流单次重试）
//! - 请求上下文与结构化日志
//! - 监控指标
//!
//! 流建立之后的读取不在这里重试，由调用方的调用时限兜底。

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client as HttpClient, Response};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use rand::Rng;
use tokio::time::{sleep, timeout};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::llm_api::error::{classify_status, AiError};
use crate::models::session::lock;

/// 超时配置
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// 连接超时时间
    pub connect_timeout: Duration,
    /// 等待响应头的超时时间（不包含流式读取）
    pub response_timeout: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            response_timeout: Duration::from_secs(60),
        }
    }
}

impl TimeoutConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }
}

/// 重试配置
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// 最大尝试次数（含第一次）
    pub max_attempts: u32,
    /// 基础延迟时间
    pub base_delay: Duration,
    /// 最大延迟时间
    pub max_delay: Duration,
    /// 是否启用指数退避
    pub exponential_backoff: bool,
    /// 限流且未给出 Retry-After 时的等待时间
    pub rate_limit_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            exponential_backoff: true,
            rate_limit_delay: Duration::from_secs(2),
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_rate_limit_delay(mut self, delay: Duration) -> Self {
        self.rate_limit_delay = delay;
        self
    }
}

/// 完整的客户端配置
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// 超时配置
    pub timeout: TimeoutConfig,
    /// 重试配置
    pub retry: RetryConfig,
    /// 默认请求头
    pub default_headers: HashMap<String, String>,
    /// 用户代理
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: TimeoutConfig::default(),
            retry: RetryConfig::default(),
            default_headers: HashMap::new(),
            user_agent: "model-arena/0.1".to_string(),
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: TimeoutConfig) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn add_header(mut self, key: String, value: String) -> Self {
        self.default_headers.insert(key, value);
        self
    }

    pub fn with_user_agent(mut self, user_agent: String) -> Self {
        self.user_agent = user_agent;
        self
    }
}

/// 请求上下文信息，用于日志记录和问题追踪
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// 请求唯一标识符
    pub request_id: String,
    /// 请求 URL
    pub url: String,
    /// 当前尝试次数
    pub attempt: u32,
    /// 最大尝试次数
    pub max_attempts: u32,
    /// 请求开始时间
    pub start_time: Instant,
    /// 当前尝试的开始时间
    pub attempt_start_time: Instant,
    /// 重试原因
    pub retry_reason: Option<String>,
    /// 限流重试是否已用掉
    pub rate_limit_retried: bool,
}

impl RequestContext {
    pub fn new(url: &str, max_attempts: u32) -> Self {
        let now = Instant::now();
        Self {
            request_id: Uuid::new_v4().to_string(),
            url: url.to_string(),
            attempt: 1,
            max_attempts,
            start_time: now,
            attempt_start_time: now,
            retry_reason: None,
            rate_limit_retried: false,
        }
    }

    /// 开始新的重试尝试
    pub fn start_retry(&mut self, reason: String) {
        self.attempt += 1;
        self.attempt_start_time = Instant::now();
        self.retry_reason = Some(reason);
    }

    pub fn total_elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn attempt_elapsed(&self) -> Duration {
        self.attempt_start_time.elapsed()
    }

    /// 检查是否为最后一次尝试
    pub fn is_final_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// 客户端监控指标
#[derive(Debug, Clone, Default)]
pub struct ClientMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub retry_count: u64,
    pub avg_response_time: Duration,
    pub max_response_time: Duration,
    pub min_response_time: Duration,
}

/// 通用 HTTP 客户端
///
/// 适配器通过 `open` 拿到状态码为 2xx 的 `Response` 再自行解码
#[derive(Debug, Clone)]
pub struct BaseClient {
    client: HttpClient,
    config: ClientConfig,
    metrics: Arc<Mutex<ClientMetrics>>,
}

impl BaseClient {
    pub fn new(config: ClientConfig) -> Result<Self, AiError> {
        Self::new_with_client(config, None)
    }

    /// 可注入自定义 HTTP 客户端（用于测试）
    pub fn new_with_client(config: ClientConfig, custom_client: Option<HttpClient>) -> Result<Self, AiError> {
        let client = match custom_client {
            Some(client) => client,
            None => {
                let mut default_headers = HeaderMap::new();
                for (key, value) in &config.default_headers {
                    if let (Ok(header_name), Ok(header_value)) = (
                        reqwest::header::HeaderName::from_bytes(key.as_bytes()),
                        reqwest::header::HeaderValue::from_str(value),
                    ) {
                        default_headers.insert(header_name, header_value);
                    }
                }

                // 不设置整体 timeout，否则长时间的流式输出会被 reqwest 截断
                HttpClient::builder()
                    .no_proxy()
                    .connect_timeout(config.timeout.connect_timeout)
                    .user_agent(&config.user_agent)
                    .default_headers(default_headers)
                    .build()
                    .map_err(|e| AiError::Configuration(format!("Failed to build HTTP client: {}", e)))?
            }
        };

        Ok(Self {
            client,
            config,
            metrics: Arc::new(Mutex::new(ClientMetrics::default())),
        })
    }

    pub fn new_default() -> Result<Self, AiError> {
        Self::new(ClientConfig::default())
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn metrics(&self) -> ClientMetrics {
        lock(&self.metrics).clone()
    }

    /// 发送 POST 请求并返回成功的响应（流式或非流式均可）
    pub async fn open<T>(&self, url: &str, headers: HeaderMap, body: &T) -> Result<Response, AiError>
    where
        T: Serialize + ?Sized,
    {
        let mut ctx = RequestContext::new(url, self.config.retry.max_attempts);
        self.log_request_start(&ctx);

        loop {
            let result = match timeout(
                self.config.timeout.response_timeout,
                self.client.post(url).headers(headers.clone()).json(body).send(),
            )
            .await
            {
                Ok(Ok(response)) if response.status().is_success() => {
                    self.log_request_success(&ctx);
                    self.update_success_metrics(ctx.total_elapsed());
                    return Ok(response);
                }
                Ok(Ok(response)) => {
                    let status = response.status().as_u16();
                    let retry_after = parse_retry_after(response.headers());
                    let error_text = response.text().await.unwrap_or_default();
                    self.log_api_error(&ctx, &error_text, status);
                    classify_status(status, &error_text, retry_after)
                }
                Ok(Err(error)) => {
                    self.log_network_error(&ctx, &error);
                    AiError::from(error)
                }
                Err(_) => {
                    self.log_timeout_error(&ctx, self.config.timeout.response_timeout);
                    AiError::Timeout(self.config.timeout.response_timeout)
                }
            };

            match self.retry_delay(&mut ctx, &result) {
                Some(delay) => {
                    ctx.start_retry(result.to_string());
                    self.log_retry_attempt(&ctx, delay);
                    self.update_retry_metrics();
                    sleep(delay).await;
                }
                None => {
                    self.log_request_failure(&ctx, &result);
                    self.update_failure_metrics();
                    return Err(result);
                }
            }
        }
    }

    /// 判断是否重试并给出等待时间；`None` 表示直接失败
    fn retry_delay(&self, ctx: &mut RequestContext, error: &AiError) -> Option<Duration> {
        match error {
            AiError::RateLimit { retry_after, .. } => {
                if ctx.rate_limit_retried {
                    return None;
                }
                ctx.rate_limit_retried = true;
                let delay = retry_after.unwrap_or(self.config.retry.rate_limit_delay);
                Some(delay.min(self.config.retry.max_delay))
            }
            error if error.is_retryable() && !ctx.is_final_attempt() => {
                Some(self.calculate_backoff_delay(ctx.attempt))
            }
            _ => None,
        }
    }

    /// 计算回退延迟时间，叠加最多 10% 的随机抖动
    pub fn calculate_backoff_delay(&self, attempt: u32) -> Duration {
        let base_delay = self.config.retry.base_delay;
        let max_delay = self.config.retry.max_delay;

        let delay = if self.config.retry.exponential_backoff {
            base_delay.saturating_mul(2_u32.saturating_pow(attempt.saturating_sub(1)))
        } else {
            base_delay
        };
        let delay = delay.min(max_delay);

        let jitter_cap = (delay.as_millis() as u64) / 10;
        let jitter = if jitter_cap > 0 {
            rand::thread_rng().gen_range(0..=jitter_cap)
        } else {
            0
        };
        (delay + Duration::from_millis(jitter)).min(max_delay)
    }

    fn update_success_metrics(&self, response_time: Duration) {
        let mut metrics = lock(&self.metrics);
        metrics.total_requests += 1;
        metrics.successful_requests += 1;

        if metrics.successful_requests == 1 {
            metrics.min_response_time = response_time;
            metrics.max_response_time = response_time;
            metrics.avg_response_time = response_time;
        } else {
            if response_time < metrics.min_response_time {
                metrics.min_response_time = response_time;
            }
            if response_time > metrics.max_response_time {
                metrics.max_response_time = response_time;
            }
            let n = metrics.successful_requests as u32;
            let total_time = metrics.avg_response_time * (n - 1) + response_time;
            metrics.avg_response_time = total_time / n;
        }
    }

    fn update_failure_metrics(&self) {
        let mut metrics = lock(&self.metrics);
        metrics.total_requests += 1;
        metrics.failed_requests += 1;
    }

    fn update_retry_metrics(&self) {
        lock(&self.metrics).retry_count += 1;
    }

    fn log_request_start(&self, ctx: &RequestContext) {
        info!(
            request_id = %ctx.request_id,
            url = %ctx.url,
            max_attempts = ctx.max_attempts,
            "Starting HTTP request"
        );
    }

    fn log_retry_attempt(&self, ctx: &RequestContext, delay: Duration) {
        warn!(
            request_id = %ctx.request_id,
            url = %ctx.url,
            attempt = ctx.attempt,
            max_attempts = ctx.max_attempts,
            delay_ms = delay.as_millis() as u64,
            retry_reason = ctx.retry_reason.as_deref().unwrap_or("unknown"),
            total_elapsed_ms = ctx.total_elapsed().as_millis() as u64,
            "Retrying request after error"
        );
    }

    fn log_request_success(&self, ctx: &RequestContext) {
        info!(
            request_id = %ctx.request_id,
            url = %ctx.url,
            attempt = ctx.attempt,
            total_elapsed_ms = ctx.total_elapsed().as_millis() as u64,
            attempt_elapsed_ms = ctx.attempt_elapsed().as_millis() as u64,
            "Response headers received"
        );
    }

    fn log_request_failure(&self, ctx: &RequestContext, error: &AiError) {
        error!(
            request_id = %ctx.request_id,
            url = %ctx.url,
            attempt = ctx.attempt,
            max_attempts = ctx.max_attempts,
            total_elapsed_ms = ctx.total_elapsed().as_millis() as u64,
            error = %error,
            "Request failed"
        );
    }

    fn log_network_error(&self, ctx: &RequestContext, error: &reqwest::Error) {
        error!(
            request_id = %ctx.request_id,
            url = %ctx.url,
            attempt = ctx.attempt,
            is_timeout = error.is_timeout(),
            is_connect = error.is_connect(),
            error_type = "network_error",
            error_message = %error,
            "Network error occurred"
        );
    }

    fn log_timeout_error(&self, ctx: &RequestContext, timeout_duration: Duration) {
        error!(
            request_id = %ctx.request_id,
            url = %ctx.url,
            attempt = ctx.attempt,
            timeout_duration_ms = timeout_duration.as_millis() as u64,
            actual_elapsed_ms = ctx.attempt_elapsed().as_millis() as u64,
            error_type = "timeout_error",
            "Request timeout occurred"
        );
    }

    fn log_api_error(&self, ctx: &RequestContext, message: &str, status_code: u16) {
        error!(
            request_id = %ctx.request_id,
            url = %ctx.url,
            attempt = ctx.attempt,
            status_code = status_code,
            error_type = "api_error",
            error_message = %message,
            "LLM API error occurred"
        );
    }
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let config = ClientConfig::new().with_retry(
            RetryConfig::new()
                .with_base_delay(Duration::from_millis(100))
                .with_max_delay(Duration::from_millis(350)),
        );
        let client = BaseClient::new(config).unwrap();

        let first = client.calculate_backoff_delay(1);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(110));
        let second = client.calculate_backoff_delay(2);
        assert!(second >= Duration::from_millis(200) && second <= Duration::from_millis(220));
        assert_eq!(client.calculate_backoff_delay(5), Duration::from_millis(350));
    }

    #[test]
    fn test_parse_retry_after() {
        let mut headers = HeaderMap::new();
        assert_eq!(parse_retry_after(&headers), None);
        headers.insert(RETRY_AFTER, "3".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_max_attempts_never_zero() {
        assert_eq!(RetryConfig::new().with_max_attempts(0).max_attempts, 1);
    }
}
