//! # 错误分类
//!
//! `AiError` 是 HTTP 客户端与适配器内部使用的错误；
//! 到达适配器边界后统一转换为可序列化的 `ResponseError`，随终止块下发。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// 面向调用方的错误类别
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// 凭证缺失/无效、未知模型等配置问题
    Configuration,
    /// 连接失败、超时、服务端 5xx
    Network,
    /// 供应商限流
    RateLimit,
    /// 供应商返回了无法解析或不符合预期的数据
    Protocol,
    /// 调用方主动取消，不作为用户可见错误
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Network => "network",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 写入终止块与 ModelResponse 的错误描述
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{kind} error: {message}")]
pub struct ResponseError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
}

impl ResponseError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status_code: None,
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Protocol, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "cancelled by caller")
    }
}

/// 客户端与适配器内部错误
#[derive(Debug, Error)]
pub enum AiError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Authentication rejected (status: {status}): {message}")]
    Auth { status: u16, message: String },

    #[error("Rate limited: {message}")]
    RateLimit {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timeout after {0:?}")]
    Timeout(Duration),

    #[error("LLM API error: {message} (status: {status})")]
    Api { status: u16, message: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AiError {
    /// 映射到面向调用方的错误类别
    pub fn kind(&self) -> ErrorKind {
        match self {
            AiError::Configuration(_) | AiError::Auth { .. } => ErrorKind::Configuration,
            AiError::RateLimit { .. } => ErrorKind::RateLimit,
            AiError::Network(_) | AiError::Timeout(_) => ErrorKind::Network,
            AiError::Api { status, .. } if *status >= 500 => ErrorKind::Network,
            AiError::Api { .. } | AiError::Protocol(_) | AiError::Json(_) | AiError::Internal(_) => {
                ErrorKind::Protocol
            }
            AiError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// 是否可以在建立流之前自动重试
    pub fn is_retryable(&self) -> bool {
        match self {
            AiError::Network(_) | AiError::Timeout(_) => true,
            AiError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }

    fn status_code(&self) -> Option<u16> {
        match self {
            AiError::Auth { status, .. } | AiError::Api { status, .. } => Some(*status),
            AiError::RateLimit { .. } => Some(429),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for AiError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            AiError::Network(format!("timeout: {}", error))
        } else if error.is_decode() {
            AiError::Protocol(error.to_string())
        } else {
            AiError::Network(error.to_string())
        }
    }
}

impl From<AiError> for ResponseError {
    fn from(error: AiError) -> Self {
        ResponseError {
            kind: error.kind(),
            status_code: error.status_code(),
            message: error.to_string(),
        }
    }
}

/// 把 HTTP 错误状态码和响应体归类为 `AiError`
pub fn classify_status(status: u16, body: &str, retry_after: Option<Duration>) -> AiError {
    let message = extract_error_message(body);
    match status {
        401 | 403 => AiError::Auth { status, message },
        429 => AiError::RateLimit { message, retry_after },
        _ => AiError::Api { status, message },
    }
}

/// 从常见的供应商错误格式里取出错误信息：
/// `{"error": {"message": ..}}`、`{"message": ..}`、`{"code": .., "message": ..}`
pub fn extract_error_message(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(message) = value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
        {
            return message.to_string();
        }
        if let Some(message) = value.get("message").and_then(|m| m.as_str()) {
            return match value.get("code").and_then(|c| c.as_str()) {
                Some(code) => format!("{}: {}", code, message),
                None => message.to_string(),
            };
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        "Unknown error".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_mapping() {
        assert_eq!(AiError::Configuration("x".into()).kind(), ErrorKind::Configuration);
        assert_eq!(AiError::Auth { status: 401, message: "x".into() }.kind(), ErrorKind::Configuration);
        assert_eq!(AiError::RateLimit { message: "x".into(), retry_after: None }.kind(), ErrorKind::RateLimit);
        assert_eq!(AiError::Timeout(Duration::from_secs(1)).kind(), ErrorKind::Network);
        assert_eq!(AiError::Api { status: 502, message: "x".into() }.kind(), ErrorKind::Network);
        assert_eq!(AiError::Api { status: 400, message: "x".into() }.kind(), ErrorKind::Protocol);
        assert_eq!(AiError::Cancelled.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn test_retryable() {
        assert!(AiError::Network("reset".into()).is_retryable());
        assert!(AiError::Api { status: 503, message: "x".into() }.is_retryable());
        assert!(!AiError::Api { status: 400, message: "x".into() }.is_retryable());
        assert!(!AiError::Auth { status: 401, message: "x".into() }.is_retryable());
    }

    #[test]
    fn test_classify_status_and_message() {
        let err = classify_status(401, r#"{"error":{"message":"invalid api key"}}"#, None);
        assert!(matches!(err, AiError::Auth { status: 401, ref message } if message == "invalid api key"));

        let err = classify_status(429, r#"{"code":"Throttling","message":"slow down"}"#, None);
        assert!(matches!(err, AiError::RateLimit { ref message, .. } if message == "Throttling: slow down"));

        let err = classify_status(500, "", None);
        assert!(matches!(err, AiError::Api { status: 500, ref message } if message == "Unknown error"));
    }

    #[test]
    fn test_response_error_from_ai_error() {
        let err: ResponseError = AiError::RateLimit { message: "busy".into(), retry_after: None }.into();
        assert_eq!(err.kind, ErrorKind::RateLimit);
        assert_eq!(err.status_code, Some(429));
        assert!(err.message.contains("busy"));
    }
}
