//! # model_arena
//!
//! 一次提问，多个模型供应商并发流式作答，便于并排对比。
//!
//! - [`llm_api`]：各供应商适配器与 HTTP 客户端，统一输出 [`models::StreamChunk`]
//! - [`orchestrator`]：分发、并发限制、流聚合、健康状态
//! - [`models`]：请求、消息、会话与响应矩阵
//! - [`config`] / [`logger`]：配置加载与日志初始化

pub mod config;
pub mod llm_api;
pub mod logger;
pub mod models;
pub mod orchestrator;

pub use config::OrchestratorConfig;
pub use models::{ChatRequest, ChatSession, Message, ModelConfig, ModelResponse, Provider, StreamChunk};
pub use orchestrator::{BatchHandle, Dispatcher, StreamCallback};
