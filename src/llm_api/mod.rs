//! # 供应商接入层
//!
//! 每个供应商一个适配器，统一输出 `StreamChunk` 流

pub mod adapter;
pub mod ali;
pub mod claude;
pub mod deepseek;
pub mod error;
pub mod kimi;
pub mod utils;
pub mod volcengine;

use std::sync::Arc;

pub use adapter::{ChunkStream, HttpAdapter, ProviderAdapter, ProviderRequest, VendorCodec};
pub use error::{AiError, ErrorKind, ResponseError};

use crate::llm_api::utils::client::BaseClient;
use crate::models::provider::Provider;

/// 为供应商构造默认适配器；`base_url` 为空时使用官方地址
pub fn build_adapter(provider: Provider, client: BaseClient, base_url: Option<String>) -> Arc<dyn ProviderAdapter> {
    match provider {
        Provider::Deepseek => Arc::new(deepseek::deepseek_adapter(client, base_url)),
        Provider::Aliyun => Arc::new(ali::aliyun_adapter(client, base_url)),
        Provider::Volcengine => Arc::new(volcengine::volcengine_adapter(client, base_url)),
        Provider::Kimi => Arc::new(kimi::kimi_adapter(client, base_url)),
        Provider::Claude => Arc::new(claude::claude_adapter(client, base_url)),
    }
}
