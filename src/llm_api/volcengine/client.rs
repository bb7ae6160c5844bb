//! # 火山方舟 API 客户端
//!
//! OpenAI 兼容接口；`model` 既可以是模型名也可以是推理接入点 ID。

use crate::llm_api::adapter::HttpAdapter;
use crate::llm_api::utils::client::BaseClient;
use crate::llm_api::utils::openai_compat::{OpenAiCompatCodec, OpenAiCompatProfile};
use crate::models::provider::Provider;

pub const VOLCENGINE_PROFILE: OpenAiCompatProfile = OpenAiCompatProfile {
    provider: Provider::Volcengine,
    default_base_url: "https://ark.cn-beijing.volces.com/api/v3",
    temperature_range: (0.0, 2.0),
    include_usage: true,
    reasoning_accepts_sampling: true,
};

pub type VolcengineAdapter = HttpAdapter<OpenAiCompatCodec>;

pub fn volcengine_adapter(client: BaseClient, base_url: Option<String>) -> VolcengineAdapter {
    HttpAdapter::new(OpenAiCompatCodec::new(VOLCENGINE_PROFILE, base_url), client)
}
