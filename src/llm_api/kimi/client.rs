//! # Kimi (Moonshot) API 客户端
//!
//! OpenAI 兼容接口，温度范围为 [0, 1]，流式 usage 放在结束 choice 内。

use crate::llm_api::adapter::HttpAdapter;
use crate::llm_api::utils::client::BaseClient;
use crate::llm_api::utils::openai_compat::{OpenAiCompatCodec, OpenAiCompatProfile};
use crate::models::provider::Provider;

pub const KIMI_PROFILE: OpenAiCompatProfile = OpenAiCompatProfile {
    provider: Provider::Kimi,
    default_base_url: "https://api.moonshot.cn/v1",
    temperature_range: (0.0, 1.0),
    include_usage: false,
    reasoning_accepts_sampling: true,
};

pub type KimiAdapter = HttpAdapter<OpenAiCompatCodec>;

pub fn kimi_adapter(client: BaseClient, base_url: Option<String>) -> KimiAdapter {
    HttpAdapter::new(OpenAiCompatCodec::new(KIMI_PROFILE, base_url), client)
}
