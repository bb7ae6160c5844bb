//! # DeepSeek API 客户端
//!
//! OpenAI 兼容接口。`deepseek-reasoner` 通过 `reasoning_content` 输出思维链，
//! 且不接受 temperature/top_p。

use crate::llm_api::adapter::HttpAdapter;
use crate::llm_api::utils::client::BaseClient;
use crate::llm_api::utils::openai_compat::{OpenAiCompatCodec, OpenAiCompatProfile};
use crate::models::provider::Provider;

pub const DEEPSEEK_PROFILE: OpenAiCompatProfile = OpenAiCompatProfile {
    provider: Provider::Deepseek,
    default_base_url: "https://api.deepseek.com",
    temperature_range: (0.0, 2.0),
    include_usage: true,
    reasoning_accepts_sampling: false,
};

pub type DeepseekAdapter = HttpAdapter<OpenAiCompatCodec>;

pub fn deepseek_adapter(client: BaseClient, base_url: Option<String>) -> DeepseekAdapter {
    HttpAdapter::new(OpenAiCompatCodec::new(DEEPSEEK_PROFILE, base_url), client)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_api::adapter::{ProviderAdapter, ProviderRequest, VendorCodec};
    use crate::models::chat::ChatRequest;
    use crate::models::message::Message;
    use crate::models::provider::DEFAULT_MODELS;

    #[test]
    fn test_reasoner_body_has_no_sampling() {
        let adapter = deepseek_adapter(BaseClient::new_default().unwrap(), None);
        assert_eq!(adapter.provider(), Provider::Deepseek);

        let model = DEFAULT_MODELS.iter().find(|m| m.id == "deepseek-reasoner").unwrap();
        let chat = ChatRequest::new(vec![Message::user("1+1?")]).with_temperature(0.7);
        let request = ProviderRequest::from_chat(&chat, model);
        let body = adapter.codec().build_body(&request).unwrap();
        assert_eq!(body["model"], "deepseek-reasoner");
        assert!(body.get("temperature").is_none());
        assert_eq!(adapter.codec().endpoint(&request), "https://api.deepseek.com/chat/completions");
    }
}
