use futures::StreamExt;
use mockito::{Matcher, Server};
use std::time::Duration;

use model_arena::llm_api::ali::aliyun_adapter;
use model_arena::llm_api::claude::claude_adapter;
use model_arena::llm_api::deepseek::deepseek_adapter;
use model_arena::llm_api::error::ErrorKind;
use model_arena::llm_api::kimi::kimi_adapter;
use model_arena::llm_api::utils::client::{BaseClient, ClientConfig, RetryConfig};
use model_arena::llm_api::volcengine::volcengine_adapter;
use model_arena::llm_api::{ProviderAdapter, ProviderRequest};
use model_arena::models::{ApiKeyConfig, ChatRequest, Message, ModelConfig, Provider, StreamChunk};

fn test_client() -> BaseClient {
    BaseClient::new(
        ClientConfig::new().with_retry(
            RetryConfig::new()
                .with_max_attempts(2)
                .with_base_delay(Duration::from_millis(5))
                .with_max_delay(Duration::from_millis(20))
                .with_rate_limit_delay(Duration::from_millis(5)),
        ),
    )
    .unwrap()
}

fn request_for(model: &ModelConfig, stream: bool) -> ProviderRequest {
    let chat = ChatRequest::new(vec![Message::user("Say hello")]).with_stream(stream);
    ProviderRequest::from_chat(&chat, model)
}

async fn collect(adapter: &dyn ProviderAdapter, request: ProviderRequest, key: &str) -> Vec<StreamChunk> {
    let credentials = ApiKeyConfig::new(adapter.provider(), key);
    adapter.send(request, credentials).collect().await
}

fn joined_content(chunks: &[StreamChunk]) -> String {
    chunks.iter().map(|c| c.content.as_str()).collect()
}

/// 恰好一个终止块，且位于末尾
fn assert_single_terminal(chunks: &[StreamChunk]) {
    assert!(!chunks.is_empty());
    assert_eq!(chunks.iter().filter(|c| c.finished).count(), 1);
    assert!(chunks.last().unwrap().finished);
}

#[cfg(test)]
mod adapter_tests {
    use super::*;

    // ========== OpenAI 兼容供应商 ==========

    #[tokio::test]
    async fn test_deepseek_stream() {
        let mut server = Server::new_async().await;
        let body = concat!(
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"\"}}]}\n\n",
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"He\"}}]}\n\n",
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"llo\"},\"finish_reason\":\"stop\"}]}\n\n",
            "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":5,\"completion_tokens\":7,\"total_tokens\":12}}\n\n",
            "data: [DONE]\n\n",
        );
        let mock = server
            .mock("POST", "/chat/completions")
            .match_header("authorization", "Bearer sk-deepseek")
            .match_body(Matcher::PartialJsonString(
                r#"{"model": "deepseek-chat", "stream": true}"#.to_string(),
            ))
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(body)
            .create_async()
            .await;

        let adapter = deepseek_adapter(test_client(), Some(server.url()));
        let model = ModelConfig::new("deepseek-chat", "DeepSeek V3", Provider::Deepseek, "deepseek-chat")
            .with_cost_per_token(0.5);
        let chunks = collect(&adapter, request_for(&model, true), "sk-deepseek").await;

        assert_single_terminal(&chunks);
        assert_eq!(joined_content(&chunks), "Hello");
        let last = chunks.last().unwrap();
        assert!(last.error.is_none());
        assert_eq!(last.tokens, Some(12));
        assert_eq!(last.cost, Some(6.0));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_deepseek_reasoning_stream() {
        let mut server = Server::new_async().await;
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"reasoning_content\":\"1+1\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"reasoning_content\":\"=2\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"2\"},\"finish_reason\":\"stop\"}]}\n\n",
            "data: [DONE]\n\n",
        );
        server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(body)
            .create_async()
            .await;

        let adapter = deepseek_adapter(test_client(), Some(server.url()));
        let model = ModelConfig::new("deepseek-reasoner", "R1", Provider::Deepseek, "deepseek-reasoner").with_reasoning();
        let chunks = collect(&adapter, request_for(&model, true), "sk").await;

        assert_single_terminal(&chunks);
        let reasoning: String = chunks.iter().filter_map(|c| c.reasoning_content.as_deref()).collect();
        assert_eq!(reasoning, "1+1=2");
        assert_eq!(joined_content(&chunks), "2");
    }

    #[tokio::test]
    async fn test_kimi_usage_inside_choice() {
        let mut server = Server::new_async().await;
        let body = concat!(
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"你好\"}}]}\n\n",
            "data: {\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\",\"usage\":{\"total_tokens\":9}}]}\n\n",
            "data: [DONE]\n\n",
        );
        server
            .mock("POST", "/chat/completions")
            .match_header("authorization", "Bearer sk-kimi")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(body)
            .create_async()
            .await;

        let adapter = kimi_adapter(test_client(), Some(server.url()));
        let model = ModelConfig::new("moonshot-v1-8k", "Kimi", Provider::Kimi, "moonshot-v1-8k");
        let chunks = collect(&adapter, request_for(&model, true), "sk-kimi").await;

        assert_single_terminal(&chunks);
        assert_eq!(joined_content(&chunks), "你好");
        assert_eq!(chunks.last().unwrap().tokens, Some(9));
    }

    #[tokio::test]
    async fn test_volcengine_non_stream() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/chat/completions")
            .match_body(Matcher::PartialJsonString(r#"{"stream": false}"#.to_string()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"choices":[{"index":0,"message":{"role":"assistant","content":"Hello"},"finish_reason":"stop"}],
                    "usage":{"prompt_tokens":3,"completion_tokens":2,"total_tokens":5}}"#,
            )
            .create_async()
            .await;

        let adapter = volcengine_adapter(test_client(), Some(server.url()));
        let model = ModelConfig::new("doubao-pro", "豆包", Provider::Volcengine, "doubao-1-5-pro-32k-250115");
        let chunks = collect(&adapter, request_for(&model, false), "ark-key").await;

        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].finished);
        assert_eq!(chunks[0].content, "Hello");
        assert_eq!(chunks[0].tokens, Some(5));
    }

    #[tokio::test]
    async fn test_stream_cut_before_finish_is_protocol_error() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body("data: {\"choices\":[{\"delta\":{\"content\":\"He\"}}]}\n\n")
            .create_async()
            .await;

        let adapter = deepseek_adapter(test_client(), Some(server.url()));
        let model = ModelConfig::new("deepseek-chat", "V3", Provider::Deepseek, "deepseek-chat");
        let chunks = collect(&adapter, request_for(&model, true), "sk").await;

        assert_single_terminal(&chunks);
        assert_eq!(joined_content(&chunks), "He");
        assert_eq!(chunks.last().unwrap().error.as_ref().unwrap().kind, ErrorKind::Protocol);
    }

    // ========== 错误映射 ==========

    #[tokio::test]
    async fn test_unauthorized_maps_to_configuration() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/chat/completions")
            .with_status(401)
            .with_body(r#"{"error":{"message":"Authentication Fails","type":"authentication_error"}}"#)
            .expect(1)
            .create_async()
            .await;

        let adapter = deepseek_adapter(test_client(), Some(server.url()));
        let model = ModelConfig::new("deepseek-chat", "V3", Provider::Deepseek, "deepseek-chat");
        let chunks = collect(&adapter, request_for(&model, true), "sk-bad").await;

        assert_eq!(chunks.len(), 1);
        let error = chunks[0].error.as_ref().unwrap();
        assert_eq!(error.kind, ErrorKind::Configuration);
        assert_eq!(error.status_code, Some(401));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_rate_limit_maps_to_rate_limit() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/chat/completions")
            .with_status(429)
            .with_body(r#"{"error":{"message":"Too many requests"}}"#)
            .create_async()
            .await;

        let adapter = kimi_adapter(test_client(), Some(server.url()));
        let model = ModelConfig::new("moonshot-v1-8k", "Kimi", Provider::Kimi, "moonshot-v1-8k");
        let chunks = collect(&adapter, request_for(&model, true), "sk").await;

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].error.as_ref().unwrap().kind, ErrorKind::RateLimit);
    }

    #[tokio::test]
    async fn test_missing_key_fails_without_request() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/chat/completions")
            .expect(0)
            .create_async()
            .await;

        let adapter = deepseek_adapter(test_client(), Some(server.url()));
        let model = ModelConfig::new("deepseek-chat", "V3", Provider::Deepseek, "deepseek-chat");
        let chunks = collect(&adapter, request_for(&model, true), "  ").await;

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].error.as_ref().unwrap().kind, ErrorKind::Configuration);
        mock.assert_async().await;
    }

    // ========== DashScope ==========

    #[tokio::test]
    async fn test_dashscope_cumulative_stream() {
        let mut server = Server::new_async().await;
        let body = concat!(
            "id:1\nevent:result\ndata:{\"output\":{\"choices\":[{\"message\":{\"role\":\"assistant\",\"content\":\"He\"},\"finish_reason\":\"null\"}]},\"usage\":{\"total_tokens\":4}}\n\n",
            "id:2\nevent:result\ndata:{\"output\":{\"choices\":[{\"message\":{\"role\":\"assistant\",\"content\":\"Hello\"},\"finish_reason\":\"null\"}]},\"usage\":{\"total_tokens\":5}}\n\n",
            "id:3\nevent:result\ndata:{\"output\":{\"choices\":[{\"message\":{\"role\":\"assistant\",\"content\":\"Hello!\"},\"finish_reason\":\"stop\"}]},\"usage\":{\"input_tokens\":3,\"output_tokens\":3,\"total_tokens\":6}}\n\n",
        );
        let mock = server
            .mock("POST", "/api/v1/services/aigc/text-generation/generation")
            .match_header("x-dashscope-sse", "enable")
            .match_body(Matcher::PartialJsonString(
                r#"{"model": "qwen-plus", "parameters": {"result_format": "message"}}"#.to_string(),
            ))
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(body)
            .create_async()
            .await;

        let adapter = aliyun_adapter(test_client(), Some(server.url()));
        let model = ModelConfig::new("qwen-plus", "Qwen Plus", Provider::Aliyun, "qwen-plus");
        let chunks = collect(&adapter, request_for(&model, true), "sk-ali").await;

        assert_single_terminal(&chunks);
        let deltas: Vec<&str> = chunks.iter().filter(|c| !c.finished).map(|c| c.content.as_str()).collect();
        assert_eq!(deltas, vec!["He", "llo", "!"]);
        assert_eq!(chunks.last().unwrap().tokens, Some(6));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_dashscope_error_event() {
        let mut server = Server::new_async().await;
        let body = concat!(
            "id:1\nevent:result\ndata:{\"output\":{\"choices\":[{\"message\":{\"content\":\"Hi\"},\"finish_reason\":\"null\"}]}}\n\n",
            "id:2\nevent:error\ndata:{\"code\":\"Throttling.RateQuota\",\"message\":\"Requests rate limit exceeded\"}\n\n",
        );
        server
            .mock("POST", "/api/v1/services/aigc/text-generation/generation")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(body)
            .create_async()
            .await;

        let adapter = aliyun_adapter(test_client(), Some(server.url()));
        let model = ModelConfig::new("qwen-plus", "Qwen Plus", Provider::Aliyun, "qwen-plus");
        let chunks = collect(&adapter, request_for(&model, true), "sk-ali").await;

        assert_single_terminal(&chunks);
        assert_eq!(joined_content(&chunks), "Hi");
        assert_eq!(chunks.last().unwrap().error.as_ref().unwrap().kind, ErrorKind::RateLimit);
    }

    // ========== Claude ==========

    #[tokio::test]
    async fn test_claude_stream() {
        let mut server = Server::new_async().await;
        let body = concat!(
            "event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\",\"usage\":{\"input_tokens\":10,\"output_tokens\":1}}}\n\n",
            "event: content_block_start\ndata: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\n",
            "event: ping\ndata: {\"type\":\"ping\"}\n\n",
            "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"He\"}}\n\n",
            "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"llo\"}}\n\n",
            "event: content_block_stop\ndata: {\"type\":\"content_block_stop\",\"index\":0}\n\n",
            "event: message_delta\ndata: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":5}}\n\n",
            "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n",
        );
        let mock = server
            .mock("POST", "/v1/messages")
            .match_header("x-api-key", "sk-ant")
            .match_header("anthropic-version", "2023-06-01")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(body)
            .create_async()
            .await;

        let adapter = claude_adapter(test_client(), Some(server.url()));
        let model = ModelConfig::new("claude-sonnet-4", "Sonnet", Provider::Claude, "claude-sonnet-4-20250514");
        let chunks = collect(&adapter, request_for(&model, true), "sk-ant").await;

        assert_single_terminal(&chunks);
        assert_eq!(joined_content(&chunks), "Hello");
        assert_eq!(chunks.last().unwrap().tokens, Some(15));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_claude_overloaded_error_event() {
        let mut server = Server::new_async().await;
        let body = concat!(
            "event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":3}}}\n\n",
            "event: error\ndata: {\"type\":\"error\",\"error\":{\"type\":\"overloaded_error\",\"message\":\"Overloaded\"}}\n\n",
        );
        server
            .mock("POST", "/v1/messages")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(body)
            .create_async()
            .await;

        let adapter = claude_adapter(test_client(), Some(server.url()));
        let model = ModelConfig::new("claude-sonnet-4", "Sonnet", Provider::Claude, "claude-sonnet-4-20250514");
        let chunks = collect(&adapter, request_for(&model, true), "sk-ant").await;

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].error.as_ref().unwrap().kind, ErrorKind::Network);
    }
}
