//! # 流聚合
//!
//! 把一个 (会话, 模型) 的归一化块累积进它独占的响应单元格。
//! 聚合器持有并发名额，终止时释放；每次调用只上报一次健康状态。

use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::llm_api::error::{ErrorKind, ResponseError};
use crate::models::chat::StreamChunk;
use crate::models::provider::Provider;
use crate::models::session::{ChatSession, ModelResponse, ResponseSlot};
use crate::orchestrator::limiter::Lease;
use crate::orchestrator::status::StatusRegistry;

/// 每个块到达时的回调：`(model_id, chunk)`
pub type StreamCallback = Arc<dyn Fn(&str, &StreamChunk) + Send + Sync>;

/// 终止方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Failed(ErrorKind),
    Cancelled,
    /// 单元格已被新的分发接管
    Superseded,
}

pub struct StreamAggregator {
    model_id: String,
    provider: Provider,
    session: Arc<ChatSession>,
    slot: Arc<ResponseSlot>,
    owner: u64,
    callback: Option<StreamCallback>,
    status: Arc<StatusRegistry>,
    lease: Option<Lease>,
    started: Instant,
    tokens: Option<u32>,
    cost: Option<f64>,
    outcome: Option<Outcome>,
    /// 本聚合器写入过的内容；单元格被接管后仍代表这次调用自己的结果
    local: ModelResponse,
}

impl StreamAggregator {
    pub fn new(
        model_id: &str,
        provider: Provider,
        session: Arc<ChatSession>,
        slot: Arc<ResponseSlot>,
        owner: u64,
        callback: Option<StreamCallback>,
        status: Arc<StatusRegistry>,
    ) -> Self {
        // 单元格此时可能已被并发的分发接管，只取消息 ID
        let local = ModelResponse::pending(model_id, &slot.snapshot().message_id);
        Self {
            model_id: model_id.to_string(),
            provider,
            session,
            slot,
            owner,
            callback,
            status,
            lease: None,
            started: Instant::now(),
            tokens: None,
            cost: None,
            outcome: None,
            local,
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn attach_lease(&mut self, lease: Lease) {
        self.lease = Some(lease);
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.outcome
    }

    pub fn is_finalized(&self) -> bool {
        self.outcome.is_some()
    }

    /// 这次调用自己的响应，不受后续分发接管单元格的影响
    pub fn response(&self) -> &ModelResponse {
        &self.local
    }

    /// 处理一个块，返回是否已经终止（调用方应停止读取）
    pub fn push(&mut self, chunk: StreamChunk) -> bool {
        if self.is_finalized() {
            return true;
        }
        if chunk.tokens.is_some() {
            self.tokens = chunk.tokens;
        }
        if chunk.cost.is_some() {
            self.cost = chunk.cost;
        }

        if chunk.finished {
            // 非流式调用的整段回答和部分供应商的尾部文本都在终止块上
            if self.finalize(chunk.error.clone(), &chunk.content, chunk.reasoning_content.as_deref(), true) {
                self.notify(&chunk);
            }
            return true;
        }

        let applied = self.apply(|response| {
            response.content.push_str(&chunk.content);
            if let Some(reasoning) = &chunk.reasoning_content {
                response.reasoning_content.push_str(reasoning);
            }
        });
        if !applied {
            self.superseded();
            return true;
        }
        self.notify(&chunk);
        false
    }

    /// 调用中途失败（超时、流意外结束），保留已累积的内容
    pub fn fail(&mut self, error: ResponseError) {
        if !self.is_finalized() && self.finalize(Some(error.clone()), "", None, true) {
            self.notify(&StreamChunk::failed(error));
        }
    }

    /// 分发前就失败（未知模型、缺少凭证），不算一次调用
    pub fn reject(&mut self, error: ResponseError) {
        if !self.is_finalized() && self.finalize(Some(error.clone()), "", None, false) {
            self.notify(&StreamChunk::failed(error));
        }
    }

    /// 调用方取消：停止写入并释放名额，不作为错误展示
    pub fn cancel(&mut self) {
        if self.is_finalized() {
            return;
        }
        let elapsed = self.elapsed_ms();
        let applied = self.apply(|response| {
            response.loading = false;
            response.cancelled = true;
            response.response_time_ms = Some(elapsed);
        });
        self.lease = None;
        if applied {
            info!(model_id = %self.model_id, provider = %self.provider, elapsed_ms = elapsed, "Model stream cancelled");
            self.outcome = Some(Outcome::Cancelled);
        } else {
            self.superseded();
        }
    }

    /// 同时写入单元格和本地副本；单元格拒绝时本地副本保持不变
    fn apply<F>(&mut self, f: F) -> bool
    where
        F: Fn(&mut ModelResponse),
    {
        if !self.slot.update(self.owner, &f) {
            return false;
        }
        f(&mut self.local);
        true
    }

    /// 单元格已被新的分发接管：这次调用按取消收尾
    fn superseded(&mut self) {
        debug!(model_id = %self.model_id, "Response cell taken over by a newer dispatch");
        self.lease = None;
        self.local.loading = false;
        self.local.cancelled = true;
        self.local.response_time_ms = Some(self.elapsed_ms());
        self.outcome = Some(Outcome::Superseded);
    }

    /// 写入终止状态；返回是否由本聚合器完成了写入
    fn finalize(&mut self, error: Option<ResponseError>, content: &str, reasoning: Option<&str>, report: bool) -> bool {
        let elapsed = self.elapsed_ms();
        let (tokens, cost) = (self.tokens, self.cost);
        let outcome = match &error {
            Some(error) => Outcome::Failed(error.kind),
            None => Outcome::Completed,
        };

        let applied = self.apply(|response| {
            response.content.push_str(content);
            if let Some(reasoning) = reasoning {
                response.reasoning_content.push_str(reasoning);
            }
            response.loading = false;
            response.is_complete = error.is_none();
            response.error = error.clone();
            response.response_time_ms = Some(elapsed);
            response.tokens = tokens;
            response.cost = cost;
        });
        // 名额在任何终止路径上都立即归还
        self.lease = None;

        if !applied {
            self.superseded();
            return false;
        }
        self.outcome = Some(outcome);
        self.session.add_usage(tokens, cost);

        match &error {
            None => {
                info!(
                    model_id = %self.model_id,
                    provider = %self.provider,
                    elapsed_ms = elapsed,
                    tokens = ?tokens,
                    "Model stream completed"
                );
                if report {
                    self.status.report_success(self.provider);
                }
            }
            Some(error) => {
                warn!(
                    model_id = %self.model_id,
                    provider = %self.provider,
                    elapsed_ms = elapsed,
                    kind = %error.kind,
                    error = %error.message,
                    "Model stream failed"
                );
                if report && error.kind != ErrorKind::Cancelled {
                    self.status.report_failure(self.provider);
                }
            }
        }
        true
    }

    fn notify(&self, chunk: &StreamChunk) {
        if let Some(callback) = &self.callback {
            callback(&self.model_id, chunk);
        }
    }

    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

impl Drop for StreamAggregator {
    // 任务被中止或 panic 时单元格不能停留在 loading
    fn drop(&mut self) {
        if self.is_finalized() {
            return;
        }
        if std::thread::panicking() {
            self.fail(ResponseError::protocol("Model task panicked"));
        } else {
            self.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::limiter::{ConcurrencyLimiter, LimiterConfig};
    use std::sync::Mutex;

    fn setup(owner: u64) -> (Arc<ChatSession>, Arc<ResponseSlot>, Arc<StatusRegistry>) {
        let session = Arc::new(ChatSession::new());
        let slot = session.claim_cell("m1", "msg1", owner);
        (session, slot, Arc::new(StatusRegistry::new()))
    }

    #[test]
    fn test_accumulates_and_completes() {
        let (session, slot, status) = setup(1);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: StreamCallback = Arc::new(move |model_id: &str, chunk: &StreamChunk| {
            sink.lock().unwrap().push((model_id.to_string(), chunk.content.clone()));
        });
        let mut aggregator =
            StreamAggregator::new("m1", Provider::Deepseek, session.clone(), slot.clone(), 1, Some(callback), status.clone());

        assert!(!aggregator.push(StreamChunk::content("He")));
        assert!(!aggregator.push(StreamChunk::content("llo")));
        assert_eq!(slot.snapshot().content, "Hello");
        assert!(slot.snapshot().loading);
        assert!(aggregator.push(StreamChunk::finished(Some(3), Some(0.0001))));

        let response = slot.snapshot();
        assert_eq!(response.content, "Hello");
        assert!(response.is_complete);
        assert!(!response.loading);
        assert_eq!(response.tokens, Some(3));
        assert_eq!(response.cost, Some(0.0001));
        assert!(response.response_time_ms.is_some());
        assert_eq!(aggregator.outcome(), Some(Outcome::Completed));
        assert_eq!(status.is_healthy(Provider::Deepseek), Some(true));
        assert_eq!(session.totals().tokens, 3);
        assert_eq!(seen.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_reasoning_buffer_is_separate() {
        let (session, slot, status) = setup(1);
        let mut aggregator = StreamAggregator::new("m1", Provider::Deepseek, session, slot.clone(), 1, None, status);
        aggregator.push(StreamChunk::reasoning("think"));
        aggregator.push(StreamChunk::content("answer"));
        let response = slot.snapshot();
        assert_eq!(response.reasoning_content, "think");
        assert_eq!(response.content, "answer");
    }

    #[test]
    fn test_error_keeps_partial_content_and_releases_lease() {
        let (session, slot, status) = setup(1);
        let limiter = ConcurrencyLimiter::new(LimiterConfig::default().with_capacity(Provider::Kimi, 1));
        let lease = futures::executor::block_on(limiter.acquire(Provider::Kimi)).unwrap();

        let mut aggregator = StreamAggregator::new("m1", Provider::Kimi, session, slot.clone(), 1, None, status.clone());
        aggregator.attach_lease(lease);
        assert_eq!(limiter.queue_status(Provider::Kimi).active, 1);

        aggregator.push(StreamChunk::content("partial"));
        assert!(aggregator.push(StreamChunk::failed(ResponseError::protocol("bad json"))));

        let response = slot.snapshot();
        assert_eq!(response.content, "partial");
        assert!(!response.is_complete);
        assert_eq!(response.error.unwrap().kind, ErrorKind::Protocol);
        assert_eq!(limiter.queue_status(Provider::Kimi).active, 0);
        assert_eq!(status.is_healthy(Provider::Kimi), Some(false));

        // 终止后的块被忽略
        assert!(aggregator.push(StreamChunk::content("late")));
        assert_eq!(slot.snapshot().content, "partial");
    }

    #[test]
    fn test_cancel_is_not_an_error() {
        let (session, slot, status) = setup(1);
        let mut aggregator = StreamAggregator::new("m1", Provider::Claude, session, slot.clone(), 1, None, status.clone());
        aggregator.push(StreamChunk::content("par"));
        aggregator.cancel();

        let response = slot.snapshot();
        assert!(response.cancelled);
        assert!(response.error.is_none());
        assert!(!response.loading);
        assert_eq!(response.content, "par");
        assert_eq!(status.is_healthy(Provider::Claude), None);
    }

    #[test]
    fn test_reject_does_not_report_status() {
        let (session, slot, status) = setup(1);
        let mut aggregator = StreamAggregator::new("m1", Provider::Aliyun, session, slot.clone(), 1, None, status.clone());
        aggregator.reject(ResponseError::configuration("no key"));
        assert_eq!(slot.snapshot().error.unwrap().kind, ErrorKind::Configuration);
        assert_eq!(status.is_healthy(Provider::Aliyun), None);
    }

    #[test]
    fn test_superseded_writer_stops() {
        let (session, slot, status) = setup(1);
        let mut old = StreamAggregator::new("m1", Provider::Kimi, session.clone(), slot.clone(), 1, None, status.clone());
        old.push(StreamChunk::content("old"));

        let replacement = session.claim_cell("m1", "msg1", 2);
        assert!(Arc::ptr_eq(&slot, &replacement));

        assert!(old.push(StreamChunk::content("stale")));
        assert_eq!(old.outcome(), Some(Outcome::Superseded));
        let response = slot.snapshot();
        assert_eq!(response.content, "");
        assert!(response.loading);
        assert_eq!(status.is_healthy(Provider::Kimi), None);
    }

    #[test]
    fn test_terminal_chunk_carries_whole_answer() {
        let (session, slot, status) = setup(1);
        let mut aggregator = StreamAggregator::new("m1", Provider::Volcengine, session, slot.clone(), 1, None, status);

        // 非流式响应：整段回答只出现在终止块上
        let mut terminal = StreamChunk::finished(Some(12), None);
        terminal.content = "Hello".to_string();
        terminal.reasoning_content = Some("thinking".to_string());
        assert!(aggregator.push(terminal));

        let response = slot.snapshot();
        assert_eq!(response.content, "Hello");
        assert_eq!(response.reasoning_content, "thinking");
        assert!(response.is_complete);
        assert_eq!(response.tokens, Some(12));
        assert_eq!(aggregator.response().content, "Hello");
    }

    #[test]
    fn test_terminal_chunk_appends_trailing_delta() {
        let (session, slot, status) = setup(1);
        let mut aggregator = StreamAggregator::new("m1", Provider::Deepseek, session, slot.clone(), 1, None, status);
        aggregator.push(StreamChunk::content("He"));

        let mut terminal = StreamChunk::finished(None, None);
        terminal.content = "llo".to_string();
        aggregator.push(terminal);
        assert_eq!(slot.snapshot().content, "Hello");
    }

    #[test]
    fn test_superseded_response_stays_with_its_writer() {
        let (session, slot, status) = setup(1);
        let mut old = StreamAggregator::new("m1", Provider::Kimi, session.clone(), slot.clone(), 1, None, status.clone());
        old.push(StreamChunk::content("old"));

        session.claim_cell("m1", "msg1", 2);
        let mut fresh = StreamAggregator::new("m1", Provider::Kimi, session, slot.clone(), 2, None, status);
        fresh.push(StreamChunk::content("new"));

        old.push(StreamChunk::content("stale"));
        let response = old.response();
        assert_eq!(response.content, "old");
        assert!(response.cancelled);
        assert!(!response.loading);
        assert!(response.error.is_none());

        // 单元格属于新的写入者，不受影响
        let cell = slot.snapshot();
        assert_eq!(cell.content, "new");
        assert!(cell.loading);
    }

    #[test]
    fn test_drop_without_terminal_marks_cancelled() {
        let (session, slot, status) = setup(1);
        {
            let mut aggregator = StreamAggregator::new("m1", Provider::Kimi, session, slot.clone(), 1, None, status);
            aggregator.push(StreamChunk::content("x"));
        }
        let response = slot.snapshot();
        assert!(response.is_terminal());
        assert!(response.cancelled);
    }
}
