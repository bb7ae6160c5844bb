//! # 多模型分发器
//!
//! 把一个请求扇出到多个模型，每个模型一个独立任务：
//! 排队获取并发名额 → 适配器发送 → 聚合器写入响应单元格。
//! 任何一个模型的失败都不会影响同批次的其他模型。
//!
//! 同一 (会话, 模型) 在任意时刻最多只有一个活动流：
//! 新的分发会取消并替换旧的流，旧流之后的写入会被单元格拒绝。

use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::llm_api::adapter::{ProviderAdapter, ProviderRequest};
use crate::llm_api::build_adapter;
use crate::llm_api::error::{AiError, ErrorKind, ResponseError};
use crate::llm_api::utils::client::BaseClient;
use crate::models::chat::ChatRequest;
use crate::models::credential::ApiKeyConfig;
use crate::models::provider::{ModelConfig, Provider};
use crate::models::session::{lock, ChatSession, ModelResponse, ResponseSlot};
use crate::orchestrator::aggregator::{StreamAggregator, StreamCallback};
use crate::orchestrator::credentials::CredentialStore;
use crate::orchestrator::limiter::{ConcurrencyLimiter, LimiterConfig, QueueStatus};
use crate::orchestrator::status::{init_status_registry, StatusRegistry};

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(120);

/// 请求在分发前的校验错误
#[derive(Debug, Error, PartialEq)]
pub enum DispatchError {
    #[error("Request contains no messages")]
    EmptyMessages,

    #[error("No models selected")]
    NoModels,

    #[error("Temperature {0} is out of range [0, 2]")]
    InvalidTemperature(f32),

    #[error("max_tokens must be greater than 0")]
    InvalidMaxTokens,
}

/// 某个 (会话, 模型) 当前的活动流
struct ActiveStream {
    generation: u64,
    token: CancellationToken,
}

type ActiveMap = Arc<Mutex<HashMap<(String, String), ActiveStream>>>;

/// 分发器
pub struct Dispatcher {
    adapters: Arc<RwLock<HashMap<Provider, Arc<dyn ProviderAdapter>>>>,
    models: Arc<RwLock<HashMap<String, ModelConfig>>>,
    credentials: Arc<CredentialStore>,
    limiter: Arc<ConcurrencyLimiter>,
    status: Arc<StatusRegistry>,
    call_timeout: Duration,
    active: ActiveMap,
    generation: AtomicU64,
}

impl Dispatcher {
    /// 空分发器：没有适配器和模型，状态上报到进程级状态表
    pub fn new(limiter: LimiterConfig, credentials: Arc<CredentialStore>) -> Self {
        Self {
            adapters: Arc::new(RwLock::new(HashMap::new())),
            models: Arc::new(RwLock::new(HashMap::new())),
            credentials,
            limiter: Arc::new(ConcurrencyLimiter::new(limiter)),
            status: init_status_registry(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            active: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
        }
    }

    /// 为每个供应商注册默认 HTTP 适配器
    pub fn with_default_adapters(
        limiter: LimiterConfig,
        credentials: Arc<CredentialStore>,
        client: BaseClient,
        base_urls: &HashMap<Provider, String>,
    ) -> Self {
        let mut adapters: HashMap<Provider, Arc<dyn ProviderAdapter>> = HashMap::new();
        for provider in Provider::ALL {
            adapters.insert(
                provider,
                build_adapter(provider, client.clone(), base_urls.get(&provider).cloned()),
            );
        }
        info!(adapters = adapters.len(), "Dispatcher initialized with default adapters");
        Self {
            adapters: Arc::new(RwLock::new(adapters)),
            ..Self::new(limiter, credentials)
        }
    }

    /// 使用独立的状态表（测试或多实例场景）
    pub fn with_status_registry(mut self, status: Arc<StatusRegistry>) -> Self {
        self.status = status;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// 注册或替换某个供应商的适配器
    pub async fn register_adapter(&self, adapter: Arc<dyn ProviderAdapter>) {
        let provider = adapter.provider();
        debug!(provider = %provider, "Adapter registered");
        self.adapters.write().await.insert(provider, adapter);
    }

    pub async fn register_model(&self, model: ModelConfig) {
        self.models.write().await.insert(model.id.clone(), model);
    }

    pub async fn register_models(&self, models: impl IntoIterator<Item = ModelConfig>) {
        let mut registry = self.models.write().await;
        for model in models {
            registry.insert(model.id.clone(), model);
        }
    }

    pub async fn model(&self, model_id: &str) -> Option<ModelConfig> {
        self.models.read().await.get(model_id).cloned()
    }

    /// 按供应商列出已注册的模型 ID
    pub async fn list_models(&self, provider: Option<Provider>) -> HashMap<Provider, Vec<String>> {
        let models = self.models.read().await;
        let mut listed: HashMap<Provider, Vec<String>> = HashMap::new();
        for model in models.values() {
            if provider.is_none_or(|p| p == model.provider) {
                listed.entry(model.provider).or_default().push(model.id.clone());
            }
        }
        for ids in listed.values_mut() {
            ids.sort();
        }
        listed
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    pub fn get_queue_status(&self) -> HashMap<Provider, QueueStatus> {
        self.limiter.get_queue_status()
    }

    pub fn get_service_status(&self) -> HashMap<Provider, bool> {
        self.status.get_service_status()
    }

    /// 某个 (会话, 模型) 是否有活动流
    pub fn is_active(&self, session_id: &str, model_id: &str) -> bool {
        lock(&self.active).contains_key(&(session_id.to_string(), model_id.to_string()))
    }

    fn validate_request(request: &ChatRequest, model_ids: &[String]) -> Result<(), DispatchError> {
        if request.messages.is_empty() {
            return Err(DispatchError::EmptyMessages);
        }
        if model_ids.is_empty() {
            return Err(DispatchError::NoModels);
        }
        if let Some(temperature) = request.temperature {
            if !(0.0..=2.0).contains(&temperature) {
                return Err(DispatchError::InvalidTemperature(temperature));
            }
        }
        if request.max_tokens == Some(0) {
            return Err(DispatchError::InvalidMaxTokens);
        }
        Ok(())
    }

    /// 把请求扇出到所选模型，立即返回批次句柄
    ///
    /// 请求的最后一条消息 ID 作为响应矩阵的列键。
    /// 未知模型、缺少适配器或凭证只让对应模型以配置错误终止。
    pub async fn dispatch<I, S>(
        &self,
        session: &Arc<ChatSession>,
        request: ChatRequest,
        model_ids: I,
        callback: Option<StreamCallback>,
    ) -> Result<BatchHandle, DispatchError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut selected: Vec<String> = Vec::new();
        for id in model_ids {
            let id = id.into();
            if !selected.contains(&id) {
                selected.push(id);
            }
        }
        Self::validate_request(&request, &selected)?;

        let message_id = request.message_id().unwrap_or_default().to_string();
        let batch_token = CancellationToken::new();
        let mut entries = Vec::with_capacity(selected.len());

        info!(
            session_id = %session.id(),
            message_id = %message_id,
            models = ?selected,
            "Dispatching request"
        );

        for model_id in selected {
            let (generation, slot) = self.claim(session, &model_id, &message_id);
            let token = batch_token.child_token();
            let model = self.model(&model_id).await;
            let provider = model.as_ref().map(|m| m.provider);

            let mut aggregator = StreamAggregator::new(
                &model_id,
                provider.unwrap_or(Provider::Deepseek),
                session.clone(),
                slot.clone(),
                generation,
                callback.clone(),
                self.status.clone(),
            );

            let state = match self.prepare(&model_id, model).await {
                Ok((model, adapter, credentials)) => {
                    if !self.replace_active(session.id(), &model_id, generation, token.clone(), &slot) {
                        // 并发的新分发已经接管，本次直接以取消收尾
                        aggregator.cancel();
                        entries.push(BatchEntry {
                            model_id,
                            generation,
                            slot,
                            state: EntryState::Resolved(aggregator.response().clone()),
                        });
                        continue;
                    }
                    let task = ModelTask {
                        session_id: session.id().to_string(),
                        request: ProviderRequest::from_chat(&request, &model),
                        model,
                        adapter,
                        credentials,
                        token,
                        limiter: self.limiter.clone(),
                        store: self.credentials.clone(),
                        active: self.active.clone(),
                        generation,
                        call_timeout: self.call_timeout,
                    };
                    EntryState::Running(tokio::spawn(task.run(aggregator)))
                }
                Err(error) => {
                    debug!(model_id = %model_id, error = %error, "Model rejected before dispatch");
                    // 旧的活动流同样要被替换
                    self.cancel_active(session.id(), &model_id, generation);
                    aggregator.reject(error);
                    EntryState::Resolved(aggregator.response().clone())
                }
            };

            entries.push(BatchEntry {
                model_id,
                generation,
                slot,
                state,
            });
        }

        Ok(BatchHandle {
            message_id,
            token: batch_token,
            entries,
        })
    }

    /// 分发前的检查：模型、适配器、凭证
    async fn prepare(
        &self,
        model_id: &str,
        model: Option<ModelConfig>,
    ) -> Result<(ModelConfig, Arc<dyn ProviderAdapter>, ApiKeyConfig), ResponseError> {
        let model = model.ok_or_else(|| ResponseError::configuration(format!("Unknown model '{}'", model_id)))?;
        let adapter = self
            .adapters
            .read()
            .await
            .get(&model.provider)
            .cloned()
            .ok_or_else(|| {
                ResponseError::configuration(format!("No adapter registered for provider '{}'", model.provider))
            })?;
        let credentials = self.credentials.get(model.provider).ok_or_else(|| {
            ResponseError::configuration(format!("No API key configured for provider '{}'", model.provider))
        })?;
        Ok((model, adapter, credentials))
    }

    /// 分配 generation 并接管响应单元格
    ///
    /// 两步在活动表的锁内完成，generation 越大的分发越晚接管单元格。
    fn claim(&self, session: &ChatSession, model_id: &str, message_id: &str) -> (u64, Arc<ResponseSlot>) {
        let _active = lock(&self.active);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        (generation, session.claim_cell(model_id, message_id, generation))
    }

    /// 登记活动流并取消被替换的旧流
    ///
    /// 单元格已被更新的分发接管，或活动表里已有更新的流时返回 false，
    /// 此时取消的是自己的令牌。
    fn replace_active(
        &self,
        session_id: &str,
        model_id: &str,
        generation: u64,
        token: CancellationToken,
        slot: &ResponseSlot,
    ) -> bool {
        let key = (session_id.to_string(), model_id.to_string());
        let mut active = lock(&self.active);
        let newer = active.get(&key).is_some_and(|a| a.generation > generation);
        if newer || slot.owner() != generation {
            debug!(
                session_id = %session_id,
                model_id = %model_id,
                generation,
                "Dispatch superseded before it started"
            );
            token.cancel();
            return false;
        }
        let previous = active.insert(key, ActiveStream { generation, token });
        drop(active);
        if let Some(previous) = previous {
            info!(
                session_id = %session_id,
                model_id = %model_id,
                replaced_generation = previous.generation,
                "Replacing in-flight stream"
            );
            previous.token.cancel();
        }
        true
    }

    /// 只取消比 `generation` 更早的活动流
    fn cancel_active(&self, session_id: &str, model_id: &str, generation: u64) {
        let key = (session_id.to_string(), model_id.to_string());
        let mut active = lock(&self.active);
        if active.get(&key).is_some_and(|a| a.generation < generation) {
            if let Some(previous) = active.remove(&key) {
                previous.token.cancel();
            }
        }
    }
}

/// 单个模型的分发任务
struct ModelTask {
    session_id: String,
    model: ModelConfig,
    adapter: Arc<dyn ProviderAdapter>,
    request: ProviderRequest,
    credentials: ApiKeyConfig,
    token: CancellationToken,
    limiter: Arc<ConcurrencyLimiter>,
    store: Arc<CredentialStore>,
    active: ActiveMap,
    generation: u64,
    call_timeout: Duration,
}

impl ModelTask {
    /// 运行到终止，返回这次调用自己的响应
    async fn run(self, mut aggregator: StreamAggregator) -> ModelResponse {
        let provider = self.model.provider;

        let lease = tokio::select! {
            biased;
            _ = self.token.cancelled() => {
                aggregator.cancel();
                self.release();
                return aggregator.response().clone();
            }
            lease = self.limiter.acquire(provider) => lease,
        };
        match lease {
            Ok(lease) => aggregator.attach_lease(lease),
            Err(error) => {
                aggregator.fail(error.into());
                self.release();
                return aggregator.response().clone();
            }
        }
        debug!(model_id = %self.model.id, provider = %provider, "Model call started");

        let mut stream = self.adapter.send(self.request.clone(), self.credentials.clone());
        let deadline = tokio::time::sleep(self.call_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => {
                    aggregator.cancel();
                    break;
                }
                _ = &mut deadline => {
                    let error = AiError::Timeout(self.call_timeout);
                    warn!(model_id = %self.model.id, provider = %provider, "Model call timed out");
                    aggregator.fail(error.into());
                    break;
                }
                next = stream.next() => match next {
                    Some(chunk) => {
                        let verdict = chunk
                            .finished
                            .then(|| chunk.error.as_ref().map(|e| (e.kind, e.status_code)));
                        let done = aggregator.push(chunk);
                        if let Some(verdict) = verdict {
                            self.record_credential(verdict);
                        }
                        if done {
                            break;
                        }
                    }
                    None => {
                        aggregator.fail(ResponseError::protocol("Adapter stream ended without a terminal chunk"));
                        break;
                    }
                },
            }
        }

        // 先关闭连接再移除活动记录
        drop(stream);
        self.release();
        aggregator.response().clone()
    }

    /// 首次调用后记录凭证有效性
    fn record_credential(&self, verdict: Option<(ErrorKind, Option<u16>)>) {
        match verdict {
            None => self.store.mark_validity(self.model.provider, true),
            Some((ErrorKind::Configuration, Some(401 | 403))) => self.store.mark_validity(self.model.provider, false),
            Some(_) => {}
        }
    }

    fn release(&self) {
        let key = (self.session_id.clone(), self.model.id.clone());
        let mut active = lock(&self.active);
        if active.get(&key).is_some_and(|a| a.generation == self.generation) {
            active.remove(&key);
        }
    }
}

enum EntryState {
    Running(JoinHandle<ModelResponse>),
    /// 分发时就已终止（被拒绝或被并发的分发接管）
    Resolved(ModelResponse),
}

struct BatchEntry {
    model_id: String,
    generation: u64,
    slot: Arc<ResponseSlot>,
    state: EntryState,
}

/// 一次分发的句柄
///
/// `progress` 读取的是共享单元格：模型被后续分发替换后，看到的是替换者的状态。
/// `wait` 返回的始终是本批次自己的结果。
pub struct BatchHandle {
    message_id: String,
    token: CancellationToken,
    entries: Vec<BatchEntry>,
}

impl BatchHandle {
    /// 响应矩阵的列键
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn model_ids(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.model_id.as_str()).collect()
    }

    /// 取消批次内所有仍在运行的模型，已终止的响应不受影响
    pub fn cancel(&self) {
        info!(message_id = %self.message_id, "Batch cancelled");
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// 批次级取消令牌，可以在 `wait` 消耗句柄后继续用来取消
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// 各模型单元格当前的快照
    pub fn progress(&self) -> HashMap<String, ModelResponse> {
        self.entries
            .iter()
            .map(|e| (e.model_id.clone(), e.slot.snapshot()))
            .collect()
    }

    /// 所有模型任务都已结束
    pub fn is_finished(&self) -> bool {
        self.entries
            .iter()
            .all(|e| match &e.state {
                EntryState::Running(task) => task.is_finished(),
                EntryState::Resolved(_) => true,
            })
    }

    /// 等待所有模型终止，返回本批次各模型的终止响应
    ///
    /// 被后续分发替换的模型返回其自己的取消结果，而不是替换者仍在加载的单元格。
    pub async fn wait(self) -> HashMap<String, ModelResponse> {
        let mut results = HashMap::with_capacity(self.entries.len());
        for entry in self.entries {
            let response = match entry.state {
                EntryState::Resolved(response) => response,
                EntryState::Running(task) => match task.await {
                    Ok(response) => response,
                    Err(join_error) => {
                        error!(model_id = %entry.model_id, error = %join_error, "Model task aborted");
                        let error = ResponseError::protocol(format!("Model task failed: {}", join_error));
                        Self::aborted(&self.message_id, &entry.model_id, entry.generation, &entry.slot, error)
                    }
                },
            };
            results.insert(entry.model_id, response);
        }
        results
    }

    /// 任务异常结束时的响应：单元格仍归本批次所有时一并写入
    fn aborted(
        message_id: &str,
        model_id: &str,
        generation: u64,
        slot: &ResponseSlot,
        error: ResponseError,
    ) -> ModelResponse {
        slot.update(generation, |response| {
            response.loading = false;
            response.error = Some(error.clone());
        });
        if slot.owner() == generation {
            return slot.snapshot();
        }
        let mut response = ModelResponse::pending(model_id, message_id);
        response.loading = false;
        response.error = Some(error);
        response
    }
}
