//! # 会话与响应矩阵
//!
//! 响应矩阵按 `[model_id][message_id]` 存放 `ModelResponse`。
//! 每个单元格由一个写入者独占：单元格记录当前所有者的 generation，
//! 过期写入者的修改会被拒绝。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use uuid::Uuid;

use crate::llm_api::error::ResponseError;
use crate::models::message::Message;

/// 单个模型对单条消息的响应
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelResponse {
    pub model_id: String,
    pub message_id: String,
    /// 累积正文
    pub content: String,
    /// 累积推理内容
    pub reasoning_content: String,
    pub loading: bool,
    pub is_complete: bool,
    /// 被调用方取消（不算错误）
    #[serde(default)]
    pub cancelled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
    /// 从分发开始到终止的耗时（毫秒）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl ModelResponse {
    /// 分发开始时创建的占位响应
    pub fn pending(model_id: &str, message_id: &str) -> Self {
        Self {
            model_id: model_id.to_string(),
            message_id: message_id.to_string(),
            content: String::new(),
            reasoning_content: String::new(),
            loading: true,
            is_complete: false,
            cancelled: false,
            error: None,
            response_time_ms: None,
            tokens: None,
            cost: None,
            timestamp: Utc::now(),
        }
    }

    /// 完成、出错或被取消后不再变化
    pub fn is_terminal(&self) -> bool {
        !self.loading
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct CellState {
    owner: u64,
    response: ModelResponse,
}

/// 响应矩阵中的一个单元格
pub struct ResponseSlot {
    state: Mutex<CellState>,
}

impl ResponseSlot {
    fn new(owner: u64, response: ModelResponse) -> Self {
        Self {
            state: Mutex::new(CellState { owner, response }),
        }
    }

    /// 当前响应的快照
    pub fn snapshot(&self) -> ModelResponse {
        lock(&self.state).response.clone()
    }

    /// 当前所有者的 generation
    pub fn owner(&self) -> u64 {
        lock(&self.state).owner
    }

    /// 仅当 `owner` 仍是所有者且响应未终止时执行修改，返回是否已应用
    pub(crate) fn update<F>(&self, owner: u64, f: F) -> bool
    where
        F: FnOnce(&mut ModelResponse),
    {
        let mut state = lock(&self.state);
        if state.owner != owner || state.response.is_terminal() {
            return false;
        }
        f(&mut state.response);
        true
    }

    fn reset(&self, owner: u64, response: ModelResponse) {
        let mut state = lock(&self.state);
        state.owner = owner;
        state.response = response;
    }
}

/// 会话级 token / 成本累计
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct SessionTotals {
    pub tokens: u64,
    pub cost: f64,
}

/// 一次对比会话
pub struct ChatSession {
    id: String,
    messages: RwLock<Vec<Message>>,
    responses: RwLock<HashMap<String, HashMap<String, Arc<ResponseSlot>>>>,
    totals: Mutex<SessionTotals>,
}

impl Default for ChatSession {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatSession {
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4().to_string())
    }

    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            messages: RwLock::new(Vec::new()),
            responses: RwLock::new(HashMap::new()),
            totals: Mutex::new(SessionTotals::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// 追加一条已发送的消息
    pub fn push_message(&self, message: Message) {
        self.messages
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message);
    }

    pub fn messages(&self) -> Vec<Message> {
        self.messages
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// 为新的写入者占用单元格：不存在则创建，存在则就地重置并转移所有权
    pub(crate) fn claim_cell(&self, model_id: &str, message_id: &str, owner: u64) -> Arc<ResponseSlot> {
        let pending = ModelResponse::pending(model_id, message_id);
        let mut matrix = self.responses.write().unwrap_or_else(PoisonError::into_inner);
        let row = matrix.entry(model_id.to_string()).or_default();
        match row.get(message_id) {
            Some(slot) => {
                slot.reset(owner, pending);
                slot.clone()
            }
            None => {
                let slot = Arc::new(ResponseSlot::new(owner, pending));
                row.insert(message_id.to_string(), slot.clone());
                slot
            }
        }
    }

    pub fn response(&self, model_id: &str, message_id: &str) -> Option<ModelResponse> {
        let matrix = self.responses.read().unwrap_or_else(PoisonError::into_inner);
        matrix
            .get(model_id)
            .and_then(|row| row.get(message_id))
            .map(|slot| slot.snapshot())
    }

    /// 某条消息下所有模型的响应
    pub fn responses_for_message(&self, message_id: &str) -> HashMap<String, ModelResponse> {
        let matrix = self.responses.read().unwrap_or_else(PoisonError::into_inner);
        matrix
            .iter()
            .filter_map(|(model_id, row)| {
                row.get(message_id)
                    .map(|slot| (model_id.clone(), slot.snapshot()))
            })
            .collect()
    }

    /// 完整响应矩阵的快照
    pub fn response_matrix(&self) -> HashMap<String, HashMap<String, ModelResponse>> {
        let matrix = self.responses.read().unwrap_or_else(PoisonError::into_inner);
        matrix
            .iter()
            .map(|(model_id, row)| {
                let row = row
                    .iter()
                    .map(|(message_id, slot)| (message_id.clone(), slot.snapshot()))
                    .collect();
                (model_id.clone(), row)
            })
            .collect()
    }

    pub fn totals(&self) -> SessionTotals {
        *lock(&self.totals)
    }

    pub(crate) fn add_usage(&self, tokens: Option<u32>, cost: Option<f64>) {
        let mut totals = lock(&self.totals);
        totals.tokens += tokens.unwrap_or(0) as u64;
        totals.cost += cost.unwrap_or(0.0);
    }

    /// 清空消息、响应与累计
    pub fn clear(&self) {
        self.messages
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.responses
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        *lock(&self.totals) = SessionTotals::default();
    }
}
