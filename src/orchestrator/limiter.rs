//! # 并发限制
//!
//! 每个供应商一个公平（FIFO）信号量。`acquire` 返回 `Lease`，
//! drop 即归还名额，所以成功、出错、取消、超时任何退出路径都不会泄漏。

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

use crate::llm_api::error::AiError;
use crate::models::provider::Provider;

pub const DEFAULT_MAX_CONCURRENT: usize = 3;

/// 并发配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterConfig {
    pub default_max_concurrent: usize,
    pub per_provider: HashMap<Provider, usize>,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            default_max_concurrent: DEFAULT_MAX_CONCURRENT,
            per_provider: HashMap::new(),
        }
    }
}

impl LimiterConfig {
    pub fn with_capacity(mut self, provider: Provider, capacity: usize) -> Self {
        self.per_provider.insert(provider, capacity);
        self
    }

    /// 容量至少为 1
    pub fn capacity_for(&self, provider: Provider) -> usize {
        self.per_provider
            .get(&provider)
            .copied()
            .unwrap_or(self.default_max_concurrent)
            .max(1)
    }
}

/// 某个供应商的占用快照
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueStatus {
    pub active: usize,
    pub queued: usize,
    pub capacity: usize,
}

struct ProviderQueue {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    active: AtomicUsize,
    queued: AtomicUsize,
}

/// 排队期间计数，获取成功或等待被取消时都会撤销
struct QueuedTicket<'a>(&'a AtomicUsize);

impl Drop for QueuedTicket<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// 一个并发名额
pub struct Lease {
    provider: Provider,
    queue: Arc<ProviderQueue>,
    _permit: OwnedSemaphorePermit,
}

impl Lease {
    pub fn provider(&self) -> Provider {
        self.provider
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.queue.active.fetch_sub(1, Ordering::SeqCst);
        debug!(provider = %self.provider, "Lease released");
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease").field("provider", &self.provider).finish()
    }
}

/// 按供应商限制在途调用数
pub struct ConcurrencyLimiter {
    queues: Vec<Arc<ProviderQueue>>,
}

impl Default for ConcurrencyLimiter {
    fn default() -> Self {
        Self::new(LimiterConfig::default())
    }
}

impl ConcurrencyLimiter {
    pub fn new(config: LimiterConfig) -> Self {
        let queues = Provider::ALL
            .iter()
            .map(|&provider| {
                let capacity = config.capacity_for(provider);
                Arc::new(ProviderQueue {
                    semaphore: Arc::new(Semaphore::new(capacity)),
                    capacity,
                    active: AtomicUsize::new(0),
                    queued: AtomicUsize::new(0),
                })
            })
            .collect();
        info!(default = config.default_max_concurrent, "Concurrency limiter initialized");
        Self { queues }
    }

    fn queue(&self, provider: Provider) -> &Arc<ProviderQueue> {
        &self.queues[provider.index()]
    }

    /// 获取名额；已满时按到达顺序排队。drop 返回的 future 即退出队列
    pub async fn acquire(&self, provider: Provider) -> Result<Lease, AiError> {
        let queue = self.queue(provider);

        let permit = match queue.semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                queue.queued.fetch_add(1, Ordering::SeqCst);
                let _ticket = QueuedTicket(&queue.queued);
                debug!(
                    provider = %provider,
                    queued = queue.queued.load(Ordering::SeqCst),
                    "Provider at capacity, request queued"
                );
                queue
                    .semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| AiError::Internal(format!("Limiter for '{}' is closed", provider)))?
            }
        };

        queue.active.fetch_add(1, Ordering::SeqCst);
        debug!(provider = %provider, active = queue.active.load(Ordering::SeqCst), "Lease granted");
        Ok(Lease {
            provider,
            queue: queue.clone(),
            _permit: permit,
        })
    }

    pub fn queue_status(&self, provider: Provider) -> QueueStatus {
        let queue = self.queue(provider);
        QueueStatus {
            active: queue.active.load(Ordering::SeqCst),
            queued: queue.queued.load(Ordering::SeqCst),
            capacity: queue.capacity,
        }
    }

    /// 所有供应商的占用快照
    pub fn get_queue_status(&self) -> HashMap<Provider, QueueStatus> {
        Provider::ALL
            .iter()
            .map(|&provider| (provider, self.queue_status(provider)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_capacity_plus_two_queue_in_order() {
        let limiter = Arc::new(ConcurrencyLimiter::new(
            LimiterConfig::default().with_capacity(Provider::Kimi, 2),
        ));

        let first = limiter.acquire(Provider::Kimi).await.unwrap();
        let second = limiter.acquire(Provider::Kimi).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut waiters = Vec::new();
        for i in 0..2 {
            let task_limiter = limiter.clone();
            let tx = tx.clone();
            waiters.push(tokio::spawn(async move {
                let lease = task_limiter.acquire(Provider::Kimi).await.unwrap();
                tx.send(i).unwrap();
                tokio::time::sleep(Duration::from_millis(20)).await;
                drop(lease);
            }));
            // 保证到达顺序
            while limiter.queue_status(Provider::Kimi).queued < i + 1 {
                tokio::task::yield_now().await;
            }
        }

        let status = limiter.queue_status(Provider::Kimi);
        assert_eq!((status.active, status.queued, status.capacity), (2, 2, 2));

        drop(first);
        assert_eq!(rx.recv().await, Some(0));
        drop(second);
        assert_eq!(rx.recv().await, Some(1));

        for waiter in waiters {
            waiter.await.unwrap();
        }
        let status = limiter.queue_status(Provider::Kimi);
        assert_eq!((status.active, status.queued), (0, 0));
    }

    #[tokio::test]
    async fn test_dropped_waiter_leaves_queue() {
        let limiter = ConcurrencyLimiter::new(LimiterConfig::default().with_capacity(Provider::Claude, 1));
        let lease = limiter.acquire(Provider::Claude).await.unwrap();

        let mut waiting = tokio_test::task::spawn(limiter.acquire(Provider::Claude));
        tokio_test::assert_pending!(waiting.poll());
        assert_eq!(limiter.queue_status(Provider::Claude).queued, 1);

        drop(waiting);
        assert_eq!(limiter.queue_status(Provider::Claude).queued, 0);

        drop(lease);
        assert_eq!(limiter.queue_status(Provider::Claude).active, 0);
        assert!(limiter.acquire(Provider::Claude).await.is_ok());
    }

    #[test]
    fn test_providers_are_independent() {
        let config = LimiterConfig {
            default_max_concurrent: 0,
            per_provider: HashMap::new(),
        };
        assert_eq!(config.capacity_for(Provider::Deepseek), 1);

        let limiter = ConcurrencyLimiter::default();
        let status = limiter.get_queue_status();
        assert_eq!(status.len(), Provider::COUNT);
        assert_eq!(status[&Provider::Aliyun].capacity, DEFAULT_MAX_CONCURRENT);
    }
}
