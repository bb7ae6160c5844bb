//! # 供应商健康状态
//!
//! 每个供应商一个原子状态，按最近一次调用结果整体替换：
//! 失败立即标记为不健康，下一次成功立即恢复，没有平滑窗口。
//! 取消和分发前就失败的配置错误不算调用，不会上报。

use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::models::provider::Provider;

const UNKNOWN: u8 = 0;
const HEALTHY: u8 = 1;
const UNHEALTHY: u8 = 2;

/// 供应商健康状态表
#[derive(Debug, Default)]
pub struct StatusRegistry {
    states: [AtomicU8; Provider::COUNT],
}

impl StatusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report_success(&self, provider: Provider) {
        let previous = self.states[provider.index()].swap(HEALTHY, Ordering::SeqCst);
        if previous == UNHEALTHY {
            info!(provider = %provider, "Provider recovered");
        }
    }

    pub fn report_failure(&self, provider: Provider) {
        let previous = self.states[provider.index()].swap(UNHEALTHY, Ordering::SeqCst);
        if previous != UNHEALTHY {
            warn!(provider = %provider, "Provider marked unhealthy");
        }
    }

    /// 未被调用过的供应商返回 None
    pub fn is_healthy(&self, provider: Provider) -> Option<bool> {
        match self.states[provider.index()].load(Ordering::SeqCst) {
            HEALTHY => Some(true),
            UNHEALTHY => Some(false),
            _ => None,
        }
    }

    /// provider → 是否健康；只包含已有调用结果的供应商
    pub fn get_service_status(&self) -> HashMap<Provider, bool> {
        Provider::ALL
            .iter()
            .filter_map(|&provider| self.is_healthy(provider).map(|healthy| (provider, healthy)))
            .collect()
    }

    /// 清空所有状态
    pub fn reset(&self) {
        for state in &self.states {
            state.store(UNKNOWN, Ordering::SeqCst);
        }
    }
}

static STATUS_REGISTRY: OnceCell<Arc<StatusRegistry>> = OnceCell::new();

/// 初始化进程级状态表，重复调用返回同一个实例
pub fn init_status_registry() -> Arc<StatusRegistry> {
    STATUS_REGISTRY
        .get_or_init(|| {
            info!("Service status registry initialized");
            Arc::new(StatusRegistry::new())
        })
        .clone()
}

/// 进程级状态表；未初始化时返回 None
pub fn status_registry() -> Option<Arc<StatusRegistry>> {
    STATUS_REGISTRY.get().cloned()
}

/// 进程级的服务状态快照，未初始化时为空
pub fn get_service_status() -> HashMap<Provider, bool> {
    status_registry()
        .map(|registry| registry.get_service_status())
        .unwrap_or_default()
}
