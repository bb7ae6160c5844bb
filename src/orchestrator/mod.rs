//! # 多供应商流式编排
//!
//! 分发器把一个请求扇出到多个模型；限流器按供应商限制并发；
//! 聚合器把流式块写入会话的响应矩阵；状态表记录各供应商最近一次调用的健康状况。

pub mod aggregator;
pub mod credentials;
pub mod dispatcher;
pub mod limiter;
pub mod status;

pub use aggregator::{Outcome, StreamAggregator, StreamCallback};
pub use credentials::CredentialStore;
pub use dispatcher::{BatchHandle, DispatchError, Dispatcher, DEFAULT_CALL_TIMEOUT};
pub use limiter::{ConcurrencyLimiter, Lease, LimiterConfig, QueueStatus};
pub use status::{get_service_status, init_status_registry, status_registry, StatusRegistry};
