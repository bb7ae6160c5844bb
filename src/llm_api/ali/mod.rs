pub mod client;

pub use client::{aliyun_adapter, AliyunAdapter, DashScopeCodec, DASHSCOPE_BASE_URL};
