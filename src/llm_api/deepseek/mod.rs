pub mod client;

pub use client::{deepseek_adapter, DeepseekAdapter, DEEPSEEK_PROFILE};
