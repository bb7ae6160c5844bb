pub mod client;

pub use client::{kimi_adapter, KimiAdapter, KIMI_PROFILE};
