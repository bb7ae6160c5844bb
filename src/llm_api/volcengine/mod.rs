pub mod client;

pub use client::{volcengine_adapter, VolcengineAdapter, VOLCENGINE_PROFILE};
