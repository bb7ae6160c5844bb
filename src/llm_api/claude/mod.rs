pub mod client;

pub use client::{claude_adapter, ClaudeAdapter, ClaudeCodec, CLAUDE_BASE_URL};
