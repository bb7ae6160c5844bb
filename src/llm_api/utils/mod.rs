pub mod client;
pub mod cumulative;
pub mod openai_compat;
pub mod sse;
