pub mod chat;
pub mod credential;
pub mod message;
pub mod provider;
pub mod session;

pub use chat::{ChatRequest, StreamChunk};
pub use credential::ApiKeyConfig;
pub use message::{Message, Role};
pub use provider::{ModelConfig, Provider, DEFAULT_MODELS};
pub use session::{ChatSession, ModelResponse, SessionTotals};
