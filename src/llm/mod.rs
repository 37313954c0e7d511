//! LLM 层：客户端抽象与实现（OpenAI 兼容 / Mock）

pub mod embedding;
pub mod mock;
pub mod openai;
pub mod traits;
pub mod types;

pub use embedding::OpenAiEmbedder;
pub use mock::{HashEmbedder, MockLlmClient};
pub use openai::{OpenAiClient, TokenUsage};
pub use traits::{complete_cancellable, embed_cancellable, EmbeddingProvider, LlmClient, TextStream};
pub use types::{CompletionRequest, Message, Role, ToolDefinition};
