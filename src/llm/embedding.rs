//! 嵌入 API：调用 OpenAI 兼容的 /embeddings 端点，输出维度固定

use async_openai::config::OpenAIConfig;
use async_openai::types::embeddings::{CreateEmbeddingRequestArgs, EmbeddingInput};
use async_openai::Client;
use async_trait::async_trait;

use crate::core::HiveError;
use crate::llm::openai::openai_config;
use crate::llm::traits::EmbeddingProvider;

/// 使用 async-openai 调用 embeddings API
#[derive(Clone)]
pub struct OpenAiEmbedder {
    client: Client<OpenAIConfig>,
    model: String,
    dimensions: usize,
}

impl OpenAiEmbedder {
    /// 与 LLM 共用 OPENAI_API_KEY / base_url
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>, dimensions: usize) -> Self {
        Self {
            client: Client::with_config(openai_config(base_url, api_key)),
            model: model.to_string(),
            dimensions,
        }
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedder {
    /// 空文本返回空向量（片段可不带嵌入）；返回维度与配置不符时视为传输错误
    async fn embed(&self, text: &str) -> Result<Vec<f32>, HiveError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(vec![]);
        }
        let request = CreateEmbeddingRequestArgs::default()
            .model(&self.model)
            .input(EmbeddingInput::String(text.to_string()))
            .dimensions(self.dimensions as u32)
            .build()
            .map_err(|e| HiveError::Transport(e.to_string()))?;
        let response = self
            .client
            .embeddings()
            .create(request)
            .await
            .map_err(|e| HiveError::Transport(e.to_string()))?;
        let vec = response
            .data
            .into_iter()
            .next()
            .map(|e| e.embedding)
            .unwrap_or_default();
        if vec.len() != self.dimensions {
            return Err(HiveError::Transport(format!(
                "embedding model returned {} dimensions, expected {}",
                vec.len(),
                self.dimensions
            )));
        }
        Ok(vec)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}
