//! 模型提供方抽象
//!
//! 补全（非流式 / 流式）与嵌入。取消由调用方通过 `complete_cancellable` 统一处理：丢弃 future 即中止请求。

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use tokio_util::sync::CancellationToken;

use crate::core::HiveError;
use crate::llm::types::CompletionRequest;

/// 文本片段流
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, HiveError>> + Send>>;

/// LLM 客户端 trait：非流式完成与流式完成（返回文本片段流）
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, HiveError>;

    async fn complete_stream(&self, request: &CompletionRequest) -> Result<TextStream, HiveError>;

    /// 累计 token 使用：(prompt, completion, total)
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}

/// 嵌入提供方：输出固定维度向量
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, HiveError>;

    fn dimensions(&self) -> usize;
}

/// 带取消的补全
pub async fn complete_cancellable(
    llm: &dyn LlmClient,
    request: &CompletionRequest,
    cancel: &CancellationToken,
) -> Result<String, HiveError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(HiveError::Cancelled),
        result = llm.complete(request) => result,
    }
}

/// 带取消的嵌入
pub async fn embed_cancellable(
    embedder: &dyn EmbeddingProvider,
    text: &str,
    cancel: &CancellationToken,
) -> Result<Vec<f32>, HiveError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(HiveError::Cancelled),
        result = embedder.embed(text) => result,
    }
}
