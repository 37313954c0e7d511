//! Mock 模型客户端与哈希嵌入器（用于测试与无 API Key 时的本地运行）
//!
//! MockLlmClient 先按顺序返回预置回复，用完后回显最后一条用户消息；HashEmbedder 用词袋哈希生成
//! 确定性的归一化向量，相同文本总是得到相同向量。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use futures_util::stream;
use parking_lot::Mutex;

use crate::core::HiveError;
use crate::llm::traits::{EmbeddingProvider, LlmClient, TextStream};
use crate::llm::types::CompletionRequest;

/// Mock 客户端
#[derive(Debug, Default)]
pub struct MockLlmClient {
    scripted: Mutex<VecDeque<Result<String, String>>>,
    calls: AtomicUsize,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 预置回复，按调用顺序消费
    pub fn with_responses<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let client = Self::default();
        client
            .scripted
            .lock()
            .extend(responses.into_iter().map(|s| Ok(s.into())));
        client
    }

    /// 追加一次失败（TransportError）
    pub fn push_failure(&self, message: impl Into<String>) {
        self.scripted.lock().push_back(Err(message.into()));
    }

    pub fn push_response(&self, response: impl Into<String>) {
        self.scripted.lock().push_back(Ok(response.into()));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// 收到的全部请求（按顺序）
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, HiveError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.clone());
        if let Some(next) = self.scripted.lock().pop_front() {
            return next.map_err(HiveError::Transport);
        }
        let last_user = request.last_user_message().unwrap_or("(no input)");
        Ok(format!("Echo from Mock: {last_user}"))
    }

    async fn complete_stream(&self, request: &CompletionRequest) -> Result<TextStream, HiveError> {
        let content = self.complete(request).await?;
        let mut chunks: Vec<Result<String, HiveError>> = Vec::new();
        for (i, word) in content.split(' ').enumerate() {
            let chunk = if i == 0 { word.to_string() } else { format!(" {word}") };
            chunks.push(Ok(chunk));
        }
        Ok(Box::pin(stream::iter(chunks)))
    }
}

/// 词袋哈希嵌入器
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimensions: usize,
}

impl HashEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dimensions];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let idx = (fnv1a(&token.to_lowercase()) % self.dimensions as u64) as usize;
            v[idx] += 1.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

fn fnv1a(s: &str) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in s.bytes() {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, HiveError> {
        Ok(self.embed_text(text))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}
