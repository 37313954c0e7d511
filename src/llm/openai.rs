//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）。工具定义以 JSON Schema
//! 追加到 system 提示中。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequest, CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;
use futures_util::StreamExt;

use crate::core::HiveError;
use crate::llm::traits::{LlmClient, TextStream};
use crate::llm::types::{CompletionRequest, Message, Role};

/// Token 使用统计（累计值）
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Arc<AtomicU64>,
    pub completion_tokens: Arc<AtomicU64>,
    pub total_tokens: Arc<AtomicU64>,
}

impl TokenUsage {
    pub fn add(&self, prompt: u64, completion: u64) {
        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion, Ordering::Relaxed);
        self.total_tokens.fetch_add(prompt + completion, Ordering::Relaxed);
    }

    pub fn get(&self) -> (u64, u64, u64) {
        (
            self.prompt_tokens.load(Ordering::Relaxed),
            self.completion_tokens.load(Ordering::Relaxed),
            self.total_tokens.load(Ordering::Relaxed),
        )
    }
}

pub(crate) fn openai_config(base_url: Option<&str>, api_key: Option<&str>) -> OpenAIConfig {
    let api_key = api_key
        .map(String::from)
        .or_else(|| std::env::var("OPENAI_API_KEY").ok())
        .unwrap_or_else(|| "sk-placeholder".to_string());
    match base_url {
        Some(url) => OpenAIConfig::new().with_api_base(url).with_api_key(api_key),
        None => OpenAIConfig::new().with_api_key(api_key),
    }
}

/// OpenAI 兼容客户端
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    model: String,
    timeout: Duration,
    pub usage: TokenUsage,
}

impl OpenAiClient {
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>, timeout: Duration) -> Self {
        Self {
            client: Client::with_config(openai_config(base_url, api_key)),
            model: model.to_string(),
            timeout,
            usage: TokenUsage::default(),
        }
    }

    fn build_request(
        &self,
        request: &CompletionRequest,
    ) -> Result<CreateChatCompletionRequest, HiveError> {
        CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(self.to_openai_messages(request)?)
            .build()
            .map_err(|e| HiveError::Transport(e.to_string()))
    }

    fn to_openai_messages(
        &self,
        request: &CompletionRequest,
    ) -> Result<Vec<ChatCompletionRequestMessage>, HiveError> {
        let mut messages: Vec<Message> = request.messages.clone();
        if let Some(section) = request.tool_schema_section() {
            match messages.iter_mut().find(|m| m.role == Role::System) {
                Some(system) => system.content = format!("{}\n\n{section}", system.content),
                None => messages.insert(0, Message::system(section)),
            }
        }

        messages
            .into_iter()
            .map(|m| {
                let built = match m.role {
                    Role::System => ChatCompletionRequestSystemMessageArgs::default()
                        .content(m.content)
                        .build()
                        .map(ChatCompletionRequestMessage::System),
                    Role::User => ChatCompletionRequestUserMessageArgs::default()
                        .content(m.content)
                        .build()
                        .map(ChatCompletionRequestMessage::User),
                    Role::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
                        .content(m.content)
                        .build()
                        .map(ChatCompletionRequestMessage::Assistant),
                };
                built.map_err(|e| HiveError::Transport(e.to_string()))
            })
            .collect()
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.get()
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String, HiveError> {
        let api_request = self.build_request(request)?;

        let response = tokio::time::timeout(self.timeout, self.client.chat().create(api_request))
            .await
            .map_err(|_| HiveError::Transport(format!("request timed out after {:?}", self.timeout)))?
            .map_err(|e| HiveError::Transport(e.to_string()))?;

        if let Some(usage) = &response.usage {
            self.usage
                .add(usage.prompt_tokens as u64, usage.completion_tokens as u64);
        }

        Ok(response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default())
    }

    /// 流式接口：每个增量的 delta.content 作为一个片段，空增量跳过
    async fn complete_stream(&self, request: &CompletionRequest) -> Result<TextStream, HiveError> {
        let api_request = self.build_request(request)?;
        let upstream = tokio::time::timeout(self.timeout, self.client.chat().create_stream(api_request))
            .await
            .map_err(|_| HiveError::Transport(format!("request timed out after {:?}", self.timeout)))?
            .map_err(|e| HiveError::Transport(e.to_string()))?;

        let chunks = upstream.filter_map(|item| async move {
            match item {
                Ok(response) => response
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|c| c.delta.content)
                    .filter(|text| !text.is_empty())
                    .map(Ok),
                Err(e) => Some(Err(HiveError::Transport(e.to_string()))),
            }
        });
        Ok(Box::pin(chunks))
    }
}
