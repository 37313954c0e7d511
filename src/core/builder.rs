//! 引擎构建器：从 AppConfig 统一创建数据库、存储、模型客户端与内置管理器
//!
//! CLI 与集成测试共用同一套初始化逻辑；模型客户端可以注入以便测试。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::engine::{Engine, EngineConfig, EngineParts};
use crate::core::HiveError;
use crate::events::EventBus;
use crate::llm::{EmbeddingProvider, HashEmbedder, LlmClient, MockLlmClient, OpenAiClient, OpenAiEmbedder};
use crate::manager::{BaseManagerConfig, Manager, ManagerId};
use crate::managers::{
    InsightConfig, InsightManager, Personality, PersonalityManager, INSIGHT_MANAGER_ID,
    PERSONALITY_MANAGER_ID,
};
use crate::store::{Actor, Database, FragmentStoreConfig, Session, Stores};

/// 引擎构建器
pub struct EngineBuilder {
    config: AppConfig,
    llm: Option<Arc<dyn LlmClient>>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    personality: Option<Personality>,
}

impl EngineBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            llm: None,
            embedder: None,
            personality: None,
        }
    }

    /// 注入模型客户端（覆盖 llm.provider）
    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_personality(mut self, personality: Personality) -> Self {
        self.personality = Some(personality);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// 构建 LLM 客户端
    pub fn build_llm(&self) -> Arc<dyn LlmClient> {
        if let Some(llm) = &self.llm {
            return Arc::clone(llm);
        }
        let llm = &self.config.llm;
        match llm.provider.as_str() {
            "openai" => Arc::new(OpenAiClient::new(
                llm.base_url.as_deref(),
                &llm.model,
                None,
                Duration::from_secs(llm.timeouts.request),
            )),
            _ => Arc::new(MockLlmClient::new()),
        }
    }

    /// 构建嵌入提供方（维度取 store.embedding_dimensions）
    pub fn build_embedder(&self) -> Arc<dyn EmbeddingProvider> {
        if let Some(embedder) = &self.embedder {
            return Arc::clone(embedder);
        }
        let dims = self.config.store.embedding_dimensions;
        match self.config.llm.provider.as_str() {
            "openai" => Arc::new(OpenAiEmbedder::new(
                self.config.llm.base_url.as_deref(),
                &self.config.llm.embedding_model,
                None,
                dims,
            )),
            _ => Arc::new(HashEmbedder::new(dims)),
        }
    }

    pub fn open_stores(&self) -> Result<Stores, HiveError> {
        let store = &self.config.store;
        let db = Database::open(&store.database_path)?;
        Stores::new(
            db,
            FragmentStoreConfig {
                dimensions: Some(store.embedding_dimensions),
                cache_capacity: store.cache_capacity,
                cache_ttl: store.cache_ttl(),
            },
        )
    }

    fn default_personality(&self) -> Personality {
        Personality {
            name: self.config.app.assistant_name.clone(),
            description: "a thoughtful conversational companion who remembers what matters".into(),
            traits: vec!["curious".into(), "concise".into()],
            ..Default::default()
        }
    }

    /// 校验配置，打开存储，预置助手/用户/会话，创建内置管理器并构造引擎
    pub async fn build(self, cancel: &CancellationToken) -> Result<Engine, HiveError> {
        self.config.validate()?;
        let app = &self.config.app;

        let stores = self.open_stores()?;
        stores
            .actors
            .upsert(&Actor::assistant(&app.assistant_id, &app.assistant_name), cancel)
            .await?;
        stores
            .actors
            .upsert(&Actor::user(&app.user_id, &app.user_name), cancel)
            .await?;
        stores.sessions.upsert(&Session::new(&app.session_id), cancel).await?;

        let parts = EngineParts {
            stores,
            llm: self.build_llm(),
            embedder: self.build_embedder(),
            bus: EventBus::new(),
        };
        let base = |id: &str| BaseManagerConfig {
            id: ManagerId::new(id),
            dependencies: Vec::new(),
            assistant_id: app.assistant_id.clone(),
            assistant_name: app.assistant_name.clone(),
            partition: None,
            stores: parts.stores.clone(),
            llm: Arc::clone(&parts.llm),
            embedder: Arc::clone(&parts.embedder),
            bus: parts.bus.clone(),
        };

        let insight_section = &self.config.managers.insight;
        let insight = InsightManager::new(
            base(INSIGHT_MANAGER_ID),
            InsightConfig {
                session_limit: insight_section.session_limit,
                actor_limit: insight_section.actor_limit,
                relevant_limit: insight_section.relevant_limit,
                maintenance_interval: Duration::from_secs(insight_section.maintenance_interval_secs),
            },
        )?;
        let personality = PersonalityManager::new(
            base(PERSONALITY_MANAGER_ID),
            self.personality.clone().unwrap_or_else(|| self.default_personality()),
        )?;

        let managers: Vec<Arc<dyn Manager>> = vec![Arc::new(insight), Arc::new(personality)];
        Engine::new(
            EngineConfig {
                assistant_id: app.assistant_id.clone(),
                assistant_name: app.assistant_name.clone(),
                recent_interactions: self.config.engine.recent_interactions,
            },
            parts,
            managers,
        )
    }
}

/// 便捷函数：加载配置（失败时回退默认值）并创建构建器
pub fn create_engine_builder(config_path: Option<PathBuf>) -> EngineBuilder {
    let config = crate::config::load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });
    EngineBuilder::new(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.store.database_path = PathBuf::from(":memory:");
        config.store.embedding_dimensions = 32;
        config
    }

    #[tokio::test]
    async fn test_build_registers_identities_and_managers() {
        let cancel = CancellationToken::new();
        let engine = EngineBuilder::new(memory_config()).build(&cancel).await.unwrap();
        assert_eq!(
            engine.manager_order(),
            vec![ManagerId::new("insight"), ManagerId::new("personality")]
        );
        let stores = engine.stores();
        assert!(stores.actors.exists("assistant", &cancel).await.unwrap());
        assert!(stores.actors.exists("user", &cancel).await.unwrap());
        assert!(stores.sessions.exists("session", &cancel).await.unwrap());
    }

    #[tokio::test]
    async fn test_build_rejects_invalid_config() {
        let mut config = memory_config();
        config.store.cache_capacity = 0;
        let result = EngineBuilder::new(config).build(&CancellationToken::new()).await;
        assert!(matches!(result, Err(HiveError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_injected_embedder_must_match_dimensions() {
        let result = EngineBuilder::new(memory_config())
            .with_embedder(Arc::new(HashEmbedder::new(8)))
            .build(&CancellationToken::new())
            .await;
        assert!(matches!(result, Err(HiveError::Configuration(_))));
    }
}
