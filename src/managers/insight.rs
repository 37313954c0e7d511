//! 洞察管理器
//!
//! Context：本会话洞察、该用户的洞察、该用户与输入相似的历史发言（跨会话，不含其他用户）。
//! PostProcess：让模型从本轮对话中提炼洞察（每行 `- ` 开头），逐条写入洞察分区并发布 `insight.created`。
//! 后台：定期清理过期的查询缓存条目。

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::core::background::{BackgroundSlot, BackgroundTask};
use crate::core::state::{State, StateData};
use crate::core::HiveError;
use crate::llm::{complete_cancellable, embed_cancellable, CompletionRequest, Message};
use crate::manager::{BaseManager, BaseManagerConfig, Manager, ManagerId};
use crate::store::{Fragment, FragmentFilter, FragmentStore, MetadataCondition, Partition};

pub const INSIGHT_MANAGER_ID: &str = "insight";
pub const INSIGHT_CREATED: &str = "insight.created";

pub const SESSION_INSIGHTS: &str = "session_insights";
pub const ACTOR_INSIGHTS: &str = "actor_insights";
pub const RELEVANT_INTERACTIONS: &str = "relevant_interactions";

const EXTRACTION_PROMPT: &str = "You extract durable insights about the user from a conversation exchange. \
Reply with one insight per line, each line starting with \"- \". \
Reply with nothing if the exchange reveals nothing worth remembering.";

/// 检索条数与维护间隔
#[derive(Debug, Clone)]
pub struct InsightConfig {
    pub session_limit: usize,
    pub actor_limit: usize,
    pub relevant_limit: usize,
    pub maintenance_interval: Duration,
}

impl Default for InsightConfig {
    fn default() -> Self {
        Self {
            session_limit: 10,
            actor_limit: 10,
            relevant_limit: 5,
            maintenance_interval: Duration::from_secs(60),
        }
    }
}

pub struct InsightManager {
    base: BaseManager,
    insights: FragmentStore,
    config: InsightConfig,
    maintenance: BackgroundSlot,
}

impl InsightManager {
    /// 分区固定为 insight
    pub fn new(mut base: BaseManagerConfig, config: InsightConfig) -> Result<Self, HiveError> {
        if config.maintenance_interval.is_zero() {
            return Err(HiveError::configuration("insight maintenance interval must be positive"));
        }
        base.partition = Some(Partition::Insight);
        let base = BaseManager::new(base)?;
        let insights = base
            .fragments()
            .cloned()
            .ok_or_else(|| HiveError::configuration("insight partition unavailable"))?;
        Ok(Self {
            base,
            insights,
            config,
            maintenance: BackgroundSlot::new(),
        })
    }

    pub fn insights(&self) -> &FragmentStore {
        &self.insights
    }

    pub fn is_maintenance_running(&self) -> bool {
        self.maintenance.is_running()
    }
}

/// 提取 `- ` 开头的行
pub fn parse_insights(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|line| line.trim().strip_prefix("- "))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[async_trait]
impl Manager for InsightManager {
    fn id(&self) -> ManagerId {
        self.base.id()
    }

    fn dependencies(&self) -> Vec<ManagerId> {
        self.base.dependencies()
    }

    async fn context(&self, state: &State) -> Result<Vec<StateData>, HiveError> {
        let cancel = state.cancel_token();

        let session_filter = FragmentFilter::new()
            .session(&state.session_id)
            .condition(MetadataCondition::equals("scope", json!("session")))
            .limit(self.config.session_limit);
        let session_insights = self.insights.query(&session_filter, cancel).await?;

        let actor_filter = FragmentFilter::new()
            .actor(&state.actor_id)
            .limit(self.config.actor_limit);
        let actor_insights = self.insights.query(&actor_filter, cancel).await?;

        let mut relevant = Vec::new();
        if !state.input.embedding.is_empty() && self.config.relevant_limit > 0 {
            let recent: HashSet<&str> = state
                .recent_interactions
                .iter()
                .map(|f| f.id.as_str())
                .collect();
            let filter = FragmentFilter::new()
                .actor(&state.actor_id)
                .similar_to(state.input.embedding.clone())
                .limit(self.config.relevant_limit + recent.len());
            relevant = self
                .base
                .stores
                .interactions
                .query(&filter, cancel)
                .await?
                .into_iter()
                .filter(|f| !recent.contains(f.id.as_str()) && f.id != state.input.id)
                .take(self.config.relevant_limit)
                .collect();
        }

        tracing::debug!(
            session = %state.session_id,
            session_insights = session_insights.len(),
            actor_insights = actor_insights.len(),
            relevant = relevant.len(),
            "insight context"
        );
        Ok(vec![
            StateData::fragments(SESSION_INSIGHTS, session_insights),
            StateData::fragments(ACTOR_INSIGHTS, actor_insights),
            StateData::fragments(RELEVANT_INTERACTIONS, relevant),
        ])
    }

    async fn post_process(&self, state: &State) -> Result<(), HiveError> {
        let Some(response) = state.response() else {
            return Ok(());
        };
        let cancel = state.cancel_token();
        let request = CompletionRequest::new(vec![
            Message::system(EXTRACTION_PROMPT),
            Message::user(format!(
                "User: {}\n{}: {}",
                state.input.content, self.base.assistant_name, response.content
            )),
        ]);
        let reply = complete_cancellable(self.base.llm.as_ref(), &request, cancel).await?;

        for insight in parse_insights(&reply) {
            let embedding = embed_cancellable(self.base.embedder.as_ref(), &insight, cancel).await?;
            let fragment = Fragment::new(&state.actor_id, &state.session_id, insight)
                .with_embedding(embedding)
                .with_metadata("scope", json!("session"))
                .with_metadata("source_fragment", json!(response.id));
            let stored = self.store(fragment, cancel).await?;
            self.base.trigger_event(
                INSIGHT_CREATED,
                json!({
                    "fragment_id": stored.id,
                    "session_id": stored.session_id,
                    "actor_id": stored.actor_id,
                    "content": stored.content,
                }),
            );
        }
        Ok(())
    }

    fn fragment_store(&self) -> Option<&FragmentStore> {
        Some(&self.insights)
    }

    async fn start_background_processes(&self) -> Result<(), HiveError> {
        let insights = self.insights.clone();
        let interactions = self.base.stores.interactions.clone();
        let interval = self.config.maintenance_interval;
        self.maintenance.start_with(|| {
            BackgroundTask::periodic("insight-maintenance", interval, move |_| {
                let purged = insights.purge_expired_cache() + interactions.purge_expired_cache();
                if purged > 0 {
                    tracing::debug!(purged, "expired cache entries purged");
                }
                std::future::ready(())
            })
        });
        Ok(())
    }

    async fn stop_background_processes(&self) -> Result<(), HiveError> {
        self.maintenance.stop().await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_insights() {
        let text = "Here you go:\n- likes tea\n  - works nights  \n-\n- \nnot a bullet\n";
        assert_eq!(parse_insights(text), vec!["likes tea", "works nights"]);
        assert!(parse_insights("Echo from Mock: hello").is_empty());
    }
}
