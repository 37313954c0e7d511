//! 人格管理器：向上下文提供 `base_personality`，首次后处理时把人格档案写入 personality 分区，
//! 并订阅 `insight.created` 统计观察到的洞察数。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::OnceCell;

use crate::core::state::{State, StateData};
use crate::core::HiveError;
use crate::events::{EventBus, SubscriptionId};
use crate::llm::embed_cancellable;
use crate::manager::{BaseManager, BaseManagerConfig, Manager, ManagerId};
use crate::managers::insight::INSIGHT_CREATED;
use crate::store::{Fragment, FragmentFilter, FragmentStore, MetadataCondition, Partition};

pub const PERSONALITY_MANAGER_ID: &str = "personality";
pub const BASE_PERSONALITY: &str = "base_personality";

/// 人格档案
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Personality {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub style: Vec<String>,
    #[serde(default)]
    pub traits: Vec<String>,
    #[serde(default)]
    pub background: Vec<String>,
    #[serde(default)]
    pub expertise: Vec<String>,
    #[serde(default)]
    pub message_examples: Vec<String>,
}

impl Personality {
    /// 渲染为提示文本；空列表不输出对应小节
    pub fn render(&self) -> String {
        let mut out = format!("Name: {}\nDescription: {}\n", self.name, self.description);
        let sections = [
            ("Style", &self.style),
            ("Traits", &self.traits),
            ("Background", &self.background),
            ("Expertise", &self.expertise),
            ("Message examples", &self.message_examples),
        ];
        for (title, items) in sections {
            if items.is_empty() {
                continue;
            }
            out.push_str(&format!("\n{title}:\n"));
            for item in items {
                out.push_str(&format!("- {item}\n"));
            }
        }
        out
    }
}

pub struct PersonalityManager {
    base: BaseManager,
    personality: Personality,
    profiles: FragmentStore,
    profile_stored: OnceCell<()>,
    observed_insights: Arc<AtomicUsize>,
    subscription: parking_lot::Mutex<Option<SubscriptionId>>,
}

impl PersonalityManager {
    /// 分区固定为 personality
    pub fn new(mut base: BaseManagerConfig, personality: Personality) -> Result<Self, HiveError> {
        if personality.name.trim().is_empty() {
            return Err(HiveError::configuration("personality name is empty"));
        }
        base.partition = Some(Partition::Personality);
        let base = BaseManager::new(base)?;
        let profiles = base
            .fragments()
            .cloned()
            .ok_or_else(|| HiveError::configuration("personality partition unavailable"))?;
        Ok(Self {
            base,
            personality,
            profiles,
            profile_stored: OnceCell::new(),
            observed_insights: Arc::new(AtomicUsize::new(0)),
            subscription: parking_lot::Mutex::new(None),
        })
    }

    pub fn personality(&self) -> &Personality {
        &self.personality
    }

    /// 已观察到的 `insight.created` 事件数
    pub fn observed_insights(&self) -> usize {
        self.observed_insights.load(Ordering::SeqCst)
    }

    /// 档案已存在则跳过，否则以当前会话写入一次
    async fn ensure_profile(&self, state: &State) -> Result<(), HiveError> {
        self.profile_stored
            .get_or_try_init(|| async {
                let cancel = state.cancel_token();
                let filter = FragmentFilter::new()
                    .actor(&self.base.assistant_id)
                    .condition(MetadataCondition::equals("kind", json!("profile")))
                    .condition(MetadataCondition::equals("name", json!(self.personality.name)))
                    .limit(1);
                if self.profiles.query(&filter, cancel).await?.is_empty() {
                    let content = self.personality.render();
                    let embedding =
                        embed_cancellable(self.base.embedder.as_ref(), &content, cancel).await?;
                    let fragment = Fragment::new(&self.base.assistant_id, &state.session_id, content)
                        .with_embedding(embedding)
                        .with_metadata("kind", json!("profile"))
                        .with_metadata("name", json!(self.personality.name));
                    self.store(fragment, cancel).await?;
                    tracing::info!(name = %self.personality.name, "personality profile stored");
                }
                Ok::<(), HiveError>(())
            })
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl Manager for PersonalityManager {
    fn id(&self) -> ManagerId {
        self.base.id()
    }

    fn dependencies(&self) -> Vec<ManagerId> {
        self.base.dependencies()
    }

    async fn context(&self, _state: &State) -> Result<Vec<StateData>, HiveError> {
        Ok(vec![StateData::text(BASE_PERSONALITY, self.personality.render())])
    }

    async fn post_process(&self, state: &State) -> Result<(), HiveError> {
        self.ensure_profile(state).await
    }

    fn fragment_store(&self) -> Option<&FragmentStore> {
        Some(&self.profiles)
    }

    fn register_event_handlers(&self, bus: &EventBus) {
        let mut subscription = self.subscription.lock();
        if subscription.is_some() {
            return;
        }
        let observed = Arc::clone(&self.observed_insights);
        *subscription = Some(bus.register(INSIGHT_CREATED, move |_event| {
            observed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
    }
}
