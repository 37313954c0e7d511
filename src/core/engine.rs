//! 引擎：持有按依赖排序的管理器与存储，驱动单轮生命周期
//!
//! NewState → Process（全部 Process，再全部 Context，然后写入输入片段）→ 外部组装请求 →
//! GenerateResponse → PostProcess（写入回复片段、逐个 PostProcess、发布事件）。
//! 同一轮内钩子严格串行；不同会话的回合可以并发。

use std::sync::Arc;

use futures_util::StreamExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::core::error::PipelineStage;
use crate::core::prompt::PromptBuilder;
use crate::core::resolver::resolve_order;
use crate::core::state::{State, TurnPhase};
use crate::core::HiveError;
use crate::events::{EventBus, EventData};
use crate::llm::{complete_cancellable, embed_cancellable, CompletionRequest, EmbeddingProvider, LlmClient};
use crate::manager::{Manager, ManagerId};
use crate::store::{Fragment, FragmentFilter, Stores};

/// 引擎发布的事件类型
pub const INTERACTION_STORED: &str = "interaction.stored";

/// 引擎配置
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub assistant_id: String,
    pub assistant_name: String,
    /// NewState 载入的近期交互条数
    pub recent_interactions: usize,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), HiveError> {
        if self.assistant_id.trim().is_empty() {
            return Err(HiveError::configuration("engine assistant_id is empty"));
        }
        if self.assistant_name.trim().is_empty() {
            return Err(HiveError::configuration("engine assistant_name is empty"));
        }
        Ok(())
    }
}

/// 引擎依赖的外部协作者
#[derive(Clone)]
pub struct EngineParts {
    pub stores: Stores,
    pub llm: Arc<dyn LlmClient>,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub bus: EventBus,
}

/// PostProcess 结果：回复已落库，`warnings` 为各管理器的非致命失败
#[derive(Debug)]
pub struct PostProcessReport {
    pub response: Fragment,
    pub warnings: Vec<HiveError>,
}

impl PostProcessReport {
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

pub struct Engine {
    config: EngineConfig,
    parts: EngineParts,
    /// 已按依赖排序
    managers: Vec<Arc<dyn Manager>>,
    source: ManagerId,
}

impl Engine {
    /// 校验配置、解析管理器顺序并注册事件处理器；依赖有环时不产生引擎
    pub fn new(
        config: EngineConfig,
        parts: EngineParts,
        managers: Vec<Arc<dyn Manager>>,
    ) -> Result<Self, HiveError> {
        config.validate()?;
        if let Some(dims) = parts.stores.fragment_config().dimensions {
            if dims != parts.embedder.dimensions() {
                return Err(HiveError::configuration(format!(
                    "embedder produces {} dimensions, store expects {dims}",
                    parts.embedder.dimensions()
                )));
            }
        }

        let nodes: Vec<(ManagerId, Vec<ManagerId>)> = managers
            .iter()
            .map(|m| (m.id(), m.dependencies()))
            .collect();
        let order = resolve_order(&nodes)?;
        let mut slots: Vec<Option<Arc<dyn Manager>>> = managers.into_iter().map(Some).collect();
        let managers: Vec<Arc<dyn Manager>> = order
            .into_iter()
            .filter_map(|i| slots[i].take())
            .collect();

        for manager in &managers {
            manager.register_event_handlers(&parts.bus);
        }

        tracing::info!(
            assistant = %config.assistant_id,
            order = %managers.iter().map(|m| m.id().to_string()).collect::<Vec<_>>().join(" -> "),
            "engine constructed"
        );
        Ok(Self {
            config,
            parts,
            managers,
            source: ManagerId::new("engine"),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn stores(&self) -> &Stores {
        &self.parts.stores
    }

    pub fn bus(&self) -> &EventBus {
        &self.parts.bus
    }

    /// 解析后的执行顺序
    pub fn manager_order(&self) -> Vec<ManagerId> {
        self.managers.iter().map(|m| m.id()).collect()
    }

    /// 以助手身份预置名称的提示构建器
    pub fn prompt_builder(&self) -> PromptBuilder {
        PromptBuilder::new(&self.config.assistant_id, &self.config.assistant_name)
    }

    /// 新建一轮：校验参与者与会话存在，载入近期交互，嵌入输入
    pub async fn new_state(
        &self,
        actor_id: &str,
        session_id: &str,
        input: &str,
        cancel: CancellationToken,
    ) -> Result<State, HiveError> {
        let stores = &self.parts.stores;
        if !stores.actors.exists(actor_id, &cancel).await? {
            return Err(HiveError::ActorNotFound(actor_id.to_string()));
        }
        if !stores.sessions.exists(session_id, &cancel).await? {
            return Err(HiveError::SessionNotFound(session_id.to_string()));
        }

        let filter = FragmentFilter::new()
            .session(session_id)
            .limit(self.config.recent_interactions);
        let mut recent = stores.interactions.query(&filter, &cancel).await?;
        recent.reverse();

        let embedding = embed_cancellable(self.parts.embedder.as_ref(), input, &cancel).await?;
        let fragment = Fragment::new(actor_id, session_id, input).with_embedding(embedding);
        tracing::debug!(actor = actor_id, session = session_id, recent = recent.len(), "state created");
        Ok(State::new(fragment, recent, cancel))
    }

    /// 按顺序执行全部 Process，再全部 Context；任一失败即中止，不写入任何片段
    pub async fn process(&self, state: &mut State) -> Result<(), HiveError> {
        state.ensure_phase(TurnPhase::Created)?;

        for manager in &self.managers {
            check_cancelled(state)?;
            tracing::debug!(manager = %manager.id(), "process");
            manager
                .process(state)
                .await
                .map_err(|e| pipeline_error(manager.id(), PipelineStage::Process, e))?;
        }

        for manager in &self.managers {
            check_cancelled(state)?;
            tracing::debug!(manager = %manager.id(), "context");
            let contributions = manager
                .context(state)
                .await
                .map_err(|e| pipeline_error(manager.id(), PipelineStage::Context, e))?;
            state.merge(contributions);
        }

        let stored = self
            .parts
            .stores
            .interactions
            .store(state.input.clone(), state.cancel_token())
            .await?;
        self.publish_stored(&stored);
        state.input = stored;
        state.advance(TurnPhase::Processed);
        Ok(())
    }

    /// 调用模型生成回复片段（尚未落库）；失败时保持 Processed，调用方可重试
    pub async fn generate_response(
        &self,
        state: &mut State,
        request: &CompletionRequest,
    ) -> Result<Fragment, HiveError> {
        state.ensure_phase(TurnPhase::Processed)?;
        let content =
            complete_cancellable(self.parts.llm.as_ref(), request, state.cancel_token()).await?;
        self.finish_response(state, content).await
    }

    /// 流式生成：每个片段交给 `on_chunk`，片段之间检查取消
    pub async fn generate_streaming_response<F>(
        &self,
        state: &mut State,
        request: &CompletionRequest,
        mut on_chunk: F,
    ) -> Result<Fragment, HiveError>
    where
        F: FnMut(&str) + Send,
    {
        state.ensure_phase(TurnPhase::Processed)?;
        let cancel = state.cancel_token().clone();
        let mut stream = tokio::select! {
            _ = cancel.cancelled() => return Err(HiveError::Cancelled),
            stream = self.parts.llm.complete_stream(request) => stream?,
        };

        let mut content = String::new();
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Err(HiveError::Cancelled),
                next = stream.next() => next,
            };
            match next {
                Some(chunk) => {
                    let chunk = chunk?;
                    on_chunk(&chunk);
                    content.push_str(&chunk);
                }
                None => break,
            }
        }
        self.finish_response(state, content).await
    }

    async fn finish_response(&self, state: &mut State, content: String) -> Result<Fragment, HiveError> {
        let embedding =
            embed_cancellable(self.parts.embedder.as_ref(), &content, state.cancel_token()).await?;
        let response = Fragment::new(&self.config.assistant_id, &state.session_id, content)
            .with_embedding(embedding);
        state.advance(TurnPhase::Responded);
        Ok(response)
    }

    /// 写入回复片段，然后逐个执行 PostProcess；管理器失败只作为告警返回，不回滚已写入的片段
    pub async fn post_process(
        &self,
        response: Fragment,
        state: &mut State,
    ) -> Result<PostProcessReport, HiveError> {
        state.ensure_phase(TurnPhase::Responded)?;
        if response.session_id != state.session_id {
            return Err(HiveError::validation(format!(
                "response belongs to session {}, turn is for {}",
                response.session_id, state.session_id
            )));
        }

        let stored = self
            .parts
            .stores
            .interactions
            .store(response, state.cancel_token())
            .await?;
        state.set_response(stored.clone());

        let mut warnings = Vec::new();
        for manager in &self.managers {
            tracing::debug!(manager = %manager.id(), "post-process");
            if let Err(e) = manager.post_process(state).await {
                tracing::warn!(manager = %manager.id(), error = %e, "post-process failed");
                warnings.push(HiveError::PostProcess {
                    manager: manager.id(),
                    source: Box::new(e),
                });
            }
        }

        self.publish_stored(&stored);
        state.advance(TurnPhase::PostProcessed);
        Ok(PostProcessReport {
            response: stored,
            warnings,
        })
    }

    /// 按顺序启动全部后台任务
    pub async fn start_background_processes(&self) -> Result<(), HiveError> {
        for manager in &self.managers {
            manager.start_background_processes().await?;
        }
        Ok(())
    }

    /// 逆序停止全部后台任务并等待退出；单个失败不影响其余管理器，返回第一个错误
    pub async fn stop_background_processes(&self) -> Result<(), HiveError> {
        let mut first_error = None;
        for manager in self.managers.iter().rev() {
            if let Err(e) = manager.stop_background_processes().await {
                tracing::warn!(manager = %manager.id(), error = %e, "failed to stop background processes");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn publish_stored(&self, fragment: &Fragment) {
        let event = EventData::new(
            INTERACTION_STORED,
            json!({
                "fragment_id": fragment.id,
                "session_id": fragment.session_id,
                "actor_id": fragment.actor_id,
            }),
            self.source.clone(),
        );
        self.parts.bus.trigger(&event);
    }
}

fn check_cancelled(state: &State) -> Result<(), HiveError> {
    if state.cancel_token().is_cancelled() {
        return Err(HiveError::Cancelled);
    }
    Ok(())
}

/// 取消不包装为管线错误
fn pipeline_error(manager: ManagerId, stage: PipelineStage, source: HiveError) -> HiveError {
    match source {
        HiveError::Cancelled => HiveError::Cancelled,
        source => HiveError::Pipeline {
            manager,
            stage,
            source: Box::new(source),
        },
    }
}
