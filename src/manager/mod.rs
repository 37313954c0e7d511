//! 管理器契约
//!
//! 管理器是参与回合管线的可插拔单元：声明依赖、在 Process / Context / PostProcess 阶段读写 State，
//! 通过自有分区持久化片段，并可拥有后台任务。所有钩子都有默认空实现，具体管理器只需覆盖关心的部分。
//! 管理器之间不直接引用，只通过事件总线通信。

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::core::state::{State, StateData};
use crate::core::HiveError;
use crate::events::{DispatchReport, EventBus, EventData};
use crate::llm::{EmbeddingProvider, LlmClient};
use crate::store::{Fragment, FragmentStore, Partition, Stores};

/// 管理器唯一标识
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ManagerId(String);

impl ManagerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ManagerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ManagerId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// 管理器 trait
#[async_trait]
pub trait Manager: Send + Sync {
    fn id(&self) -> ManagerId;

    /// 必须先于本管理器执行的管理器
    fn dependencies(&self) -> Vec<ManagerId> {
        Vec::new()
    }

    /// 第一遍：可修改 state.data；出错中止本轮
    async fn process(&self, _state: &mut State) -> Result<(), HiveError> {
        Ok(())
    }

    /// 只读贡献检索结果
    async fn context(&self, _state: &State) -> Result<Vec<StateData>, HiveError> {
        Ok(Vec::new())
    }

    /// 回复已生成并落库之后调用；出错只作为告警上报
    async fn post_process(&self, _state: &State) -> Result<(), HiveError> {
        Ok(())
    }

    /// 本管理器拥有的分区
    fn fragment_store(&self) -> Option<&FragmentStore> {
        None
    }

    /// 通过自有分区持久化片段
    async fn store(
        &self,
        fragment: Fragment,
        cancel: &CancellationToken,
    ) -> Result<Fragment, HiveError> {
        match self.fragment_store() {
            Some(store) => store.store(fragment, cancel).await,
            None => Err(HiveError::Manager(format!(
                "manager {} owns no fragment partition",
                self.id()
            ))),
        }
    }

    /// 启动后台任务；重复调用无副作用
    async fn start_background_processes(&self) -> Result<(), HiveError> {
        Ok(())
    }

    /// 停止后台任务并等待其完全退出；重复调用无副作用
    async fn stop_background_processes(&self) -> Result<(), HiveError> {
        Ok(())
    }

    /// 在总线上订阅事件（引擎构造时调用一次）
    fn register_event_handlers(&self, _bus: &EventBus) {}
}

/// 构造 BaseManager 的显式配置
#[derive(Clone)]
pub struct BaseManagerConfig {
    pub id: ManagerId,
    pub dependencies: Vec<ManagerId>,
    pub assistant_id: String,
    pub assistant_name: String,
    /// 本管理器拥有的分区；None 表示不持久化
    pub partition: Option<Partition>,
    pub stores: Stores,
    pub llm: Arc<dyn LlmClient>,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub bus: EventBus,
}

/// 具体管理器共用的句柄与身份信息
#[derive(Clone)]
pub struct BaseManager {
    id: ManagerId,
    dependencies: Vec<ManagerId>,
    pub assistant_id: String,
    pub assistant_name: String,
    pub stores: Stores,
    fragments: Option<FragmentStore>,
    pub llm: Arc<dyn LlmClient>,
    pub embedder: Arc<dyn EmbeddingProvider>,
    bus: EventBus,
}

impl BaseManager {
    /// 构造时一次性校验
    pub fn new(config: BaseManagerConfig) -> Result<Self, HiveError> {
        if config.id.as_str().trim().is_empty() {
            return Err(HiveError::configuration("manager id is empty"));
        }
        if config.assistant_id.trim().is_empty() {
            return Err(HiveError::configuration(format!(
                "manager {}: assistant id is empty",
                config.id
            )));
        }
        if let Some(dims) = config.stores.fragment_config().dimensions {
            if dims != config.embedder.dimensions() {
                return Err(HiveError::configuration(format!(
                    "manager {}: embedder produces {} dimensions, store expects {dims}",
                    config.id,
                    config.embedder.dimensions()
                )));
            }
        }
        let fragments = config
            .partition
            .map(|p| config.stores.partition(p))
            .transpose()?;
        Ok(Self {
            id: config.id,
            dependencies: config.dependencies,
            assistant_id: config.assistant_id,
            assistant_name: config.assistant_name,
            stores: config.stores,
            fragments,
            llm: config.llm,
            embedder: config.embedder,
            bus: config.bus,
        })
    }

    pub fn id(&self) -> ManagerId {
        self.id.clone()
    }

    pub fn dependencies(&self) -> Vec<ManagerId> {
        self.dependencies.clone()
    }

    pub fn fragments(&self) -> Option<&FragmentStore> {
        self.fragments.as_ref()
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// 以本管理器为来源发布事件
    pub fn trigger_event(&self, event_type: &str, payload: Value) -> DispatchReport {
        let event = EventData::new(event_type, payload, self.id.clone());
        self.bus.trigger(&event)
    }
}
