//! 运行时错误类型
//!
//! 按处理方式分类：配置错误（构造失败）、校验错误（拒绝单次操作）、管线错误（中止本轮）、
//! 后处理错误（回复已交付，仅告警）、传输错误（模型/存储后端，调用方可重试）。

use thiserror::Error;

use crate::core::state::TurnPhase;
use crate::manager::ManagerId;

/// Hive 运行过程中可能出现的错误
#[derive(Error, Debug)]
pub enum HiveError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Manager dependency cycle among: {}", join_ids(.0))]
    DependencyCycle(Vec<ManagerId>),

    #[error("Manager {manager} depends on unregistered manager {dependency}")]
    UnknownDependency {
        manager: ManagerId,
        dependency: ManagerId,
    },

    #[error("Manager registered twice: {0}")]
    DuplicateManager(ManagerId),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Actor not found: {0}")]
    ActorNotFound(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Fragment {id} already exists in partition {partition}")]
    DuplicateFragment { partition: String, id: String },

    #[error("Invalid turn transition: expected {expected:?}, got {actual:?}")]
    InvalidTransition {
        expected: TurnPhase,
        actual: TurnPhase,
    },

    /// Process / Context 阶段失败，本轮中止且未写入任何片段
    #[error("Manager {manager} failed during {stage}: {source}")]
    Pipeline {
        manager: ManagerId,
        stage: PipelineStage,
        #[source]
        source: Box<HiveError>,
    },

    /// PostProcess 阶段失败：回复已经落库，不回滚
    #[error("Manager {manager} failed during post-process: {source}")]
    PostProcess {
        manager: ManagerId,
        #[source]
        source: Box<HiveError>,
    },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Operation cancelled")]
    Cancelled,

    /// 管理器内部业务逻辑报告的错误
    #[error("Manager error: {0}")]
    Manager(String),
}

/// 错误大类，决定调用方的处理策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Validation,
    Pipeline,
    PostProcess,
    Transport,
    Cancelled,
    Manager,
}

/// 管线中出错的阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Process,
    Context,
}

impl std::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Process => write!(f, "process"),
            Self::Context => write!(f, "context"),
        }
    }
}

fn join_ids(ids: &[ManagerId]) -> String {
    ids.iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

impl HiveError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_)
            | Self::DependencyCycle(_)
            | Self::UnknownDependency { .. }
            | Self::DuplicateManager(_) => ErrorKind::Configuration,
            Self::Validation(_)
            | Self::ActorNotFound(_)
            | Self::SessionNotFound(_)
            | Self::DuplicateFragment { .. }
            | Self::InvalidTransition { .. } => ErrorKind::Validation,
            Self::Pipeline { .. } => ErrorKind::Pipeline,
            Self::PostProcess { .. } => ErrorKind::PostProcess,
            Self::Transport(_) | Self::Storage(_) => ErrorKind::Transport,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Manager(_) => ErrorKind::Manager,
        }
    }

    /// 调用方可以在下一轮或重试时恢复（引擎与存储仍可用）
    pub fn is_recoverable(&self) -> bool {
        !matches!(self.kind(), ErrorKind::Configuration)
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}

impl From<rusqlite::Error> for HiveError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for HiveError {
    fn from(e: serde_json::Error) -> Self {
        Self::Storage(format!("serialization: {e}"))
    }
}
