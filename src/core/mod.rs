//! 核心编排层：错误、依赖解析、单轮状态、提示组装、后台任务、引擎与构建器

pub mod background;
pub mod builder;
pub mod engine;
pub mod error;
pub mod prompt;
pub mod resolver;
pub mod shutdown;
pub mod state;

pub use background::{BackgroundSlot, BackgroundTask};
pub use builder::{create_engine_builder, EngineBuilder};
pub use engine::{Engine, EngineConfig, EngineParts, PostProcessReport, INTERACTION_STORED};
pub use error::{ErrorKind, HiveError, PipelineStage};
pub use prompt::{default_fragment_formatter, FragmentFormatter, PromptBuilder};
pub use resolver::resolve_order;
pub use shutdown::{ShutdownCoordinator, ShutdownManager, ShutdownReason};
pub use state::{State, StateData, StateValue, TurnPhase};
