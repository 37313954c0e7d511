//! Hive - 对话智能体运行时
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 引擎、依赖解析、单轮状态、提示组装、后台任务、关闭
//! - **events**: 进程内事件总线
//! - **llm**: 模型客户端与嵌入抽象（OpenAI 兼容 / Mock）
//! - **manager**: 管理器契约与共用句柄
//! - **managers**: 内置管理器（洞察、人格）
//! - **observability**: tracing 初始化
//! - **store**: 参与者、会话、分区片段存储与查询缓存（SQLite）

pub mod config;
pub mod core;
pub mod events;
pub mod llm;
pub mod manager;
pub mod managers;
pub mod observability;
pub mod store;

pub use crate::core::{Engine, EngineBuilder, HiveError};
