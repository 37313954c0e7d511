//! 存储层：参与者、会话、分区片段存储与查询缓存（SQLite）

pub mod actors;
pub mod cache;
pub mod database;
pub mod fragments;
pub mod sessions;
pub mod stores;
pub mod types;

pub use actors::ActorStore;
pub use cache::{fingerprint, Cache, CacheStats};
pub use database::Database;
pub use fragments::{FragmentStore, FragmentStoreConfig};
pub use sessions::SessionStore;
pub use stores::Stores;
pub use types::{
    Actor, ActorId, Fragment, FragmentFilter, FragmentId, MetadataCondition, MetadataOperator,
    Partition, Session, SessionId,
};
