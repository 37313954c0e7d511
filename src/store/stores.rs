//! 存储句柄集合：同一数据库上的参与者、会话与交互分区，以及按需打开的其它分区

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::HiveError;
use crate::store::actors::ActorStore;
use crate::store::database::Database;
use crate::store::fragments::{FragmentStore, FragmentStoreConfig};
use crate::store::sessions::SessionStore;
use crate::store::types::Partition;

/// 引擎与管理器共享的存储句柄，克隆共享同一连接与缓存
#[derive(Clone)]
pub struct Stores {
    pub db: Database,
    pub actors: ActorStore,
    pub sessions: SessionStore,
    pub interactions: FragmentStore,
    /// 每个分区只有一个实例（一份缓存），写入才能失效所有读者看到的缓存
    partitions: Arc<Mutex<HashMap<Partition, FragmentStore>>>,
    fragment_config: FragmentStoreConfig,
}

impl Stores {
    pub fn new(db: Database, fragment_config: FragmentStoreConfig) -> Result<Self, HiveError> {
        let interactions = FragmentStore::new(
            db.clone(),
            Partition::Interaction,
            fragment_config.clone(),
        )?;
        let mut partitions = HashMap::new();
        partitions.insert(Partition::Interaction, interactions.clone());
        Ok(Self {
            actors: ActorStore::new(db.clone()),
            sessions: SessionStore::new(db.clone()),
            interactions,
            partitions: Arc::new(Mutex::new(partitions)),
            db,
            fragment_config,
        })
    }

    /// 打开一个分区（建表幂等）；同一分区总是返回共享实例
    pub fn partition(&self, partition: Partition) -> Result<FragmentStore, HiveError> {
        let mut partitions = self.partitions.lock();
        if let Some(store) = partitions.get(&partition) {
            return Ok(store.clone());
        }
        let store = FragmentStore::new(self.db.clone(), partition.clone(), self.fragment_config.clone())?;
        partitions.insert(partition, store.clone());
        Ok(store)
    }

    pub fn fragment_config(&self) -> &FragmentStoreConfig {
        &self.fragment_config
    }
}
