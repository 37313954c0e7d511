//! 参与者仓库：按 id 幂等写入

use rusqlite::OptionalExtension;
use tokio_util::sync::CancellationToken;

use crate::core::HiveError;
use crate::store::database::Database;
use crate::store::types::Actor;

#[derive(Clone)]
pub struct ActorStore {
    db: Database,
}

impl ActorStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// 创建或更新（已存在时只更新字段，不产生重复）
    pub async fn upsert(&self, actor: &Actor, cancel: &CancellationToken) -> Result<(), HiveError> {
        if actor.id.trim().is_empty() {
            return Err(HiveError::validation("actor id is empty"));
        }
        let actor = actor.clone();
        self.db
            .run_write(cancel, move |conn| {
                conn.execute(
                    "INSERT INTO actors (id, name, is_assistant) VALUES (?1, ?2, ?3)
                     ON CONFLICT(id) DO UPDATE SET name = excluded.name, is_assistant = excluded.is_assistant",
                    rusqlite::params![actor.id, actor.name, actor.is_assistant],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get(&self, id: &str, cancel: &CancellationToken) -> Result<Option<Actor>, HiveError> {
        let id = id.to_string();
        self.db
            .run(cancel, move |conn| {
                let actor = conn
                    .query_row(
                        "SELECT id, name, is_assistant FROM actors WHERE id = ?1",
                        [&id],
                        |row| {
                            Ok(Actor {
                                id: row.get(0)?,
                                name: row.get(1)?,
                                is_assistant: row.get(2)?,
                            })
                        },
                    )
                    .optional()?;
                Ok(actor)
            })
            .await
    }

    pub async fn exists(&self, id: &str, cancel: &CancellationToken) -> Result<bool, HiveError> {
        Ok(self.get(id, cancel).await?.is_some())
    }
}
