//! 会话仓库

use std::collections::BTreeMap;

use rusqlite::OptionalExtension;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::core::HiveError;
use crate::store::database::Database;
use crate::store::types::Session;

#[derive(Clone)]
pub struct SessionStore {
    db: Database,
}

impl SessionStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// 创建或更新会话元数据
    pub async fn upsert(&self, session: &Session, cancel: &CancellationToken) -> Result<(), HiveError> {
        if session.id.trim().is_empty() {
            return Err(HiveError::validation("session id is empty"));
        }
        let id = session.id.clone();
        let metadata = serde_json::to_string(&session.metadata)?;
        self.db
            .run_write(cancel, move |conn| {
                conn.execute(
                    "INSERT INTO sessions (id, metadata) VALUES (?1, ?2)
                     ON CONFLICT(id) DO UPDATE SET metadata = excluded.metadata",
                    rusqlite::params![id, metadata],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get(&self, id: &str, cancel: &CancellationToken) -> Result<Option<Session>, HiveError> {
        let id = id.to_string();
        self.db
            .run(cancel, move |conn| {
                let row: Option<(String, String)> = conn
                    .query_row(
                        "SELECT id, metadata FROM sessions WHERE id = ?1",
                        [&id],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()?;
                match row {
                    Some((id, metadata)) => {
                        let metadata: BTreeMap<String, Value> = serde_json::from_str(&metadata)?;
                        Ok(Some(Session { id, metadata }))
                    }
                    None => Ok(None),
                }
            })
            .await
    }

    pub async fn exists(&self, id: &str, cancel: &CancellationToken) -> Result<bool, HiveError> {
        Ok(self.get(id, cancel).await?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_session_upsert_and_get() {
        let store = SessionStore::new(Database::in_memory().unwrap());
        let cancel = CancellationToken::new();

        store.upsert(&Session::new("s1"), &cancel).await.unwrap();
        store
            .upsert(&Session::new("s1").with_metadata("channel", json!("cli")), &cancel)
            .await
            .unwrap();

        let session = store.get("s1", &cancel).await.unwrap().unwrap();
        assert_eq!(session.metadata.get("channel"), Some(&json!("cli")));
        assert!(store.get("s2", &cancel).await.unwrap().is_none());
    }
}
