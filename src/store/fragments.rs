//! 片段存储：单个分区的追加式日志，支持精确过滤与向量相似度检索，前置查询缓存

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::core::HiveError;
use crate::store::cache::{fingerprint, Cache, CacheStats};
use crate::store::database::Database;
use crate::store::types::{l2_distance, Fragment, FragmentFilter, Partition};

/// 片段存储配置
#[derive(Debug, Clone)]
pub struct FragmentStoreConfig {
    /// 向量维度；None 表示不校验
    pub dimensions: Option<usize>,
    pub cache_capacity: usize,
    /// None 表示缓存条目不过期
    pub cache_ttl: Option<Duration>,
}

impl Default for FragmentStoreConfig {
    fn default() -> Self {
        Self {
            dimensions: None,
            cache_capacity: 256,
            cache_ttl: None,
        }
    }
}

struct FragmentStoreInner {
    db: Database,
    partition: Partition,
    dimensions: Option<usize>,
    cache: Cache<Arc<Vec<Fragment>>>,
}

/// 单分区片段存储，克隆共享同一缓存与连接
#[derive(Clone)]
pub struct FragmentStore {
    inner: Arc<FragmentStoreInner>,
}

const SELECT_COLUMNS: &str = "id, actor_id, session_id, content, embedding, metadata, created_at";

impl FragmentStore {
    pub fn new(
        db: Database,
        partition: Partition,
        config: FragmentStoreConfig,
    ) -> Result<Self, HiveError> {
        if config.dimensions == Some(0) {
            return Err(HiveError::configuration("embedding dimensions must be positive"));
        }
        db.ensure_partition(&partition)?;
        Ok(Self {
            inner: Arc::new(FragmentStoreInner {
                db,
                cache: Cache::new(config.cache_capacity, config.cache_ttl),
                partition,
                dimensions: config.dimensions,
            }),
        })
    }

    pub fn partition(&self) -> &Partition {
        &self.inner.partition
    }

    pub fn dimensions(&self) -> Option<usize> {
        self.inner.dimensions
    }

    /// 写入片段：校验参与者/会话存在，写入成功后在同一临界区内失效相关缓存
    pub async fn store(
        &self,
        fragment: Fragment,
        cancel: &CancellationToken,
    ) -> Result<Fragment, HiveError> {
        let mut fragment = fragment;
        if fragment.id.trim().is_empty() {
            return Err(HiveError::validation("fragment id is empty"));
        }
        if let Some(dim) = self.inner.dimensions {
            if !fragment.embedding.is_empty() && fragment.embedding.len() != dim {
                return Err(HiveError::validation(format!(
                    "fragment embedding has {} dimensions, partition {} expects {dim}",
                    fragment.embedding.len(),
                    self.inner.partition
                )));
            }
        }
        let created_at = truncate_micros(fragment.created_at.unwrap_or_else(Utc::now));
        fragment.created_at = Some(created_at);

        let inner = Arc::clone(&self.inner);
        let stored = self
            .inner
            .db
            .run_write(cancel, move |conn| {
                insert_fragment(conn, &inner.partition, &fragment)?;
                let dropped = inner.cache.invalidate_session(&fragment.session_id);
                tracing::debug!(
                    partition = %inner.partition,
                    session = %fragment.session_id,
                    fragment = %fragment.id,
                    invalidated = dropped,
                    "fragment stored"
                );
                Ok(fragment)
            })
            .await?;
        Ok(stored)
    }

    /// 按过滤器查询（读穿缓存）
    pub async fn query(
        &self,
        filter: &FragmentFilter,
        cancel: &CancellationToken,
    ) -> Result<Vec<Fragment>, HiveError> {
        filter.validate(self.inner.dimensions)?;
        let key = fingerprint(filter);
        if let Some(hit) = self.inner.cache.get(&key) {
            tracing::debug!(partition = %self.inner.partition, "fragment cache hit");
            return Ok(hit.as_ref().clone());
        }

        let generation = self.inner.cache.generation();
        let inner = Arc::clone(&self.inner);
        let owned = filter.clone();
        let results = self
            .inner
            .db
            .run(cancel, move |conn| load_fragments(conn, &inner.partition, &owned))
            .await?;

        let cached = self.inner.cache.insert_if_current(
            key,
            filter.session_id.clone(),
            Arc::new(results.clone()),
            generation,
        );
        tracing::debug!(
            partition = %self.inner.partition,
            results = results.len(),
            cached,
            "fragment cache miss"
        );
        Ok(results)
    }

    /// 按 id 读取（不经缓存）
    pub async fn get(&self, id: &str, cancel: &CancellationToken) -> Result<Option<Fragment>, HiveError> {
        let table = self.inner.partition.table_name();
        let id = id.to_string();
        self.inner
            .db
            .run(cancel, move |conn| {
                let sql = format!("SELECT {SELECT_COLUMNS} FROM {table} WHERE id = ?1");
                let raw = conn.query_row(&sql, [&id], RawFragment::from_row).optional()?;
                raw.map(RawFragment::into_fragment).transpose()
            })
            .await
    }

    pub async fn count(&self, cancel: &CancellationToken) -> Result<usize, HiveError> {
        let table = self.inner.partition.table_name();
        self.inner
            .db
            .run(cancel, move |conn| {
                let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))?;
                Ok(n as usize)
            })
            .await
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    pub fn purge_expired_cache(&self) -> usize {
        self.inner.cache.purge_expired()
    }

    pub fn invalidate_cache(&self) {
        self.inner.cache.invalidate_all();
    }
}

fn truncate_micros(at: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(at.timestamp_micros()).unwrap_or(at)
}

fn insert_fragment(conn: &Connection, partition: &Partition, fragment: &Fragment) -> Result<(), HiveError> {
    let actor_exists: bool = conn
        .query_row("SELECT 1 FROM actors WHERE id = ?1", [&fragment.actor_id], |_| Ok(()))
        .optional()?
        .is_some();
    if !actor_exists {
        return Err(HiveError::ActorNotFound(fragment.actor_id.clone()));
    }
    let session_exists: bool = conn
        .query_row("SELECT 1 FROM sessions WHERE id = ?1", [&fragment.session_id], |_| Ok(()))
        .optional()?
        .is_some();
    if !session_exists {
        return Err(HiveError::SessionNotFound(fragment.session_id.clone()));
    }

    let created_at = fragment
        .created_at
        .map(|t| t.timestamp_micros())
        .unwrap_or_else(|| Utc::now().timestamp_micros());
    let sql = format!(
        "INSERT INTO {} (id, actor_id, session_id, content, embedding, metadata, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        partition.table_name()
    );
    let result = conn.execute(
        &sql,
        rusqlite::params![
            fragment.id,
            fragment.actor_id,
            fragment.session_id,
            fragment.content,
            encode_embedding(&fragment.embedding),
            serde_json::to_string(&fragment.metadata)?,
            created_at,
        ],
    );
    match result {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Err(HiveError::DuplicateFragment {
                partition: partition.name().to_string(),
                id: fragment.id.clone(),
            })
        }
        Err(e) => Err(e.into()),
    }
}

/// SQL 侧处理 actor / session / 时间范围；元数据条件与向量排序在内存中完成
fn load_fragments(
    conn: &Connection,
    partition: &Partition,
    filter: &FragmentFilter,
) -> Result<Vec<Fragment>, HiveError> {
    let mut clauses: Vec<&str> = Vec::new();
    let mut params: Vec<rusqlite::types::Value> = Vec::new();
    if let Some(actor) = &filter.actor_id {
        clauses.push("actor_id = ?");
        params.push(actor.clone().into());
    }
    if let Some(session) = &filter.session_id {
        clauses.push("session_id = ?");
        params.push(session.clone().into());
    }
    if let Some(start) = filter.start_time {
        clauses.push("created_at >= ?");
        params.push(start.timestamp_micros().into());
    }
    if let Some(end) = filter.end_time {
        clauses.push("created_at < ?");
        params.push(end.timestamp_micros().into());
    }

    let mut sql = format!("SELECT {SELECT_COLUMNS} FROM {}", partition.table_name());
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY created_at DESC, rowid DESC");
    let sql_limit = filter.embedding.is_none() && filter.metadata.is_empty() && filter.limit > 0;
    if sql_limit {
        sql.push_str(&format!(" LIMIT {}", filter.limit));
    }

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(params), RawFragment::from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    let mut fragments = Vec::with_capacity(rows.len());
    for raw in rows {
        let fragment = raw.into_fragment()?;
        if filter.metadata.iter().all(|c| c.matches(&fragment.metadata)) {
            fragments.push(fragment);
        }
    }

    if let Some(query) = &filter.embedding {
        let mut ranked: Vec<(f32, Fragment)> = fragments
            .into_iter()
            .filter(|f| f.embedding.len() == query.len())
            .map(|f| (l2_distance(query, &f.embedding), f))
            .collect();
        // 稳定排序：距离相同时保持时间倒序
        ranked.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        fragments = ranked.into_iter().map(|(_, f)| f).collect();
    }

    if filter.limit > 0 {
        fragments.truncate(filter.limit);
    }
    Ok(fragments)
}

fn encode_embedding(embedding: &[f32]) -> Option<Vec<u8>> {
    if embedding.is_empty() {
        return None;
    }
    Some(embedding.iter().flat_map(|x| x.to_le_bytes()).collect())
}

fn decode_embedding(bytes: Option<Vec<u8>>) -> Vec<f32> {
    bytes
        .unwrap_or_default()
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

struct RawFragment {
    id: String,
    actor_id: String,
    session_id: String,
    content: String,
    embedding: Option<Vec<u8>>,
    metadata: String,
    created_at: i64,
}

impl RawFragment {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            actor_id: row.get(1)?,
            session_id: row.get(2)?,
            content: row.get(3)?,
            embedding: row.get(4)?,
            metadata: row.get(5)?,
            created_at: row.get(6)?,
        })
    }

    fn into_fragment(self) -> Result<Fragment, HiveError> {
        let metadata: BTreeMap<String, Value> = serde_json::from_str(&self.metadata)?;
        Ok(Fragment {
            id: self.id,
            actor_id: self.actor_id,
            session_id: self.session_id,
            content: self.content,
            embedding: decode_embedding(self.embedding),
            metadata,
            created_at: DateTime::from_timestamp_micros(self.created_at),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::types::{Actor, MetadataCondition, Session};
    use crate::store::{ActorStore, SessionStore};
    use serde_json::json;

    async fn setup(partition: Partition, dimensions: Option<usize>) -> (FragmentStore, CancellationToken) {
        let db = Database::in_memory().unwrap();
        let cancel = CancellationToken::new();
        let actors = ActorStore::new(db.clone());
        let sessions = SessionStore::new(db.clone());
        actors.upsert(&Actor::user("u1", "Alice"), &cancel).await.unwrap();
        actors.upsert(&Actor::user("u2", "Bob"), &cancel).await.unwrap();
        sessions.upsert(&Session::new("s1"), &cancel).await.unwrap();
        sessions.upsert(&Session::new("s2"), &cancel).await.unwrap();
        let store = FragmentStore::new(
            db,
            partition,
            FragmentStoreConfig {
                dimensions,
                ..Default::default()
            },
        )
        .unwrap();
        (store, cancel)
    }

    #[tokio::test]
    async fn test_store_rejects_unknown_references() {
        let (store, cancel) = setup(Partition::Interaction, None).await;
        let err = store
            .store(Fragment::new("ghost", "s1", "hi"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, HiveError::ActorNotFound(_)));
        let err = store
            .store(Fragment::new("u1", "nowhere", "hi"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, HiveError::SessionNotFound(_)));
        assert_eq!(store.count(&cancel).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let (store, cancel) = setup(Partition::Insight, None).await;
        store
            .store(Fragment::new("u1", "s1", "a").with_id("f1"), &cancel)
            .await
            .unwrap();
        let err = store
            .store(Fragment::new("u1", "s1", "b").with_id("f1"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, HiveError::DuplicateFragment { .. }));
    }

    #[tokio::test]
    async fn test_dimension_check() {
        let (store, cancel) = setup(Partition::Interaction, Some(3)).await;
        let err = store
            .store(Fragment::new("u1", "s1", "a").with_embedding(vec![1.0]), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, HiveError::Validation(_)));
        store
            .store(Fragment::new("u1", "s1", "no vector"), &cancel)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_recency_order_and_limit() {
        let (store, cancel) = setup(Partition::Interaction, None).await;
        let base = Utc::now();
        for i in 0..5 {
            store
                .store(
                    Fragment::new("u1", "s1", format!("m{i}"))
                        .with_created_at(base + chrono::Duration::seconds(i)),
                    &cancel,
                )
                .await
                .unwrap();
        }
        let results = store
            .query(&FragmentFilter::new().session("s1").limit(3), &cancel)
            .await
            .unwrap();
        let contents: Vec<_> = results.iter().map(|f| f.content.as_str()).collect();
        assert_eq!(contents, vec!["m4", "m3", "m2"]);
    }

    #[tokio::test]
    async fn test_similarity_ranking() {
        let (store, cancel) = setup(Partition::Insight, Some(2)).await;
        for (content, v) in [("far", vec![10.0, 10.0]), ("near", vec![1.0, 0.0]), ("mid", vec![3.0, 3.0])] {
            store
                .store(Fragment::new("u1", "s1", content).with_embedding(v), &cancel)
                .await
                .unwrap();
        }
        store
            .store(Fragment::new("u1", "s1", "unembedded"), &cancel)
            .await
            .unwrap();

        let results = store
            .query(&FragmentFilter::new().similar_to(vec![0.0, 0.0]).limit(2), &cancel)
            .await
            .unwrap();
        let contents: Vec<_> = results.iter().map(|f| f.content.as_str()).collect();
        assert_eq!(contents, vec!["near", "mid"]);
    }

    #[tokio::test]
    async fn test_metadata_filter_in_sql_plus_memory() {
        let (store, cancel) = setup(Partition::Insight, None).await;
        store
            .store(Fragment::new("u1", "s1", "a").with_metadata("scope", json!("session")), &cancel)
            .await
            .unwrap();
        store
            .store(Fragment::new("u1", "s1", "b").with_metadata("scope", json!("actor")), &cancel)
            .await
            .unwrap();
        store
            .store(Fragment::new("u2", "s1", "c").with_metadata("scope", json!("session")), &cancel)
            .await
            .unwrap();

        let filter = FragmentFilter::new()
            .actor("u1")
            .session("s1")
            .condition(MetadataCondition::equals("scope", json!("session")));
        let results = store.query(&filter, &cancel).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].content, "a");
    }

    #[tokio::test]
    async fn test_cache_hit_then_invalidated_by_write() {
        let (store, cancel) = setup(Partition::Interaction, None).await;
        store.store(Fragment::new("u1", "s1", "first"), &cancel).await.unwrap();

        let filter = FragmentFilter::new().session("s1");
        let first = store.query(&filter, &cancel).await.unwrap();
        let second = store.query(&filter, &cancel).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.cache_stats().hits, 1);

        store.store(Fragment::new("u1", "s1", "second"), &cancel).await.unwrap();
        let third = store.query(&filter, &cancel).await.unwrap();
        assert_eq!(third.len(), 2);
    }

    #[tokio::test]
    async fn test_write_to_other_session_keeps_cache() {
        let (store, cancel) = setup(Partition::Interaction, None).await;
        store.store(Fragment::new("u1", "s1", "x"), &cancel).await.unwrap();
        let filter = FragmentFilter::new().session("s1");
        store.query(&filter, &cancel).await.unwrap();

        store.store(Fragment::new("u1", "s2", "y"), &cancel).await.unwrap();
        store.query(&filter, &cancel).await.unwrap();
        assert_eq!(store.cache_stats().hits, 1);
    }

    #[tokio::test]
    async fn test_get_by_id_round_trip() {
        let (store, cancel) = setup(Partition::Personality, Some(3)).await;
        let fragment = Fragment::new("u1", "s1", "profile")
            .with_embedding(vec![0.25, -1.5, 3.0])
            .with_metadata("traits", json!(["dry", "terse"]));
        let stored = store.store(fragment.clone(), &cancel).await.unwrap();
        let loaded = store.get(&fragment.id, &cancel).await.unwrap().unwrap();
        assert_eq!(loaded, stored);
        assert_eq!(loaded.embedding, fragment.embedding);
        assert_eq!(loaded.metadata, fragment.metadata);
        assert!(store.get("missing", &cancel).await.unwrap().is_none());
    }
}
