//! 片段存储集成测试：文件持久化、组合过滤、缓存一致性

use chrono::{Duration as ChronoDuration, Utc};
use hive::store::{
    Actor, ActorStore, Database, Fragment, FragmentFilter, FragmentStore, FragmentStoreConfig,
    MetadataCondition, Partition, Session, SessionStore,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;

async fn seed(db: &Database, cancel: &CancellationToken) {
    let actors = ActorStore::new(db.clone());
    let sessions = SessionStore::new(db.clone());
    actors.upsert(&Actor::user("alice", "Alice"), cancel).await.unwrap();
    actors.upsert(&Actor::user("bob", "Bob"), cancel).await.unwrap();
    sessions.upsert(&Session::new("s1"), cancel).await.unwrap();
    sessions.upsert(&Session::new("s2"), cancel).await.unwrap();
}

fn config(dimensions: usize) -> FragmentStoreConfig {
    FragmentStoreConfig {
        dimensions: Some(dimensions),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_fragments_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("hive.db");
    let cancel = CancellationToken::new();

    {
        let db = Database::open(&path).unwrap();
        seed(&db, &cancel).await;
        let store = FragmentStore::new(db, Partition::Insight, config(3)).unwrap();
        store
            .store(
                Fragment::new("alice", "s1", "likes hiking")
                    .with_id("f-1")
                    .with_embedding(vec![0.1, 0.2, 0.3])
                    .with_metadata("scope", json!("session")),
                &cancel,
            )
            .await
            .unwrap();
    }

    let db = Database::open(&path).unwrap();
    let store = FragmentStore::new(db, Partition::Insight, config(3)).unwrap();
    let fragment = store.get("f-1", &cancel).await.unwrap().unwrap();
    assert_eq!(fragment.content, "likes hiking");
    assert_eq!(fragment.embedding, vec![0.1, 0.2, 0.3]);
    assert_eq!(fragment.metadata.get("scope"), Some(&json!("session")));
    assert!(fragment.created_at.is_some());
    assert_eq!(store.count(&cancel).await.unwrap(), 1);
}

#[tokio::test]
async fn test_partitions_are_isolated() {
    let db = Database::in_memory().unwrap();
    let cancel = CancellationToken::new();
    seed(&db, &cancel).await;
    let insights = FragmentStore::new(db.clone(), Partition::Insight, config(2)).unwrap();
    let notes =
        FragmentStore::new(db, Partition::Custom("notes".into()), config(2)).unwrap();

    insights
        .store(Fragment::new("alice", "s1", "insight"), &cancel)
        .await
        .unwrap();
    assert_eq!(insights.count(&cancel).await.unwrap(), 1);
    assert_eq!(notes.count(&cancel).await.unwrap(), 0);
    assert!(notes
        .query(&FragmentFilter::new().session("s1"), &cancel)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_combined_filters() {
    let db = Database::in_memory().unwrap();
    let cancel = CancellationToken::new();
    seed(&db, &cancel).await;
    let store = FragmentStore::new(db, Partition::Interaction, config(2)).unwrap();

    let base = Utc::now() - ChronoDuration::hours(3);
    let rows = [
        ("a", "alice", "s1", "user", 0),
        ("b", "bob", "s1", "user", 1),
        ("c", "alice", "s1", "assistant", 2),
        ("d", "alice", "s2", "user", 2),
    ];
    for (id, actor, session, role, hours) in rows {
        store
            .store(
                Fragment::new(actor, session, format!("msg {id}"))
                    .with_id(id)
                    .with_metadata("role", json!(role))
                    .with_created_at(base + ChronoDuration::hours(hours)),
                &cancel,
            )
            .await
            .unwrap();
    }

    let filter = FragmentFilter::new().actor("alice").session("s1");
    let ids: Vec<String> = store
        .query(&filter, &cancel)
        .await
        .unwrap()
        .into_iter()
        .map(|f| f.id)
        .collect();
    assert_eq!(ids, vec!["c", "a"]);

    let filter = FragmentFilter::new()
        .session("s1")
        .condition(MetadataCondition::one_of("role", vec![json!("user")]));
    let ids: Vec<String> = store
        .query(&filter, &cancel)
        .await
        .unwrap()
        .into_iter()
        .map(|f| f.id)
        .collect();
    assert_eq!(ids, vec!["b", "a"]);

    // 时间范围左闭右开
    let filter = FragmentFilter::new()
        .since(base + ChronoDuration::hours(1))
        .until(base + ChronoDuration::hours(2));
    let ids: Vec<String> = store
        .query(&filter, &cancel)
        .await
        .unwrap()
        .into_iter()
        .map(|f| f.id)
        .collect();
    assert_eq!(ids, vec!["b"]);
}

#[tokio::test]
async fn test_cached_results_match_fresh_query() {
    let db = Database::in_memory().unwrap();
    let cancel = CancellationToken::new();
    seed(&db, &cancel).await;
    let store = FragmentStore::new(db, Partition::Insight, config(2)).unwrap();

    for (i, embedding) in [vec![1.0, 0.0], vec![0.0, 1.0], vec![0.7, 0.7]].into_iter().enumerate() {
        store
            .store(
                Fragment::new("alice", "s1", format!("insight {i}")).with_embedding(embedding),
                &cancel,
            )
            .await
            .unwrap();
    }

    let filter = FragmentFilter::new()
        .session("s1")
        .similar_to(vec![1.0, 0.1])
        .limit(2);
    let first = store.query(&filter, &cancel).await.unwrap();
    let cached = store.query(&filter, &cancel).await.unwrap();
    assert_eq!(store.cache_stats().hits, 1);
    store.invalidate_cache();
    let fresh = store.query(&filter, &cancel).await.unwrap();
    assert_eq!(first, cached);
    assert_eq!(first, fresh);
    assert_eq!(first[0].content, "insight 0");
    assert_eq!(first[1].content, "insight 2");
}

#[tokio::test]
async fn test_write_through_clone_invalidates_shared_cache() {
    let db = Database::in_memory().unwrap();
    let cancel = CancellationToken::new();
    seed(&db, &cancel).await;
    let reader = FragmentStore::new(db, Partition::Interaction, config(2)).unwrap();
    let writer = reader.clone();

    let filter = FragmentFilter::new().session("s1");
    assert!(reader.query(&filter, &cancel).await.unwrap().is_empty());
    writer
        .store(Fragment::new("bob", "s1", "hello"), &cancel)
        .await
        .unwrap();
    let after = reader.query(&filter, &cancel).await.unwrap();
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].content, "hello");
}

#[tokio::test]
async fn test_cancelled_query_returns_error() {
    let db = Database::in_memory().unwrap();
    let cancel = CancellationToken::new();
    seed(&db, &cancel).await;
    let store = FragmentStore::new(db, Partition::Interaction, config(2)).unwrap();

    let cancelled = CancellationToken::new();
    cancelled.cancel();
    let err = store
        .query(&FragmentFilter::new(), &cancelled)
        .await
        .unwrap_err();
    assert!(matches!(err, hive::HiveError::Cancelled));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_during_store_reports_actual_outcome() {
    let db = Database::in_memory().unwrap();
    let cancel = CancellationToken::new();
    seed(&db, &cancel).await;
    let store = FragmentStore::new(db, Partition::Interaction, config(2)).unwrap();

    for i in 0..100 {
        let id = format!("f-{i}");
        let token = CancellationToken::new();
        let writer = store.clone();
        let (t, fid) = (token.clone(), id.clone());
        let handle = tokio::spawn(async move {
            writer
                .store(Fragment::new("alice", "s1", "hello").with_id(fid), &t)
                .await
        });
        tokio::task::yield_now().await;
        token.cancel();

        let result = handle.await.unwrap();
        let persisted = store.get(&id, &cancel).await.unwrap().is_some();
        match result {
            Ok(_) => assert!(persisted, "{id} reported stored but missing"),
            Err(hive::HiveError::Cancelled) => assert!(!persisted, "{id} reported cancelled but persisted"),
            Err(e) => panic!("unexpected error for {id}: {e}"),
        }
    }
}
