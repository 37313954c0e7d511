//! 查询缓存：指纹 → 结果
//!
//! 读路径先按过滤器指纹查找，未命中时由调用方查库再回填；写路径按会话范围失效。
//! 每次失效都会推进代数（generation），回填只在代数未变时生效，避免并发下写入过期结果。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::store::types::{FragmentFilter, MetadataOperator};

/// 缓存统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

struct CacheEntry<V> {
    value: V,
    /// 过滤器限定的会话；None 表示可能覆盖任意会话
    session: Option<String>,
    inserted_at: Instant,
    seq: u64,
}

struct CacheInner<V> {
    entries: HashMap<String, CacheEntry<V>>,
    generation: u64,
    next_seq: u64,
}

/// 带失效语义的键值缓存
pub struct Cache<V> {
    inner: Mutex<CacheInner<V>>,
    capacity: usize,
    ttl: Option<Duration>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<V: Clone> Cache<V> {
    /// `ttl` 为 None 时条目永不过期
    pub fn new(capacity: usize, ttl: Option<Duration>) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                generation: 0,
                next_seq: 0,
            }),
            capacity: capacity.max(1),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let mut inner = self.inner.lock();
        let expired = match inner.entries.get(key) {
            Some(entry) => self.is_expired(entry),
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };
        if expired {
            inner.entries.remove(key);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        self.hits.fetch_add(1, Ordering::Relaxed);
        inner.entries.get(key).map(|e| e.value.clone())
    }

    /// 当前代数：查库前读取，回填时传回 `insert_if_current`
    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    /// 仅当期间没有发生失效时写入，返回是否写入
    pub fn insert_if_current(
        &self,
        key: String,
        session: Option<String>,
        value: V,
        generation: u64,
    ) -> bool {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return false;
        }
        self.insert_locked(&mut inner, key, session, value);
        true
    }

    pub fn insert(&self, key: String, session: Option<String>, value: V) {
        let mut inner = self.inner.lock();
        self.insert_locked(&mut inner, key, session, value);
    }

    fn insert_locked(&self, inner: &mut CacheInner<V>, key: String, session: Option<String>, value: V) {
        if !inner.entries.contains_key(&key) && inner.entries.len() >= self.capacity {
            let oldest = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.seq)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                inner.entries.remove(&oldest);
            }
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.entries.insert(
            key,
            CacheEntry {
                value,
                session,
                inserted_at: Instant::now(),
                seq,
            },
        );
    }

    /// 失效所有可能包含该会话数据的条目（限定该会话的，以及不限会话的）
    pub fn invalidate_session(&self, session_id: &str) -> usize {
        let mut inner = self.inner.lock();
        inner.generation += 1;
        let before = inner.entries.len();
        inner
            .entries
            .retain(|_, e| e.session.as_deref().is_some_and(|s| s != session_id));
        before - inner.entries.len()
    }

    pub fn invalidate_all(&self) {
        let mut inner = self.inner.lock();
        inner.generation += 1;
        inner.entries.clear();
    }

    /// 清理过期条目，返回清理数量
    pub fn purge_expired(&self) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        let ttl = self.ttl;
        inner
            .entries
            .retain(|_, e| ttl.map_or(true, |ttl| e.inserted_at.elapsed() < ttl));
        before - inner.entries.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }

    fn is_expired(&self, entry: &CacheEntry<V>) -> bool {
        self.ttl.is_some_and(|ttl| entry.inserted_at.elapsed() >= ttl)
    }
}

/// 过滤器指纹：与元数据条件顺序、`in` 集合元素顺序无关
pub fn fingerprint(filter: &FragmentFilter) -> String {
    let mut conditions: Vec<(String, &'static str, String)> = filter
        .metadata
        .iter()
        .map(|c| {
            let value = match (&c.operator, &c.value) {
                (MetadataOperator::In, Value::Array(items)) => {
                    let mut items: Vec<String> = items.iter().map(canonical_json).collect();
                    items.sort();
                    items.dedup();
                    format!("[{}]", items.join(","))
                }
                (_, v) => canonical_json(v),
            };
            (c.key.clone(), c.operator.as_str(), value)
        })
        .collect();
    conditions.sort();

    let mut hasher = Sha256::new();
    hash_scope(&mut hasher, "actor", filter.actor_id.as_deref());
    hash_scope(&mut hasher, "|session", filter.session_id.as_deref());
    for (key, op, value) in &conditions {
        hasher.update(format!("|meta:{}:{key}{op}{value}", key.len()).as_bytes());
    }
    hasher.update(
        format!(
            "|start:{}|end:{}",
            filter.start_time.map(|t| t.timestamp_micros()).unwrap_or(i64::MIN),
            filter.end_time.map(|t| t.timestamp_micros()).unwrap_or(i64::MAX)
        )
        .as_bytes(),
    );
    if let Some(embedding) = &filter.embedding {
        hasher.update(b"|embedding:");
        for x in embedding {
            hasher.update(x.to_bits().to_le_bytes());
        }
    }
    hasher.update(format!("|limit:{}", filter.limit).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// 未设置与设置分别打标签，值带长度前缀
fn hash_scope(hasher: &mut Sha256, tag: &str, value: Option<&str>) {
    match value {
        Some(v) => hasher.update(format!("{tag}:some:{}:{v}", v.len()).as_bytes()),
        None => hasher.update(format!("{tag}:none").as_bytes()),
    }
}

/// serde_json 的 Map 默认按键排序，序列化结果稳定
fn canonical_json(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::types::MetadataCondition;
    use serde_json::json;

    #[test]
    fn test_fingerprint_ignores_condition_order() {
        let a = FragmentFilter::new()
            .session("s1")
            .condition(MetadataCondition::equals("scope", json!("session")))
            .condition(MetadataCondition::one_of("kind", vec![json!("a"), json!("b")]));
        let b = FragmentFilter::new()
            .session("s1")
            .condition(MetadataCondition::one_of("kind", vec![json!("b"), json!("a")]))
            .condition(MetadataCondition::equals("scope", json!("session")));
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn test_fingerprint_distinguishes_filters() {
        let base = FragmentFilter::new().session("s1").limit(5);
        assert_ne!(fingerprint(&base), fingerprint(&base.clone().limit(6)));
        assert_ne!(fingerprint(&base), fingerprint(&base.clone().actor("u1")));
        assert_ne!(
            fingerprint(&base),
            fingerprint(&base.clone().similar_to(vec![0.0, 1.0]))
        );
        assert_ne!(
            fingerprint(&FragmentFilter::new().session("s1")),
            fingerprint(&FragmentFilter::new().actor("s1"))
        );
    }

    #[test]
    fn test_fingerprint_scope_values_do_not_collide() {
        assert_ne!(
            fingerprint(&FragmentFilter::new().actor("*")),
            fingerprint(&FragmentFilter::new())
        );
        assert_ne!(
            fingerprint(&FragmentFilter::new().actor("a|session:b")),
            fingerprint(&FragmentFilter::new().actor("a").session("b|session:*"))
        );
        assert_ne!(
            fingerprint(&FragmentFilter::new().session("")),
            fingerprint(&FragmentFilter::new())
        );
    }

    #[test]
    fn test_invalidate_session_scope() {
        let cache: Cache<u32> = Cache::new(10, None);
        cache.insert("s1".into(), Some("s1".into()), 1);
        cache.insert("s2".into(), Some("s2".into()), 2);
        cache.insert("any".into(), None, 3);

        assert_eq!(cache.invalidate_session("s1"), 2);
        assert_eq!(cache.get("s1"), None);
        assert_eq!(cache.get("any"), None);
        assert_eq!(cache.get("s2"), Some(2));
    }

    #[test]
    fn test_stale_fill_rejected_after_invalidation() {
        let cache: Cache<u32> = Cache::new(10, None);
        let generation = cache.generation();
        cache.invalidate_session("s1");
        assert!(!cache.insert_if_current("k".into(), Some("s1".into()), 1, generation));
        assert!(cache.is_empty());

        let generation = cache.generation();
        assert!(cache.insert_if_current("k".into(), Some("s1".into()), 1, generation));
        assert_eq!(cache.get("k"), Some(1));
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let cache: Cache<u32> = Cache::new(2, None);
        cache.insert("a".into(), None, 1);
        cache.insert("b".into(), None, 2);
        cache.insert("c".into(), None, 3);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("c"), Some(3));
    }

    #[test]
    fn test_ttl_expiry_and_stats() {
        let cache: Cache<u32> = Cache::new(4, Some(Duration::from_millis(0)));
        cache.insert("a".into(), None, 1);
        assert_eq!(cache.get("a"), None);

        let cache: Cache<u32> = Cache::new(4, Some(Duration::from_secs(60)));
        cache.insert("a".into(), None, 1);
        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.purge_expired(), 0);
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.entries), (1, 1, 1));
    }
}
