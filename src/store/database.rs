//! SQLite 连接持有者
//!
//! rusqlite 为同步 API：连接放在 parking_lot::Mutex 中，异步调用方在阻塞线程池执行。
//! 读（`run`）在等待期间响应取消令牌；写（`run_write`）只在开始前检查取消，开始后必定等到结果。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::Connection;
use tokio_util::sync::CancellationToken;

use crate::core::HiveError;
use crate::store::types::Partition;

pub(crate) const SCHEMA_VERSION: u32 = 1;

const PRAGMAS: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
";

const CREATE_TABLES: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS actors (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    is_assistant INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    metadata TEXT NOT NULL DEFAULT '{}'
);
";

/// 线程安全的 SQLite 连接包装，克隆共享同一连接
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl Database {
    /// 打开或创建数据库文件；路径为 ":memory:" 时等同 `in_memory`
    pub fn open(path: &Path) -> Result<Self, HiveError> {
        if path == Path::new(":memory:") {
            return Self::in_memory();
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| HiveError::Storage(format!("create dir: {e}")))?;
            }
        }
        let conn = Connection::open(path)?;
        let db = Self::init(conn, path.to_path_buf())?;
        tracing::info!(path = %path.display(), "database opened");
        Ok(db)
    }

    /// 内存数据库（测试与演示用）
    pub fn in_memory() -> Result<Self, HiveError> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, PathBuf::from(":memory:"))
    }

    fn init(conn: Connection, path: PathBuf) -> Result<Self, HiveError> {
        conn.execute_batch(PRAGMAS)
            .map_err(|e| HiveError::Storage(format!("pragmas: {e}")))?;
        conn.execute_batch(CREATE_TABLES)
            .map_err(|e| HiveError::Storage(format!("schema: {e}")))?;

        let version: Option<u32> = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
            .ok();
        if version.is_none() {
            conn.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                [SCHEMA_VERSION],
            )?;
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    /// 创建分区表（幂等）
    pub fn ensure_partition(&self, partition: &Partition) -> Result<(), HiveError> {
        partition.validate()?;
        let table = partition.table_name();
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id TEXT PRIMARY KEY,
                actor_id TEXT NOT NULL REFERENCES actors(id),
                session_id TEXT NOT NULL REFERENCES sessions(id),
                content TEXT NOT NULL,
                embedding BLOB,
                metadata TEXT NOT NULL DEFAULT '{{}}',
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_{table}_session ON {table}(session_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_{table}_actor ON {table}(actor_id, created_at);"
        );
        self.with_conn(|conn| {
            conn.execute_batch(&sql)?;
            Ok(())
        })
    }

    /// 在当前线程持锁执行
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, HiveError>
    where
        F: FnOnce(&Connection) -> Result<T, HiveError>,
    {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// 在阻塞线程池执行只读操作；令牌取消时立即返回 Cancelled
    ///
    /// 已进入执行的语句会跑完（SQLite 不支持中途打断），但结果被丢弃。写入走 `run_write`。
    pub async fn run<F, T>(&self, cancel: &CancellationToken, f: F) -> Result<T, HiveError>
    where
        F: FnOnce(&Connection) -> Result<T, HiveError> + Send + 'static,
        T: Send + 'static,
    {
        if cancel.is_cancelled() {
            return Err(HiveError::Cancelled);
        }
        let db = self.clone();
        let handle = tokio::task::spawn_blocking(move || db.with_conn(f));
        tokio::select! {
            _ = cancel.cancelled() => Err(HiveError::Cancelled),
            joined = handle => joined.map_err(|e| HiveError::Storage(format!("blocking task: {e}")))?,
        }
    }

    /// 写操作：取消只在开始前检查；一旦提交到阻塞线程池就等待其完成，
    /// 返回值与数据库中的实际结果一致
    pub async fn run_write<F, T>(&self, cancel: &CancellationToken, f: F) -> Result<T, HiveError>
    where
        F: FnOnce(&Connection) -> Result<T, HiveError> + Send + 'static,
        T: Send + 'static,
    {
        if cancel.is_cancelled() {
            return Err(HiveError::Cancelled);
        }
        let db = self.clone();
        tokio::task::spawn_blocking(move || db.with_conn(f))
            .await
            .map_err(|e| HiveError::Storage(format!("blocking task: {e}")))?
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
