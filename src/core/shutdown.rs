//! 优雅关闭
//!
//! Ctrl+C / SIGTERM 触发取消令牌；随后按注册顺序执行清理：先停止引擎的后台任务（等待其退出），
//! 再对数据库做 WAL checkpoint。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::core::engine::Engine;
use crate::core::HiveError;
use crate::store::Database;

/// 关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// 用户发起（Ctrl+C 或 exit 命令）
    UserInitiated,
    /// SIGTERM
    Signal,
    FatalError(String),
}

/// 关闭信号管理器
#[derive(Clone)]
pub struct ShutdownManager {
    token: CancellationToken,
    reason_tx: broadcast::Sender<ShutdownReason>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (reason_tx, _) = broadcast::channel(1);
        Self {
            token: CancellationToken::new(),
            reason_tx,
        }
    }

    /// 根令牌；每轮对话可用 `child_token` 派生
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn shutdown(&self, reason: ShutdownReason) {
        tracing::info!(?reason, "shutdown requested");
        let _ = self.reason_tx.send(reason);
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.reason_tx.subscribe()
    }

    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    /// 安装系统信号处理器（Ctrl+C, SIGTERM）
    pub fn install_signal_handlers(&self) {
        let manager = self.clone();
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = self.clone();
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 关闭时的清理任务
#[async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> Result<(), HiveError>;

    /// 用于日志
    fn name(&self) -> &'static str;
}

/// 停止引擎全部后台任务
pub struct BackgroundCleanup {
    engine: Arc<Engine>,
}

impl BackgroundCleanup {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl ShutdownCleanup for BackgroundCleanup {
    async fn cleanup(&self) -> Result<(), HiveError> {
        self.engine.stop_background_processes().await
    }

    fn name(&self) -> &'static str {
        "background-processes"
    }
}

/// 把 WAL 合并回主库文件
pub struct DatabaseCleanup {
    db: Database,
}

impl DatabaseCleanup {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ShutdownCleanup for DatabaseCleanup {
    async fn cleanup(&self) -> Result<(), HiveError> {
        self.db
            .run_write(&CancellationToken::new(), |conn| {
                conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
                Ok(())
            })
            .await
    }

    fn name(&self) -> &'static str {
        "database"
    }
}

/// 关闭协调器：按注册顺序执行清理，每项有超时
pub struct ShutdownCoordinator {
    cleanup_tasks: Vec<Arc<dyn ShutdownCleanup>>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            cleanup_tasks: Vec::new(),
            timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn register<T: ShutdownCleanup + 'static>(&mut self, task: T) {
        self.cleanup_tasks.push(Arc::new(task));
    }

    /// 执行全部清理，返回失败或超时的任务名
    pub async fn run_cleanup(&self) -> Vec<&'static str> {
        tracing::info!(tasks = self.cleanup_tasks.len(), "running cleanup");
        let mut failed = Vec::new();
        for task in &self.cleanup_tasks {
            let name = task.name();
            match tokio::time::timeout(self.timeout, task.cleanup()).await {
                Ok(Ok(())) => tracing::info!(task = name, "cleanup completed"),
                Ok(Err(e)) => {
                    tracing::warn!(task = name, error = %e, "cleanup failed");
                    failed.push(name);
                }
                Err(_) => {
                    tracing::warn!(task = name, timeout = ?self.timeout, "cleanup timed out");
                    failed.push(name);
                }
            }
        }
        failed
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
