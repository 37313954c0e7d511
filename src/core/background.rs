//! 后台任务句柄
//!
//! 启动即返回显式句柄：取消令牌加 JoinHandle。`stop` 发出取消并等待任务完全退出，
//! 保证关闭后没有遗留的写入者。BackgroundSlot 为管理器提供幂等的启动/停止。

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::HiveError;

/// 正在运行的后台任务
pub struct BackgroundTask {
    name: String,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl BackgroundTask {
    /// 启动任务；闭包收到的令牌在 `stop` 时取消
    pub fn spawn<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(f(cancel.clone()));
        tracing::info!(task = %name, "background task started");
        Self {
            name,
            cancel,
            handle,
        }
    }

    /// 按固定间隔执行 `tick`，直到取消；首次执行在一个间隔之后
    pub fn periodic<F, Fut>(name: impl Into<String>, interval: Duration, mut tick: F) -> Self
    where
        F: FnMut(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::spawn(name, move |cancel| async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => tick(cancel.clone()).await,
                }
            }
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// 取消并等待退出；任务 panic 时返回错误
    pub async fn stop(self) -> Result<(), HiveError> {
        self.cancel.cancel();
        let result = self.handle.await;
        tracing::info!(task = %self.name, "background task stopped");
        result.map_err(|e| HiveError::Manager(format!("background task {} failed: {e}", self.name)))
    }
}

/// 至多容纳一个后台任务的槽位
#[derive(Default)]
pub struct BackgroundSlot {
    task: Mutex<Option<BackgroundTask>>,
}

impl BackgroundSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// 槽位为空时启动，返回是否新启动
    pub fn start_with<F>(&self, start: F) -> bool
    where
        F: FnOnce() -> BackgroundTask,
    {
        let mut slot = self.task.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(start());
        true
    }

    /// 停止并等待；槽位为空时什么也不做，返回是否有任务被停止
    pub async fn stop(&self) -> Result<bool, HiveError> {
        let task = self.task.lock().take();
        match task {
            Some(task) => task.stop().await.map(|()| true),
            None => Ok(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|t| !t.is_finished())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_stop_waits_for_quiesce() {
        let done = Arc::new(AtomicUsize::new(0));
        let d = Arc::clone(&done);
        let task = BackgroundTask::spawn("drain", move |cancel| async move {
            cancel.cancelled().await;
            tokio::time::sleep(Duration::from_millis(20)).await;
            d.store(1, Ordering::SeqCst);
        });
        task.stop().await.unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_periodic_ticks_until_stopped() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let t = Arc::clone(&ticks);
        let task = BackgroundTask::periodic("tick", Duration::from_millis(5), move |_| {
            let t = Arc::clone(&t);
            async move {
                t.fetch_add(1, Ordering::SeqCst);
            }
        });
        tokio::time::sleep(Duration::from_millis(60)).await;
        task.stop().await.unwrap();
        let after_stop = ticks.load(Ordering::SeqCst);
        assert!(after_stop >= 1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), after_stop);
    }

    #[tokio::test]
    async fn test_slot_is_idempotent() {
        let slot = BackgroundSlot::new();
        let spawn = || BackgroundTask::spawn("idle", |cancel| async move { cancel.cancelled().await });
        assert!(slot.start_with(spawn));
        assert!(!slot.start_with(spawn));
        assert!(slot.is_running());
        assert!(slot.stop().await.unwrap());
        assert!(!slot.stop().await.unwrap());
        assert!(!slot.is_running());
    }

    #[tokio::test]
    async fn test_panicking_task_reports_error() {
        let task = BackgroundTask::spawn("panics", |_| async { panic!("boom") });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(task.stop().await.is_err());
    }
}
