//! 事件总线：进程内发布/订阅
//!
//! 订阅表由总线统一持有（事件类型 → 有序处理器列表）。`trigger` 同步调用触发时刻已注册的全部处理器；
//! 单个处理器返回错误或 panic 只记录告警，不影响其余处理器。需要异步工作的处理器自行 spawn。

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;

use crate::core::HiveError;
use crate::manager::ManagerId;

/// 事件（不持久化）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventData {
    pub event_type: String,
    pub payload: Value,
    pub source_manager_id: ManagerId,
}

impl EventData {
    pub fn new(event_type: impl Into<String>, payload: Value, source: ManagerId) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            source_manager_id: source,
        }
    }
}

/// 事件处理器
pub type EventHandler = Arc<dyn Fn(&EventData) -> Result<(), HiveError> + Send + Sync>;

/// 订阅句柄，用于取消订阅
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

/// 单次分发结果
#[derive(Debug, Default)]
pub struct DispatchReport {
    pub invoked: usize,
    /// 失败的处理器：(订阅 id, 错误描述)
    pub failures: Vec<(SubscriptionId, String)>,
}

impl DispatchReport {
    pub fn all_succeeded(&self) -> bool {
        self.failures.is_empty()
    }
}

type Registry = HashMap<String, Vec<(SubscriptionId, EventHandler)>>;

/// 事件总线，克隆共享同一订阅表
#[derive(Clone, Default)]
pub struct EventBus {
    handlers: Arc<RwLock<Registry>>,
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// 订阅某类事件；同一类型的处理器按订阅顺序调用
    pub fn register<F>(&self, event_type: impl Into<String>, handler: F) -> SubscriptionId
    where
        F: Fn(&EventData) -> Result<(), HiveError> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let event_type = event_type.into();
        tracing::debug!(event_type = %event_type, subscription = id.0, "event handler registered");
        self.handlers
            .write()
            .entry(event_type)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// 取消订阅，返回是否存在
    pub fn unregister(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write();
        let mut removed = false;
        for list in handlers.values_mut() {
            let before = list.len();
            list.retain(|(sid, _)| *sid != id);
            removed |= list.len() != before;
        }
        handlers.retain(|_, list| !list.is_empty());
        removed
    }

    pub fn handler_count(&self, event_type: &str) -> usize {
        self.handlers.read().get(event_type).map_or(0, Vec::len)
    }

    /// 分发事件：先快照处理器列表再释放锁，处理器内可以再订阅或触发
    pub fn trigger(&self, event: &EventData) -> DispatchReport {
        let snapshot: Vec<(SubscriptionId, EventHandler)> = self
            .handlers
            .read()
            .get(&event.event_type)
            .cloned()
            .unwrap_or_default();

        let mut report = DispatchReport::default();
        for (id, handler) in snapshot {
            report.invoked += 1;
            let failure = match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(panic) => Some(panic_message(panic.as_ref())),
            };
            if let Some(reason) = failure {
                tracing::warn!(
                    event_type = %event.event_type,
                    source = %event.source_manager_id,
                    subscription = id.0,
                    error = %reason,
                    "event handler failed"
                );
                report.failures.push((id, reason));
            }
        }
        report
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    fn event(kind: &str) -> EventData {
        EventData::new(kind, json!({"n": 1}), ManagerId::new("test"))
    }

    #[test]
    fn test_handlers_called_in_registration_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["a", "b", "c"] {
            let seen = Arc::clone(&seen);
            bus.register("ping", move |_| {
                seen.lock().push(tag);
                Ok(())
            });
        }
        bus.register("other", |_| Err(HiveError::Manager("should not run".into())));

        let report = bus.trigger(&event("ping"));
        assert_eq!(report.invoked, 3);
        assert!(report.all_succeeded());
        assert_eq!(*seen.lock(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_failing_handler_isolated() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicU64::new(0));
        bus.register("ping", |_| Err(HiveError::Manager("boom".into())));
        bus.register("ping", |_| panic!("kaboom"));
        let c = Arc::clone(&count);
        bus.register("ping", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let report = bus.trigger(&event("ping"));
        assert_eq!(report.invoked, 3);
        assert_eq!(report.failures.len(), 2);
        assert!(report.failures[1].1.contains("kaboom"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unregister() {
        let bus = EventBus::new();
        let id = bus.register("ping", |_| Ok(()));
        assert_eq!(bus.handler_count("ping"), 1);
        assert!(bus.unregister(id));
        assert!(!bus.unregister(id));
        assert_eq!(bus.trigger(&event("ping")).invoked, 0);
    }

    #[test]
    fn test_handler_may_register_during_dispatch() {
        let bus = EventBus::new();
        let inner = bus.clone();
        bus.register("ping", move |_| {
            inner.register("ping", |_| Ok(()));
            Ok(())
        });
        assert_eq!(bus.trigger(&event("ping")).invoked, 1);
        assert_eq!(bus.trigger(&event("ping")).invoked, 2);
    }
}
