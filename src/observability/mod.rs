//! 可观测性：tracing 订阅器初始化
//!
//! 日志级别取自 RUST_LOG，未设置时为 info。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// 安装全局订阅器；重复调用时保留已有订阅器
pub fn init() {
    if tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer().with_target(false))
        .try_init()
        .is_err()
    {
        tracing::debug!("tracing subscriber already installed");
    }
}
