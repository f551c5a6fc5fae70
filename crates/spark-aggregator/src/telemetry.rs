//! 全局日志订阅器安装入口（`subscriber` 特性）。
//!
//! # 教案式说明
//! - **意图（Why）**：库本身只通过 `tracing` 宏发出事件；宿主或演示程序需要一个一行即可启用的
//!   控制台输出，这里提供 `fmt + EnvFilter` 组合。
//! - **契约（What）**：
//!   - 日志级别读取 `RUST_LOG`，缺省为 `info`；
//!   - 外部已设置全局订阅器时返回 [`TelemetryError::SubscriberAlreadySet`]，绝不覆盖。

use thiserror::Error;
use tracing::dispatcher;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt};

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("a global tracing subscriber is already installed")]
    SubscriberAlreadySet,

    #[error("failed to install global tracing subscriber")]
    SetGlobalSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// 安装 `fmt + EnvFilter` 全局订阅器。
pub fn install_fmt_subscriber() -> Result<(), TelemetryError> {
    if dispatcher::has_been_set() {
        return Err(TelemetryError::SubscriberAlreadySet);
    }
    let subscriber = tracing_subscriber::registry()
        .with(build_env_filter())
        .with(tracing_subscriber::fmt::layer().with_target(true));
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn build_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}
