//! Logging setup / 日志初始化

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Default filter when `RUST_LOG` is unset / 默认日志级别
pub const DEFAULT_FILTER: &str = "quote_pool=info";

/// Install the global tracing subscriber / 安装全局日志订阅器
///
/// Returns `false` when a subscriber was already installed (e.g. by the
/// embedding application), which is not an error.
pub fn init() -> bool {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}
