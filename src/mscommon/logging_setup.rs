//! 日志系统初始化模块
//!
//! 所有子系统通过tracing target区分日志来源，支持RUST_LOG按target过滤。

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// 初始化日志系统，必须在任何其他子系统之前调用
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_names(true),
        )
        .init();
}

/// 安装panic钩子，未捕获的panic先落日志再退出
pub fn install_panic_hook() {
    let original_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        tracing::error!(target: "应用生命周期", panic_info = %panic_info, "程序发生未捕获的Panic");
        original_hook(panic_info);
    }));
}
