//! 日志初始化
//!
//! 库内部只使用 `tracing` 宏；是否安装 subscriber 由嵌入方决定。
//! `init` 可重复调用，已安装时直接返回。

use tracing_subscriber::EnvFilter;

/// 默认过滤级别，`RUST_LOG` 优先
pub const DEFAULT_FILTER: &str = "article_sync=info";

/// 安装 fmt subscriber，返回本次是否真正安装
pub fn init(default_filter: Option<&str>) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter.unwrap_or(DEFAULT_FILTER)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}

/// 测试用：输出到测试捕获的 writer
pub fn init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("article_sync=debug")),
        )
        .with_test_writer()
        .try_init();
}
