//! 可观测性

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 日志输出到 stderr（stdout 留给 JSON 报告）；默认 info，verbose 为 debug，RUST_LOG 优先
pub fn init(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init();
}
