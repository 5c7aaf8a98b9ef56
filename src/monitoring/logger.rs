use anyhow::Result;
use tracing::Level;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// 初始化日志；`RUST_LOG` 优先于配置的级别
pub fn setup_logging(log_level: &str, format: &str) -> Result<()> {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("redirector={}", level)));

    let registry = tracing_subscriber::registry().with(env_filter);

    match format {
        "compact" => registry
            .with(fmt::layer().with_target(true).compact())
            .try_init()?,
        _ => registry
            .with(fmt::layer().with_target(true).with_thread_names(true))
            .try_init()?,
    }

    Ok(())
}
