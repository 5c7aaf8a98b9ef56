pub mod logger;
pub mod metrics;

pub use logger::setup_logging;
pub use metrics::{MetricsCollector, serve_metrics};
