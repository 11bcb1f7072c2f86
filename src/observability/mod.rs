//! Observability surface: Prometheus metrics and log initialization.

pub mod metrics;

use tracing_subscriber::EnvFilter;

/// Initialize the tracing subscriber from the configured log level.
///
/// `RUST_LOG` takes precedence when set, so operators can still scope
/// filtering per target.
pub fn init_logging(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("edge_gateway={log_level},tower_http=warn")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
