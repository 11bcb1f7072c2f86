//! # Edge Gateway - Main Entry Point
//!
//! Bootstraps the gateway: resolves settings from the environment, wires the
//! shared store, breaker service, policy engine, and config manager
//! together, and serves until SIGTERM/SIGINT.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};

use edge_gateway::breaker::CircuitBreakerService;
use edge_gateway::config::ConfigManager;
use edge_gateway::core::error::{GatewayError, GatewayResult};
use edge_gateway::core::settings::GatewaySettings;
use edge_gateway::events::EventBus;
use edge_gateway::gateway::{server, GatewayState};
use edge_gateway::observability::{self, metrics::MetricsRegistry};
use edge_gateway::policy::{AuthenticationPolicy, IpFilterPolicy, PolicyEngine, RateLimitPolicy};
use edge_gateway::store::{RedisStore, SharedStore};

#[tokio::main]
async fn main() {
    let settings = GatewaySettings::from_env();
    observability::init_logging(&settings.log_level);

    info!(version = env!("CARGO_PKG_VERSION"), "starting edge gateway");

    if let Err(e) = run(settings).await {
        error!(error = %e, "gateway startup failed");
        std::process::exit(1);
    }

    info!("gateway shutdown complete");
}

async fn run(settings: GatewaySettings) -> GatewayResult<()> {
    let settings = Arc::new(settings);

    let store: Arc<dyn SharedStore> = Arc::new(RedisStore::new(&settings.store.url())?);
    let events = Arc::new(EventBus::new());
    let metrics = Arc::new(MetricsRegistry::new());
    let breakers = Arc::new(CircuitBreakerService::with_defaults(
        store.clone(),
        events.clone(),
        metrics.clone(),
        settings.default_failure_threshold,
        settings.default_reset_timeout_ms,
    ));

    // Route configuration: store, then file, then seeded default.
    let config = Arc::new(ConfigManager::new(store.clone(), &settings.config_dir));
    config.initialize().await?;
    breakers.sync_routes(&config.get_routes().await).await;

    // Built-in policies; routes reference these by name.
    let policies = Arc::new(PolicyEngine::new());
    policies.register(Arc::new(AuthenticationPolicy::new(&settings)));
    policies.register(Arc::new(RateLimitPolicy::new(
        store.clone(),
        settings.default_rate_limit,
        settings.default_rate_window(),
    )));
    policies.register(Arc::new(IpFilterPolicy::new(
        settings.ip_whitelist.clone(),
        settings.ip_blacklist.clone(),
    )));

    let client = reqwest::Client::builder()
        .build()
        .map_err(|e| GatewayError::internal(format!("failed to build upstream client: {e}")))?;

    let state = GatewayState {
        settings: settings.clone(),
        config,
        policies,
        breakers,
        metrics,
        events,
        store,
        client,
    };

    let listener = TcpListener::bind(("0.0.0.0", settings.port))
        .await
        .map_err(|e| GatewayError::internal(format!("failed to bind port {}: {e}", settings.port)))?;
    server::serve(state, listener, shutdown_signal()).await
}

/// Resolve on SIGTERM or SIGINT.
async fn shutdown_signal() {
    let interrupt = async {
        if let Ok(mut sigint) = signal::unix::signal(signal::unix::SignalKind::interrupt()) {
            sigint.recv().await;
        }
    };
    let terminate = async {
        if let Ok(mut sigterm) = signal::unix::signal(signal::unix::SignalKind::terminate()) {
            sigterm.recv().await;
        }
    };

    tokio::select! {
        _ = interrupt => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
