//! Shared helpers for integration tests: a gateway wired against the
//! in-memory store and throwaway upstream servers on ephemeral ports.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tempfile::TempDir;
use tokio::net::TcpListener;

use edge_gateway::breaker::CircuitBreakerService;
use edge_gateway::config::ConfigManager;
use edge_gateway::core::settings::GatewaySettings;
use edge_gateway::events::EventBus;
use edge_gateway::gateway::{server, GatewayState};
use edge_gateway::observability::metrics::MetricsRegistry;
use edge_gateway::policy::{AuthenticationPolicy, IpFilterPolicy, PolicyEngine, RateLimitPolicy};
use edge_gateway::routing::Route;
use edge_gateway::store::{MemoryStore, SharedStore};

/// A running gateway bound to an ephemeral port.
pub struct TestGateway {
    pub base_url: String,
    pub state: GatewayState,
    pub store: Arc<MemoryStore>,
    _config_dir: TempDir,
}

/// Spawn a gateway with the given routes and settings tweaks applied.
pub async fn spawn_gateway(routes: Vec<Route>, settings: GatewaySettings) -> TestGateway {
    spawn_gateway_with_store(routes, settings, Arc::new(MemoryStore::new())).await
}

pub async fn spawn_gateway_with_store(
    routes: Vec<Route>,
    settings: GatewaySettings,
    store: Arc<MemoryStore>,
) -> TestGateway {
    let config_dir = tempfile::tempdir().expect("tempdir");
    let settings = Arc::new(GatewaySettings {
        config_dir: config_dir.path().to_path_buf(),
        ..settings
    });

    let shared: Arc<dyn SharedStore> = store.clone();
    let events = Arc::new(EventBus::new());
    let metrics = Arc::new(MetricsRegistry::new());
    let breakers = Arc::new(CircuitBreakerService::with_defaults(
        shared.clone(),
        events.clone(),
        metrics.clone(),
        settings.default_failure_threshold,
        settings.default_reset_timeout_ms,
    ));

    let config = Arc::new(ConfigManager::new(shared.clone(), config_dir.path()));
    config.initialize().await.expect("config init");
    // Replace the seeded default with the test's routes.
    config.delete_route("default").await.expect("seed delete");
    for route in routes {
        config.add_route(route).await.expect("add route");
    }
    breakers.sync_routes(&config.get_routes().await).await;

    let policies = Arc::new(PolicyEngine::new());
    policies.register(Arc::new(AuthenticationPolicy::new(&settings)));
    policies.register(Arc::new(RateLimitPolicy::new(
        shared.clone(),
        settings.default_rate_limit,
        settings.default_rate_window(),
    )));
    policies.register(Arc::new(IpFilterPolicy::new(
        settings.ip_whitelist.clone(),
        settings.ip_blacklist.clone(),
    )));

    let state = GatewayState {
        settings,
        config,
        policies,
        breakers,
        metrics,
        events,
        store: shared,
        client: reqwest::Client::new(),
    };

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let serve_state = state.clone();
    tokio::spawn(async move {
        server::serve(serve_state, listener, std::future::pending())
            .await
            .expect("serve");
    });

    TestGateway {
        base_url: format!("http://{addr}"),
        state,
        store,
        _config_dir: config_dir,
    }
}

/// Scripted upstream behavior for one request, by 1-based hit number.
pub type UpstreamScript = dyn Fn(usize) -> (u16, String, u64) + Send + Sync;

struct UpstreamState {
    hits: AtomicUsize,
    last_uri: Mutex<Option<String>>,
    last_headers: Mutex<Option<HeaderMap>>,
    script: Box<UpstreamScript>,
}

/// A throwaway upstream server recording what it receives.
pub struct Upstream {
    pub base_url: String,
    state: Arc<UpstreamState>,
}

impl Upstream {
    pub fn hits(&self) -> usize {
        self.state.hits.load(Ordering::SeqCst)
    }

    pub fn last_uri(&self) -> Option<String> {
        self.state.last_uri.lock().unwrap().clone()
    }

    pub fn last_headers(&self) -> Option<HeaderMap> {
        self.state.last_headers.lock().unwrap().clone()
    }
}

async fn upstream_handler(State(state): State<Arc<UpstreamState>>, request: Request<Body>) -> Response {
    let hit = state.hits.fetch_add(1, Ordering::SeqCst) + 1;
    *state.last_uri.lock().unwrap() = Some(request.uri().to_string());
    *state.last_headers.lock().unwrap() = Some(request.headers().clone());

    let (status, body, delay_ms) = (state.script)(hit);
    if delay_ms > 0 {
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    }
    (
        StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        body,
    )
        .into_response()
}

/// Spawn an upstream whose response is scripted per hit number.
pub async fn spawn_upstream<F>(script: F) -> Upstream
where
    F: Fn(usize) -> (u16, String, u64) + Send + Sync + 'static,
{
    let state = Arc::new(UpstreamState {
        hits: AtomicUsize::new(0),
        last_uri: Mutex::new(None),
        last_headers: Mutex::new(None),
        script: Box::new(script),
    });

    let app = Router::new()
        .fallback(upstream_handler)
        .with_state(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr: SocketAddr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("upstream serve");
    });

    Upstream {
        base_url: format!("http://{addr}"),
        state,
    }
}

/// An upstream that always answers 200 with a fixed JSON body.
pub async fn healthy_upstream() -> Upstream {
    spawn_upstream(|_| (200, "{\"ok\":true}".to_string(), 0)).await
}

/// Route builder with sensible test defaults.
pub fn route(name: &str, pattern: &str, target: &str) -> Route {
    Route {
        name: name.to_string(),
        pattern: pattern.to_string(),
        target: target.to_string(),
        methods: Vec::new(),
        policies: Vec::new(),
        circuit_breaker: None,
        timeout_ms: None,
        retries: None,
    }
}
