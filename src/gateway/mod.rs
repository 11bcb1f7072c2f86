//! Gateway composition: shared state, the request pipeline, and the HTTP
//! server shell that feeds it.

pub mod pipeline;
pub mod server;

use std::sync::Arc;

use crate::breaker::CircuitBreakerService;
use crate::config::ConfigManager;
use crate::core::settings::GatewaySettings;
use crate::events::EventBus;
use crate::observability::metrics::MetricsRegistry;
use crate::policy::PolicyEngine;
use crate::store::SharedStore;

/// Everything a request handler needs, cheaply cloneable.
#[derive(Clone)]
pub struct GatewayState {
    pub settings: Arc<GatewaySettings>,
    pub config: Arc<ConfigManager>,
    pub policies: Arc<PolicyEngine>,
    pub breakers: Arc<CircuitBreakerService>,
    pub metrics: Arc<MetricsRegistry>,
    pub events: Arc<EventBus>,
    pub store: Arc<dyn SharedStore>,
    pub client: reqwest::Client,
}
