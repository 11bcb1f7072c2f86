//! # Edge Gateway
//!
//! An API gateway core: route matching, an ordered policy chain
//! (authentication, rate limiting, IP filtering), per-upstream circuit
//! breakers with optional distributed coordination through a shared
//! key/value store, and a Prometheus metrics surface.

pub mod breaker;
pub mod config;
pub mod core;
pub mod events;
pub mod gateway;
pub mod observability;
pub mod policy;
pub mod routing;
pub mod store;

pub use crate::breaker::{BreakerConfig, CircuitBreakerService, CircuitState};
pub use crate::config::ConfigManager;
pub use crate::core::error::{GatewayError, GatewayResult};
pub use crate::core::settings::GatewaySettings;
pub use crate::events::EventBus;
pub use crate::gateway::GatewayState;
pub use crate::observability::metrics::MetricsRegistry;
pub use crate::policy::PolicyEngine;
pub use crate::routing::Route;
