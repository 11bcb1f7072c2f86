//! # Circuit Breaker Service
//!
//! Per-upstream failure-isolation state machines with optional distributed
//! mirroring through the shared store.
//!
//! Each service id owns an independent breaker; state transitions for a
//! given id are serialized by a per-breaker mutex so that concurrent failure
//! records crossing the threshold together produce exactly one CLOSED->OPEN
//! transition (and one state-change event). The mutex is never held across
//! an await: mirror writes to the shared store happen after the lock is
//! released, because distributed state is advisory for recovery, not for
//! hot-path admission.
//!
//! HALF_OPEN admits a single probe at a time: `is_allowed` latches a probe
//! slot and further admissions are rejected until the probe resolves.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::core::types::{now_ms, WarnThrottle};
use crate::events::{EventBus, TOPIC_FAILURE, TOPIC_RESET, TOPIC_STATE_CHANGE};
use crate::observability::metrics::MetricsRegistry;
use crate::routing::Route;
use crate::store::SharedStore;

/// Minimum time-to-live for mirrored breaker keys
const MIRROR_TTL_FLOOR: Duration = Duration::from_secs(30 * 60);

/// Per-breaker configuration, immutable per registration
///
/// Threshold and reset timeout may be omitted in route JSON, in which case
/// the service-level defaults (from `DEFAULT_FAILURE_THRESHOLD` /
/// `DEFAULT_RESET_TIMEOUT`) apply at registration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BreakerConfig {
    /// Failures required to open the circuit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_threshold: Option<u32>,

    /// How long the circuit stays open before admitting a probe
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_timeout_ms: Option<u64>,

    /// Amount subtracted from the failure count per success while closed
    #[serde(default = "default_successes_before_reset")]
    pub successes_before_reset: u32,

    /// Mirror state to the shared store after every mutation
    #[serde(default)]
    pub distributed: bool,
}

fn default_successes_before_reset() -> u32 {
    1
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: None,
            reset_timeout_ms: None,
            successes_before_reset: 1,
            distributed: false,
        }
    }
}

impl BreakerConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.failure_threshold == Some(0) {
            return Err("failure_threshold must be positive".to_string());
        }
        if self.reset_timeout_ms == Some(0) {
            return Err("reset_timeout_ms must be positive".to_string());
        }
        Ok(())
    }
}

/// The three circuit states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    /// Integer code used in metrics and the shared store (0/1/2)
    pub fn code(self) -> u8 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(CircuitState::Closed),
            1 => Some(CircuitState::Open),
            2 => Some(CircuitState::HalfOpen),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }
}

/// Mutable per-breaker runtime
#[derive(Debug)]
struct BreakerCore {
    state: CircuitState,
    failures: u32,
    last_failure_time: i64,
    next_attempt_time: i64,
    probe_in_flight: bool,
}

impl BreakerCore {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            last_failure_time: 0,
            next_attempt_time: 0,
            probe_in_flight: false,
        }
    }
}

struct Breaker {
    service_id: String,
    config: BreakerConfig,
    // Resolved against the service defaults at registration.
    failure_threshold: u32,
    reset_timeout_ms: u64,
    successes_before_reset: u32,
    core: Mutex<BreakerCore>,
}

impl Breaker {
    fn mirror_ttl(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms * 2).max(MIRROR_TTL_FLOOR)
    }
}

/// Values captured under the lock for mirroring after release
#[derive(Debug, Clone, Copy)]
struct MirrorSnapshot {
    state: CircuitState,
    failures: u32,
    last_failure_time: i64,
    next_attempt_time: i64,
}

/// Health snapshot returned by [`CircuitBreakerService::health`]
#[derive(Debug, Clone, Serialize)]
pub struct BreakerHealth {
    pub state: &'static str,
    pub failures: u32,
    pub last_failure_time: i64,
    pub next_attempt_time: i64,
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
    pub distributed: bool,
}

/// Event payload emitted on every recorded failure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureEvent {
    pub service_id: String,
    pub timestamp: i64,
    pub error_message: String,
    pub error_kind: String,
    pub state_at_failure: String,
}

/// Registry of per-upstream breakers
pub struct CircuitBreakerService {
    breakers: DashMap<String, Arc<Breaker>>,
    store: Arc<dyn SharedStore>,
    events: Arc<EventBus>,
    metrics: Arc<MetricsRegistry>,
    store_warn: WarnThrottle,
    unregistered_warned: DashSet<String>,
    default_failure_threshold: u32,
    default_reset_timeout_ms: u64,
}

fn state_key(service_id: &str) -> String {
    format!("circuit:{service_id}:state")
}
fn failures_key(service_id: &str) -> String {
    format!("circuit:{service_id}:failures")
}
fn last_failure_key(service_id: &str) -> String {
    format!("circuit:{service_id}:lastFailure")
}
fn next_attempt_key(service_id: &str) -> String {
    format!("circuit:{service_id}:nextAttempt")
}

impl CircuitBreakerService {
    pub fn new(
        store: Arc<dyn SharedStore>,
        events: Arc<EventBus>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self::with_defaults(store, events, metrics, 5, 30_000)
    }

    /// Construct with deployment-wide defaults for routes that enable a
    /// breaker without tuning it.
    pub fn with_defaults(
        store: Arc<dyn SharedStore>,
        events: Arc<EventBus>,
        metrics: Arc<MetricsRegistry>,
        default_failure_threshold: u32,
        default_reset_timeout_ms: u64,
    ) -> Self {
        Self {
            breakers: DashMap::new(),
            store,
            events,
            metrics,
            store_warn: WarnThrottle::per_minute(),
            unregistered_warned: DashSet::new(),
            default_failure_threshold: default_failure_threshold.max(1),
            default_reset_timeout_ms: default_reset_timeout_ms.max(1),
        }
    }

    /// Register a breaker for a service, replacing any existing one.
    ///
    /// In distributed mode the breaker hydrates from the shared store so a
    /// freshly started instance honors circuits opened elsewhere.
    pub async fn register(&self, service_id: &str, config: BreakerConfig) {
        let mut core = BreakerCore::new();
        if config.distributed {
            self.hydrate(service_id, &mut core).await;
        }
        self.metrics.set_breaker_state(service_id, core.state.code());
        let failure_threshold = config
            .failure_threshold
            .unwrap_or(self.default_failure_threshold);
        let reset_timeout_ms = config
            .reset_timeout_ms
            .unwrap_or(self.default_reset_timeout_ms);
        self.breakers.insert(
            service_id.to_string(),
            Arc::new(Breaker {
                service_id: service_id.to_string(),
                failure_threshold,
                reset_timeout_ms,
                successes_before_reset: config.successes_before_reset,
                config,
                core: Mutex::new(core),
            }),
        );
    }

    /// Register breakers for every route that configures one.
    pub async fn sync_routes(&self, routes: &[Route]) {
        for route in routes {
            if let Some(config) = &route.circuit_breaker {
                let replace = self
                    .breakers
                    .get(&route.name)
                    .map(|b| b.config != *config)
                    .unwrap_or(true);
                if replace {
                    self.register(&route.name, config.clone()).await;
                }
            }
        }
    }

    pub fn is_registered(&self, service_id: &str) -> bool {
        self.breakers.contains_key(service_id)
    }

    /// Admission decision for a service.
    ///
    /// CLOSED admits; OPEN admits only once the reset timeout has elapsed,
    /// promoting to HALF_OPEN as a side effect; HALF_OPEN admits a single
    /// probe. An unregistered service is always admitted, logged once.
    pub async fn is_allowed(&self, service_id: &str) -> bool {
        let Some(breaker) = self.breakers.get(service_id).map(|b| Arc::clone(b.value())) else {
            if self.unregistered_warned.insert(service_id.to_string()) {
                warn!(service_id, "no circuit breaker registered; admitting all traffic");
            }
            return true;
        };

        let now = now_ms();
        let (allowed, transition, snapshot) = {
            let mut core = breaker.core.lock().unwrap_or_else(|e| e.into_inner());
            match core.state {
                CircuitState::Closed => (true, None, None),
                CircuitState::HalfOpen => {
                    if core.probe_in_flight {
                        (false, None, None)
                    } else {
                        core.probe_in_flight = true;
                        (true, None, None)
                    }
                }
                CircuitState::Open => {
                    if now >= core.next_attempt_time {
                        core.state = CircuitState::HalfOpen;
                        core.probe_in_flight = true;
                        (
                            true,
                            Some((CircuitState::Open, CircuitState::HalfOpen)),
                            Some(snapshot_of(&core)),
                        )
                    } else {
                        (false, None, None)
                    }
                }
            }
        };

        if let Some((from, to)) = transition {
            self.on_transition(&breaker, from, to);
        }
        if let Some(snapshot) = snapshot {
            self.mirror(&breaker, snapshot).await;
        }
        allowed
    }

    /// Record a successful upstream call.
    pub async fn record_success(&self, service_id: &str) {
        let Some(breaker) = self.breakers.get(service_id).map(|b| Arc::clone(b.value())) else {
            return;
        };

        let (transition, snapshot) = {
            let mut core = breaker.core.lock().unwrap_or_else(|e| e.into_inner());
            match core.state {
                CircuitState::Closed => {
                    if core.failures > 0 {
                        core.failures = core
                            .failures
                            .saturating_sub(breaker.successes_before_reset);
                        (None, Some(snapshot_of(&core)))
                    } else {
                        (None, None)
                    }
                }
                CircuitState::HalfOpen => {
                    core.state = CircuitState::Closed;
                    core.failures = 0;
                    core.next_attempt_time = 0;
                    core.probe_in_flight = false;
                    (
                        Some((CircuitState::HalfOpen, CircuitState::Closed)),
                        Some(snapshot_of(&core)),
                    )
                }
                // A success landing while open is a late probe result that
                // lost the race; it must not reopen the admission path.
                CircuitState::Open => (None, None),
            }
        };

        self.metrics.record_breaker_success(service_id);
        if let Some((from, to)) = transition {
            self.on_transition(&breaker, from, to);
        }
        if let Some(snapshot) = snapshot {
            self.mirror(&breaker, snapshot).await;
        }
    }

    /// Record a failed upstream call.
    pub async fn record_failure(&self, service_id: &str, error_kind: &str, error_message: &str) {
        let Some(breaker) = self.breakers.get(service_id).map(|b| Arc::clone(b.value())) else {
            return;
        };

        let now = now_ms();
        let (state_at_failure, transition, snapshot) = {
            let mut core = breaker.core.lock().unwrap_or_else(|e| e.into_inner());
            let state_at_failure = core.state;
            core.failures = core.failures.saturating_add(1);
            core.last_failure_time = now;
            let transition = match core.state {
                CircuitState::Closed if core.failures >= breaker.failure_threshold => {
                    core.state = CircuitState::Open;
                    core.next_attempt_time = now + breaker.reset_timeout_ms as i64;
                    Some((CircuitState::Closed, CircuitState::Open))
                }
                CircuitState::HalfOpen => {
                    core.state = CircuitState::Open;
                    core.next_attempt_time = now + breaker.reset_timeout_ms as i64;
                    core.probe_in_flight = false;
                    Some((CircuitState::HalfOpen, CircuitState::Open))
                }
                _ => None,
            };
            (state_at_failure, transition, snapshot_of(&core))
        };

        self.metrics.record_breaker_failure(service_id, error_kind);
        let event = FailureEvent {
            service_id: service_id.to_string(),
            timestamp: now,
            error_message: error_message.to_string(),
            error_kind: error_kind.to_string(),
            state_at_failure: state_at_failure.label().to_string(),
        };
        self.events
            .publish(TOPIC_FAILURE, &serde_json::to_value(&event).unwrap_or_default());

        if let Some((from, to)) = transition {
            self.on_transition(&breaker, from, to);
        }
        self.mirror(&breaker, snapshot).await;
    }

    /// Force a breaker back to CLOSED, clearing its counters.
    pub async fn reset(&self, service_id: &str) {
        let Some(breaker) = self.breakers.get(service_id).map(|b| Arc::clone(b.value())) else {
            return;
        };

        let (transition, snapshot) = {
            let mut core = breaker.core.lock().unwrap_or_else(|e| e.into_inner());
            let from = core.state;
            core.state = CircuitState::Closed;
            core.failures = 0;
            core.last_failure_time = 0;
            core.next_attempt_time = 0;
            core.probe_in_flight = false;
            let transition = (from != CircuitState::Closed)
                .then_some((from, CircuitState::Closed));
            (transition, snapshot_of(&core))
        };

        self.events.publish(
            TOPIC_RESET,
            &json!({ "service_id": service_id, "timestamp": now_ms() }),
        );
        if let Some((from, to)) = transition {
            self.on_transition(&breaker, from, to);
        } else {
            self.metrics
                .set_breaker_state(service_id, CircuitState::Closed.code());
        }
        self.mirror(&breaker, snapshot).await;
    }

    /// Current state of every registered breaker.
    pub fn health(&self) -> HashMap<String, BreakerHealth> {
        self.breakers
            .iter()
            .map(|entry| {
                let breaker = entry.value();
                let core = breaker.core.lock().unwrap_or_else(|e| e.into_inner());
                (
                    entry.key().clone(),
                    BreakerHealth {
                        state: core.state.label(),
                        failures: core.failures,
                        last_failure_time: core.last_failure_time,
                        next_attempt_time: core.next_attempt_time,
                        failure_threshold: breaker.failure_threshold,
                        reset_timeout_ms: breaker.reset_timeout_ms,
                        distributed: breaker.config.distributed,
                    },
                )
            })
            .collect()
    }

    /// Current state of one breaker (for tests and admission diagnostics).
    pub fn state_of(&self, service_id: &str) -> Option<CircuitState> {
        self.breakers.get(service_id).map(|breaker| {
            let core = breaker.core.lock().unwrap_or_else(|e| e.into_inner());
            core.state
        })
    }

    fn on_transition(&self, breaker: &Breaker, from: CircuitState, to: CircuitState) {
        info!(
            service_id = %breaker.service_id,
            from = from.label(),
            to = to.label(),
            "circuit state change"
        );
        self.metrics.set_breaker_state(&breaker.service_id, to.code());
        self.events.publish(
            TOPIC_STATE_CHANGE,
            &json!({
                "service_id": breaker.service_id,
                "from": from.label(),
                "to": to.label(),
                "timestamp": now_ms(),
            }),
        );
    }

    /// Write the breaker's runtime to the shared store in one atomic multi-op.
    ///
    /// Failures degrade to local-only operation with a throttled WARN.
    async fn mirror(&self, breaker: &Breaker, snapshot: MirrorSnapshot) {
        if !breaker.config.distributed {
            return;
        }
        let entries = vec![
            (
                state_key(&breaker.service_id),
                (snapshot.state.code() as i64).to_string(),
            ),
            (
                failures_key(&breaker.service_id),
                snapshot.failures.to_string(),
            ),
            (
                last_failure_key(&breaker.service_id),
                snapshot.last_failure_time.to_string(),
            ),
            (
                next_attempt_key(&breaker.service_id),
                snapshot.next_attempt_time.to_string(),
            ),
        ];
        if let Err(e) = self
            .store
            .set_many_with_expiry(&entries, breaker.mirror_ttl())
            .await
        {
            if self.store_warn.should_log() {
                warn!(
                    service_id = %breaker.service_id,
                    error = %e,
                    "breaker mirror write failed; continuing with local state"
                );
            }
        }
    }

    /// Adopt state previously mirrored to the shared store, if any.
    async fn hydrate(&self, service_id: &str, core: &mut BreakerCore) {
        let read = async {
            let state = crate::store::get_i64(self.store.as_ref(), &state_key(service_id)).await?;
            let failures =
                crate::store::get_i64(self.store.as_ref(), &failures_key(service_id)).await?;
            let last_failure =
                crate::store::get_i64(self.store.as_ref(), &last_failure_key(service_id)).await?;
            let next_attempt =
                crate::store::get_i64(self.store.as_ref(), &next_attempt_key(service_id)).await?;
            Ok::<_, crate::store::StoreError>((state, failures, last_failure, next_attempt))
        };

        match read.await {
            Ok((Some(state_code), failures, last_failure, next_attempt)) => {
                if let Some(state) = CircuitState::from_code(state_code) {
                    core.state = state;
                    core.failures = failures.unwrap_or(0).max(0) as u32;
                    core.last_failure_time = last_failure.unwrap_or(0);
                    core.next_attempt_time = next_attempt.unwrap_or(0);
                    info!(
                        service_id,
                        state = state.label(),
                        "hydrated breaker from shared store"
                    );
                }
            }
            Ok((None, _, _, _)) => {}
            Err(e) => {
                if self.store_warn.should_log() {
                    warn!(
                        service_id,
                        error = %e,
                        "breaker hydration failed; starting closed"
                    );
                }
            }
        }
    }
}

fn snapshot_of(core: &BreakerCore) -> MirrorSnapshot {
    MirrorSnapshot {
        state: core.state,
        failures: core.failures,
        last_failure_time: core.last_failure_time,
        next_attempt_time: core.next_attempt_time,
    }
}
