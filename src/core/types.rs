//! # Core Types
//!
//! Request-scoped context and small shared utilities used across the
//! pipeline, policies, and breaker service.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use uuid::Uuid;

use crate::routing::Route;

/// Context that flows through the pipeline for a single request
///
/// Carries the route binding, extracted path parameters, the client IP, the
/// gateway-assigned request id, a monotonic start timestamp, and a mutable
/// map for downstream annotations (e.g. the authenticated principal).
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Gateway-assigned request id, also echoed as `X-Request-Id`
    pub request_id: String,

    /// Client IP as reported by the transport (or X-Forwarded-For)
    pub client_ip: String,

    /// Matched route, once matching has run
    pub route: Option<Arc<Route>>,

    /// Path parameters extracted from the route pattern
    pub params: HashMap<String, String>,

    /// Monotonic start time for latency measurement
    pub started_at: Instant,

    /// Mutable annotations set by policies (`principal`, rate-limit hints, ...)
    pub data: HashMap<String, serde_json::Value>,
}

impl RequestContext {
    /// Create a fresh context with a generated request id
    pub fn new(client_ip: String) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            client_ip,
            route: None,
            params: HashMap::new(),
            started_at: Instant::now(),
            data: HashMap::new(),
        }
    }

    /// Name of the matched route, if any
    pub fn route_name(&self) -> &str {
        self.route.as_ref().map(|r| r.name.as_str()).unwrap_or("")
    }

    /// Elapsed time since the request entered the pipeline, in seconds
    pub fn elapsed_secs(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }
}

/// Epoch-millisecond clock used for breaker timestamps and store mirroring
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Once-per-interval gate for WARN logs on degraded paths
///
/// Fail-open decisions (store down, distributed mirror unavailable) must be
/// logged at WARN at most once per minute; this gate enforces that with a
/// single atomic compare-and-swap, so the hot path never contends on a lock.
#[derive(Debug)]
pub struct WarnThrottle {
    last_ms: AtomicI64,
    interval_ms: i64,
}

impl WarnThrottle {
    pub fn new(interval_ms: i64) -> Self {
        Self {
            last_ms: AtomicI64::new(0),
            interval_ms,
        }
    }

    /// One-minute throttle, the default for fail-open warnings
    pub fn per_minute() -> Self {
        Self::new(60_000)
    }

    /// Returns true if the caller won the right to log this interval
    pub fn should_log(&self) -> bool {
        let now = now_ms();
        let last = self.last_ms.load(Ordering::Relaxed);
        if now.saturating_sub(last) < self.interval_ms {
            return false;
        }
        self.last_ms
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }
}
