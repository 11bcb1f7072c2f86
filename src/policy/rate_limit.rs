//! # Rate Limiting Policy
//!
//! Fixed tumbling-window limiter keyed by `ratelimit:{route}:{ip}` in the
//! shared store. The counter is read first (a request at or over the limit
//! is denied without incrementing), then atomically incremented; the window
//! expiry is set when the counter transitions 0 -> 1.
//!
//! If the shared store is unreachable the policy fails open: availability
//! is preferred over strict enforcement, and the degradation is logged at
//! WARN at most once per minute.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::request::Parts;
use tracing::{debug, warn};

use super::{Policy, PolicyOutcome};
use crate::core::error::GatewayResult;
use crate::core::types::{RequestContext, WarnThrottle};
use crate::store::{SharedStore, StoreError};

pub const POLICY_NAME: &str = "rate_limit";

/// Context keys that override the configured defaults per request
pub const LIMIT_KEY: &str = "rate_limit";
pub const WINDOW_KEY: &str = "rate_window";

pub struct RateLimitPolicy {
    store: Arc<dyn SharedStore>,
    default_limit: u64,
    default_window: Duration,
    store_warn: WarnThrottle,
}

impl RateLimitPolicy {
    pub fn new(store: Arc<dyn SharedStore>, default_limit: u64, default_window: Duration) -> Self {
        Self {
            store,
            default_limit,
            default_window,
            store_warn: WarnThrottle::per_minute(),
        }
    }

    fn limit_for(&self, ctx: &RequestContext) -> u64 {
        ctx.data
            .get(LIMIT_KEY)
            .and_then(|v| v.as_u64())
            .unwrap_or(self.default_limit)
    }

    fn window_for(&self, ctx: &RequestContext) -> Duration {
        ctx.data
            .get(WINDOW_KEY)
            .and_then(|v| v.as_u64())
            .map(Duration::from_secs)
            .unwrap_or(self.default_window)
    }

    async fn check(&self, key: &str, limit: u64, window: Duration) -> Result<bool, StoreError> {
        let current = crate::store::get_i64(self.store.as_ref(), key)
            .await?
            .unwrap_or(0);
        if current >= limit as i64 {
            return Ok(false);
        }
        let count = self.store.incr(key).await?;
        if count == 1 {
            self.store.expire(key, window).await?;
        }
        Ok(true)
    }
}

#[async_trait]
impl Policy for RateLimitPolicy {
    fn name(&self) -> &str {
        POLICY_NAME
    }

    async fn evaluate(
        &self,
        _head: &Parts,
        ctx: &mut RequestContext,
    ) -> GatewayResult<PolicyOutcome> {
        let key = format!("ratelimit:{}:{}", ctx.route_name(), ctx.client_ip);
        let limit = self.limit_for(ctx);
        let window = self.window_for(ctx);

        match self.check(&key, limit, window).await {
            Ok(true) => Ok(PolicyOutcome::Allow),
            Ok(false) => {
                debug!(key = %key, limit, "rate limit exceeded");
                Ok(PolicyOutcome::deny(
                    429,
                    "Too Many Requests",
                    "Rate limit exceeded",
                ))
            }
            Err(e) => {
                if self.store_warn.should_log() {
                    warn!(error = %e, "rate limit store unavailable; failing open");
                }
                Ok(PolicyOutcome::Allow)
            }
        }
    }
}
