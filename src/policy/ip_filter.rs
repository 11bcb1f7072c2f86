//! # IP Filtering Policy
//!
//! Pure-CPU allowlist/denylist check against the client IP. A non-empty
//! allowlist takes precedence: anything not on it is denied. The denylist
//! is applied second.

use async_trait::async_trait;
use axum::http::request::Parts;

use super::{Policy, PolicyOutcome};
use crate::core::error::GatewayResult;
use crate::core::types::RequestContext;

pub const POLICY_NAME: &str = "ip_filter";

pub struct IpFilterPolicy {
    allowlist: Vec<String>,
    denylist: Vec<String>,
}

impl IpFilterPolicy {
    pub fn new(allowlist: Vec<String>, denylist: Vec<String>) -> Self {
        Self {
            allowlist,
            denylist,
        }
    }
}

#[async_trait]
impl Policy for IpFilterPolicy {
    fn name(&self) -> &str {
        POLICY_NAME
    }

    async fn evaluate(
        &self,
        _head: &Parts,
        ctx: &mut RequestContext,
    ) -> GatewayResult<PolicyOutcome> {
        let ip = ctx.client_ip.as_str();

        if !self.allowlist.is_empty() && !self.allowlist.iter().any(|allowed| allowed == ip) {
            return Ok(PolicyOutcome::deny(
                403,
                "Forbidden",
                "IP address not in allowlist",
            ));
        }

        if self.denylist.iter().any(|denied| denied == ip) {
            return Ok(PolicyOutcome::deny(403, "Forbidden", "IP address blocked"));
        }

        Ok(PolicyOutcome::Allow)
    }
}
