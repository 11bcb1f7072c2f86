//! # Policy Engine
//!
//! Registry of named policies and ordered-chain evaluation. A policy is a
//! predicate over the request head and context that either allows the
//! request or denies it with an HTTP status. Dispatch is by name through a
//! single registry map; registration replaces, and unknown names in a chain
//! are skipped with a warning rather than treated as denials.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use axum::http::request::Parts;
use tracing::{error, info, warn};

use crate::core::error::GatewayResult;
use crate::core::types::RequestContext;

pub mod authentication;
pub mod ip_filter;
pub mod rate_limit;

pub use authentication::AuthenticationPolicy;
pub use ip_filter::IpFilterPolicy;
pub use rate_limit::RateLimitPolicy;

/// Result of a single policy evaluation
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyOutcome {
    Allow,
    Deny {
        status_code: u16,
        error: String,
        reason: String,
    },
}

impl PolicyOutcome {
    /// Convenience constructor for denials
    pub fn deny(status_code: u16, error: &str, reason: &str) -> Self {
        Self::Deny {
            status_code,
            error: error.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Decision produced by evaluating a policy chain
#[derive(Debug, Clone, PartialEq)]
pub enum ChainDecision {
    Allowed,
    Denied {
        status_code: u16,
        error: String,
        reason: String,
        policy_name: String,
    },
}

/// A named allow/deny predicate over a request
#[async_trait]
pub trait Policy: Send + Sync {
    fn name(&self) -> &str;

    /// Evaluate the policy. `Err` means the policy itself failed (a 500 to
    /// the client), not that the request was denied.
    async fn evaluate(
        &self,
        head: &Parts,
        ctx: &mut RequestContext,
    ) -> GatewayResult<PolicyOutcome>;
}

/// Registry + evaluator for named policy chains
#[derive(Default)]
pub struct PolicyEngine {
    policies: RwLock<HashMap<String, Arc<dyn Policy>>>,
}

impl PolicyEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a policy; re-registration of an existing name replaces it.
    pub fn register(&self, policy: Arc<dyn Policy>) {
        let mut policies = self.policies.write().unwrap_or_else(|e| e.into_inner());
        policies.insert(policy.name().to_string(), policy);
    }

    pub fn is_registered(&self, name: &str) -> bool {
        let policies = self.policies.read().unwrap_or_else(|e| e.into_inner());
        policies.contains_key(name)
    }

    /// Evaluate a named chain in order.
    ///
    /// The first denial short-circuits. A missing name is logged and
    /// skipped. A policy that fails internally aborts the chain with a 500
    /// and the offending policy name attached.
    pub async fn apply(
        &self,
        policy_names: &[String],
        head: &Parts,
        ctx: &mut RequestContext,
    ) -> ChainDecision {
        for name in policy_names {
            let policy = {
                let policies = self.policies.read().unwrap_or_else(|e| e.into_inner());
                policies.get(name).cloned()
            };
            let Some(policy) = policy else {
                warn!(policy = %name, "policy not registered; skipping");
                continue;
            };

            match policy.evaluate(head, ctx).await {
                Ok(PolicyOutcome::Allow) => {}
                Ok(PolicyOutcome::Deny {
                    status_code,
                    error,
                    reason,
                }) => {
                    info!(
                        policy = %name,
                        status_code,
                        reason = %reason,
                        request_id = %ctx.request_id,
                        "policy denied request"
                    );
                    return ChainDecision::Denied {
                        status_code,
                        error,
                        reason,
                        policy_name: name.clone(),
                    };
                }
                Err(e) => {
                    error!(
                        policy = %name,
                        error = %e,
                        request_id = %ctx.request_id,
                        "policy evaluation failed"
                    );
                    return ChainDecision::Denied {
                        status_code: 500,
                        error: "Internal Server Error".to_string(),
                        reason: "Error evaluating policy".to_string(),
                        policy_name: name.clone(),
                    };
                }
            }
        }
        ChainDecision::Allowed
    }
}
