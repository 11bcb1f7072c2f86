//! # Authentication Policy
//!
//! Verifies the `Authorization` header. Two schemes are supported:
//!
//! - `Bearer <jwt>` -- verified with the startup-configured secret.
//!   Signature and expiry are always validated; the issuer claim is
//!   validated when an expected issuer is configured. Only HS256 is
//!   accepted, so alg-confusion tokens (including `none`) fail closed.
//!   Decoded claims are stored in the context under `principal`.
//! - `ApiKey <key>` -- compared against the startup-configured key in
//!   constant time.
//!
//! Secrets are resolved once at startup and baked into the policy; nothing
//! here reads the environment at request time.

use async_trait::async_trait;
use axum::http::request::Parts;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use subtle::ConstantTimeEq;
use tracing::debug;

use super::{Policy, PolicyOutcome};
use crate::core::error::GatewayResult;
use crate::core::settings::GatewaySettings;
use crate::core::types::RequestContext;

pub const POLICY_NAME: &str = "authentication";

/// Context key under which decoded JWT claims are stored
pub const PRINCIPAL_KEY: &str = "principal";

pub struct AuthenticationPolicy {
    decoding_key: Option<DecodingKey>,
    validation: Validation,
    api_key: Option<String>,
}

impl AuthenticationPolicy {
    pub fn new(settings: &GatewaySettings) -> Self {
        let decoding_key = settings
            .jwt_secret
            .as_ref()
            .map(|secret| DecodingKey::from_secret(secret.as_bytes()));

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        if let Some(issuer) = &settings.jwt_issuer {
            validation.set_issuer(&[issuer]);
        }

        Self {
            decoding_key,
            validation,
            api_key: settings.api_key.clone(),
        }
    }

    fn check_bearer(&self, token: &str, ctx: &mut RequestContext) -> PolicyOutcome {
        let Some(key) = &self.decoding_key else {
            return PolicyOutcome::deny(401, "Unauthorized", "JWT authentication not configured");
        };
        match jsonwebtoken::decode::<serde_json::Value>(token, key, &self.validation) {
            Ok(data) => {
                debug!(request_id = %ctx.request_id, "JWT verified");
                ctx.data.insert(PRINCIPAL_KEY.to_string(), data.claims);
                PolicyOutcome::Allow
            }
            Err(e) => {
                debug!(request_id = %ctx.request_id, error = %e, "JWT rejected");
                PolicyOutcome::deny(401, "Unauthorized", "Invalid or expired token")
            }
        }
    }

    fn check_api_key(&self, presented: &str) -> PolicyOutcome {
        let Some(expected) = &self.api_key else {
            return PolicyOutcome::deny(401, "Unauthorized", "API key authentication not configured");
        };
        if presented.as_bytes().ct_eq(expected.as_bytes()).into() {
            PolicyOutcome::Allow
        } else {
            PolicyOutcome::deny(401, "Unauthorized", "Invalid API key")
        }
    }
}

#[async_trait]
impl Policy for AuthenticationPolicy {
    fn name(&self) -> &str {
        POLICY_NAME
    }

    async fn evaluate(
        &self,
        head: &Parts,
        ctx: &mut RequestContext,
    ) -> GatewayResult<PolicyOutcome> {
        let header = head
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());

        let Some(value) = header else {
            return Ok(PolicyOutcome::deny(
                401,
                "Unauthorized",
                "Missing authentication header",
            ));
        };

        if let Some(token) = value.strip_prefix("Bearer ") {
            Ok(self.check_bearer(token, ctx))
        } else if let Some(key) = value.strip_prefix("ApiKey ") {
            Ok(self.check_api_key(key))
        } else {
            Ok(PolicyOutcome::deny(
                401,
                "Unauthorized",
                "Unsupported authentication scheme",
            ))
        }
    }
}
