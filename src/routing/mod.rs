//! # Routing Module
//!
//! Route definitions, path-template parsing, and request matching.
//!
//! Patterns use positional parameters in the `/:param` form, e.g.
//! `/api/example/:id`. Matching is longest-literal-prefix first; among
//! routes with equally long literal prefixes, the first-registered route
//! wins. A route with an empty method set accepts every HTTP method.

use std::collections::HashMap;
use std::sync::Arc;

use axum::http::Method;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::breaker::BreakerConfig;
use crate::core::error::{GatewayError, GatewayResult};

/// A named mapping from a request pattern to an upstream target
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Route {
    /// Unique route name; doubles as the breaker service id
    pub name: String,

    /// Path template, e.g. `/api/example/:id`
    pub pattern: String,

    /// Absolute origin URL of the upstream
    pub target: String,

    /// Allowed HTTP methods; empty means all
    #[serde(default)]
    pub methods: Vec<String>,

    /// Ordered policy chain evaluated before forwarding
    #[serde(default)]
    pub policies: Vec<String>,

    /// Optional circuit breaker configuration
    #[serde(default)]
    pub circuit_breaker: Option<BreakerConfig>,

    /// Upstream call timeout in milliseconds
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Retry budget for transport errors and 5xx responses
    #[serde(default)]
    pub retries: Option<u32>,
}

impl Route {
    /// Validate the route's invariants: non-empty unique-able name, a
    /// parseable pattern, and an absolute http(s) target URL.
    pub fn validate(&self) -> GatewayResult<()> {
        if self.name.trim().is_empty() {
            return Err(GatewayError::config("route name must not be empty"));
        }
        RoutePattern::parse(&self.pattern)?;
        let target = Url::parse(&self.target).map_err(|e| {
            GatewayError::config(format!("route '{}': invalid target URL: {}", self.name, e))
        })?;
        if !matches!(target.scheme(), "http" | "https") || target.host_str().is_none() {
            return Err(GatewayError::config(format!(
                "route '{}': target must be an absolute http(s) URL",
                self.name
            )));
        }
        if let Some(breaker) = &self.circuit_breaker {
            breaker.validate().map_err(|e| {
                GatewayError::config(format!("route '{}': {}", self.name, e))
            })?;
        }
        Ok(())
    }

    /// Whether this route accepts the given HTTP method.
    pub fn allows_method(&self, method: &Method) -> bool {
        self.methods.is_empty()
            || self
                .methods
                .iter()
                .any(|m| m.eq_ignore_ascii_case(method.as_str()))
    }
}

/// One segment of a parsed path template
#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Param(String),
}

/// A parsed path template
#[derive(Debug, Clone)]
pub struct RoutePattern {
    segments: Vec<Segment>,
    literal_prefix: String,
}

impl RoutePattern {
    /// Parse a template. Patterns must begin with `/`; a segment starting
    /// with `:` declares a named positional parameter.
    pub fn parse(raw: &str) -> GatewayResult<Self> {
        if !raw.starts_with('/') {
            return Err(GatewayError::config(format!(
                "pattern '{raw}' must start with '/'"
            )));
        }

        let mut segments = Vec::new();
        let mut literal_prefix = String::new();
        let mut in_prefix = true;

        for part in raw.trim_start_matches('/').trim_end_matches('/').split('/') {
            if part.is_empty() {
                if raw == "/" {
                    break;
                }
                return Err(GatewayError::config(format!(
                    "pattern '{raw}' has an empty segment"
                )));
            }
            if let Some(name) = part.strip_prefix(':') {
                if name.is_empty() {
                    return Err(GatewayError::config(format!(
                        "pattern '{raw}' has an unnamed parameter"
                    )));
                }
                in_prefix = false;
                segments.push(Segment::Param(name.to_string()));
            } else {
                if in_prefix {
                    literal_prefix.push('/');
                    literal_prefix.push_str(part);
                }
                segments.push(Segment::Literal(part.to_string()));
            }
        }

        if literal_prefix.is_empty() {
            literal_prefix.push('/');
        }

        Ok(Self {
            segments,
            literal_prefix,
        })
    }

    /// Literal path prefix before the first parameter, used for precedence.
    pub fn literal_prefix(&self) -> &str {
        &self.literal_prefix
    }

    /// Match a concrete path, returning extracted parameters on success.
    pub fn matches(&self, path: &str) -> Option<HashMap<String, String>> {
        let parts: Vec<&str> = match path.trim_start_matches('/').trim_end_matches('/') {
            "" => Vec::new(),
            trimmed => trimmed.split('/').collect(),
        };
        if parts.len() != self.segments.len() {
            return None;
        }

        let mut params = HashMap::new();
        for (segment, part) in self.segments.iter().zip(parts) {
            match segment {
                Segment::Literal(literal) if literal == part => {}
                Segment::Literal(_) => return None,
                Segment::Param(name) => {
                    params.insert(name.clone(), part.to_string());
                }
            }
        }
        Some(params)
    }

    /// Path remainder after the literal prefix, without a leading slash.
    pub fn remainder<'a>(&self, path: &'a str) -> &'a str {
        path.strip_prefix(self.literal_prefix.as_str())
            .unwrap_or(path)
            .trim_start_matches('/')
    }
}

/// A successful route match
#[derive(Debug, Clone)]
pub struct RouteMatch {
    pub route: Arc<Route>,
    pub params: HashMap<String, String>,
    /// Path remainder forwarded to the upstream (no leading slash)
    pub remainder: String,
}

/// Immutable matching table built from the active route list
///
/// Rebuilt by the config manager on every mutation; matching itself is pure
/// CPU and lock-free.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    entries: Vec<(Arc<Route>, RoutePattern)>,
}

impl RouteTable {
    /// Build a table, validating every route.
    pub fn build(routes: &[Route]) -> GatewayResult<Self> {
        let mut entries = Vec::with_capacity(routes.len());
        for route in routes {
            route.validate()?;
            let pattern = RoutePattern::parse(&route.pattern)?;
            entries.push((Arc::new(route.clone()), pattern));
        }
        Ok(Self { entries })
    }

    /// Find the best route for a path + method, or `None` (a 404).
    pub fn find(&self, path: &str, method: &Method) -> Option<RouteMatch> {
        let mut best: Option<(usize, RouteMatch)> = None;
        for (route, pattern) in &self.entries {
            if !route.allows_method(method) {
                continue;
            }
            let Some(params) = pattern.matches(path) else {
                continue;
            };
            let score = pattern.literal_prefix().len();
            // Strictly-greater keeps the first-registered route on ties.
            if best.as_ref().map(|(s, _)| score > *s).unwrap_or(true) {
                best = Some((
                    score,
                    RouteMatch {
                        route: route.clone(),
                        params,
                        remainder: pattern.remainder(path).to_string(),
                    },
                ));
            }
        }
        best.map(|(_, m)| m)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
