//! # Gateway Pipeline
//!
//! The composition point for every inbound request: match a route, evaluate
//! its policy chain, consult the circuit breaker, forward to the upstream,
//! and record telemetry. The pipeline never returns an error -- every
//! failure mode is converted into a JSON error response here.

use std::net::IpAddr;
use std::time::Duration;

use axum::body::Body;
use axum::http::header::{HeaderName, HeaderValue, HOST};
use axum::http::{request::Parts, HeaderMap, Request, Response, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use bytes::Bytes;
use serde_json::json;
use tracing::{debug, warn};
use url::Url;

use crate::core::error::GatewayError;
use crate::core::types::RequestContext;
use crate::gateway::GatewayState;
use crate::policy::ChainDecision;
use crate::routing::RouteMatch;

/// Upstream timeout applied when a route does not set one
const DEFAULT_UPSTREAM_TIMEOUT_MS: u64 = 30_000;

/// Fixed pause between retry attempts
const RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Largest request body the gateway will buffer for forwarding
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Route label recorded for requests that matched nothing
const UNMATCHED_ROUTE: &str = "unmatched";

const REQUEST_ID_HEADER: &str = "x-request-id";
const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

/// Hop-by-hop headers that never cross the proxy boundary
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Handle one request end to end.
pub async fn handle(state: &GatewayState, request: Request<Body>, peer_ip: IpAddr) -> Response<Body> {
    let (parts, body) = request.into_parts();

    let client_ip = client_ip_of(&parts.headers, peer_ip);
    let mut ctx = RequestContext::new(client_ip);
    let method_label = parts.method.to_string();

    let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return error_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                "Payload Too Large",
                "request body exceeds the forwarding limit",
                &ctx.request_id,
            );
        }
    };

    // Step 2: route matching. Unmatched requests are a 404, not a policy
    // decision.
    let Some(matched) = state
        .config
        .match_route(parts.uri.path(), &parts.method)
        .await
    else {
        let response = error_response(
            StatusCode::NOT_FOUND,
            "Not Found",
            "no route matches this request",
            &ctx.request_id,
        );
        state.metrics.record_request(
            UNMATCHED_ROUTE,
            &method_label,
            response.status().as_u16(),
            ctx.elapsed_secs(),
        );
        return response;
    };

    ctx.route = Some(matched.route.clone());
    ctx.params = matched.params.clone();
    let route_name = matched.route.name.clone();
    debug!(
        request_id = %ctx.request_id,
        route = %route_name,
        path = %parts.uri.path(),
        "route matched"
    );

    // Routes can gain a breaker config through a CRUD mutation after
    // startup; registration is reconciled lazily here.
    if matched.route.circuit_breaker.is_some() && !state.breakers.is_registered(&route_name) {
        state
            .breakers
            .sync_routes(std::slice::from_ref(matched.route.as_ref()))
            .await;
    }

    // Step 3: the policy chain. First denial wins.
    if let ChainDecision::Denied {
        status_code,
        error,
        reason,
        policy_name,
    } = state
        .policies
        .apply(&matched.route.policies, &parts, &mut ctx)
        .await
    {
        let status =
            StatusCode::from_u16(status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut body = json!({ "error": error, "reason": reason });
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            body["policy"] = json!(policy_name);
        }
        let response = with_request_id((status, Json(body)).into_response(), &ctx.request_id);
        state.metrics.record_request(
            &route_name,
            &method_label,
            status.as_u16(),
            ctx.elapsed_secs(),
        );
        return response;
    }

    // Step 4: breaker admission. Open circuits fail fast without touching
    // the upstream.
    if !state.breakers.is_allowed(&route_name).await {
        state.metrics.record_breaker_rejection(&route_name);
        let response = error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "Service Unavailable",
            "circuit open",
            &ctx.request_id,
        );
        state.metrics.record_request(
            &route_name,
            &method_label,
            response.status().as_u16(),
            ctx.elapsed_secs(),
        );
        return response;
    }

    // Step 5: forward, recording the final outcome against the breaker.
    let response = match forward(state, &parts, body, &matched, &ctx).await {
        Ok(forwarded) => {
            if forwarded.status.as_u16() >= 500 {
                state
                    .breakers
                    .record_failure(
                        &route_name,
                        "status_5xx",
                        &format!("upstream returned {}", forwarded.status.as_u16()),
                    )
                    .await;
            } else {
                state.breakers.record_success(&route_name).await;
            }
            upstream_response(forwarded, &ctx.request_id)
        }
        Err(failure) => {
            if failure.counts_against_breaker {
                state
                    .breakers
                    .record_failure(
                        &route_name,
                        failure.error.kind_label(),
                        &failure.error.to_string(),
                    )
                    .await;
            } else {
                // Headers arrived, so the upstream answered; recording a
                // success releases a half-open probe slot.
                state.breakers.record_success(&route_name).await;
            }
            with_request_id(failure.error.into_response(), &ctx.request_id)
        }
    };

    // Step 6: telemetry, then hand the response back.
    state.metrics.record_request(
        &route_name,
        &method_label,
        response.status().as_u16(),
        ctx.elapsed_secs(),
    );
    response
}

/// A completed upstream exchange
struct Forwarded {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

/// A failed upstream exchange
struct ForwardFailure {
    error: GatewayError,
    /// False once response headers were received; an abandoned body read is
    /// not evidence that the upstream is unhealthy.
    counts_against_breaker: bool,
}

/// Forward the request to the route's target, retrying transport errors and
/// 5xx responses up to the route's retry budget.
async fn forward(
    state: &GatewayState,
    parts: &Parts,
    body: Bytes,
    matched: &RouteMatch,
    ctx: &RequestContext,
) -> Result<Forwarded, ForwardFailure> {
    let route = &matched.route;
    let timeout_ms = route.timeout_ms.unwrap_or(DEFAULT_UPSTREAM_TIMEOUT_MS);
    let retries = route.retries.unwrap_or(0);

    let url = match upstream_url(&route.target, &matched.remainder, parts.uri.query()) {
        Ok(url) => url,
        Err(e) => {
            return Err(ForwardFailure {
                error: GatewayError::UpstreamTransport {
                    service_id: route.name.clone(),
                    message: e,
                },
                counts_against_breaker: true,
            });
        }
    };

    let headers = egress_headers(&parts.headers, &ctx.request_id, &ctx.client_ip);

    let mut last_error: Option<GatewayError> = None;
    for attempt in 0..=retries {
        if attempt > 0 {
            tokio::time::sleep(RETRY_BACKOFF).await;
            debug!(
                request_id = %ctx.request_id,
                attempt,
                route = %route.name,
                "retrying upstream call"
            );
        }

        let send_result = state
            .client
            .request(parts.method.clone(), url.clone())
            .headers(headers.clone())
            .body(body.clone())
            .timeout(Duration::from_millis(timeout_ms))
            .send()
            .await;

        match send_result {
            Ok(upstream) => {
                let status = upstream.status();
                if status.as_u16() >= 500 && attempt < retries {
                    last_error = None;
                    continue;
                }
                let response_headers = upstream.headers().clone();
                match upstream.bytes().await {
                    Ok(bytes) => {
                        return Ok(Forwarded {
                            status,
                            headers: response_headers,
                            body: bytes,
                        });
                    }
                    Err(e) if e.is_timeout() => {
                        return Err(ForwardFailure {
                            error: GatewayError::UpstreamTimeout {
                                service_id: route.name.clone(),
                                timeout_ms,
                            },
                            counts_against_breaker: true,
                        });
                    }
                    Err(e) => {
                        // Headers already arrived; the upstream answered.
                        return Err(ForwardFailure {
                            error: GatewayError::UpstreamTransport {
                                service_id: route.name.clone(),
                                message: format!("response body read failed: {e}"),
                            },
                            counts_against_breaker: false,
                        });
                    }
                }
            }
            Err(e) => {
                let error = if e.is_timeout() {
                    GatewayError::UpstreamTimeout {
                        service_id: route.name.clone(),
                        timeout_ms,
                    }
                } else {
                    GatewayError::UpstreamTransport {
                        service_id: route.name.clone(),
                        message: e.to_string(),
                    }
                };
                if attempt < retries {
                    last_error = Some(error);
                    continue;
                }
                return Err(ForwardFailure {
                    error,
                    counts_against_breaker: true,
                });
            }
        }
    }

    // Only reachable when the final attempt was a retried 5xx that then
    // succeeded or errored above; keep the compiler satisfied.
    Err(ForwardFailure {
        error: last_error.unwrap_or_else(|| GatewayError::UpstreamTransport {
            service_id: route.name.clone(),
            message: "upstream retries exhausted".to_string(),
        }),
        counts_against_breaker: true,
    })
}

/// Build the egress URL: target path joined with the pattern remainder,
/// query string preserved verbatim.
fn upstream_url(target: &str, remainder: &str, query: Option<&str>) -> Result<Url, String> {
    let mut url = Url::parse(target).map_err(|e| format!("invalid target URL: {e}"))?;
    if !remainder.is_empty() {
        let joined = format!("{}/{}", url.path().trim_end_matches('/'), remainder);
        url.set_path(&joined);
    }
    url.set_query(query);
    Ok(url)
}

/// Copy request headers for egress: hop-by-hop headers and `Host` are
/// dropped (the client re-derives `Host` from the target), the gateway
/// request id is attached, and the client IP is appended to
/// `X-Forwarded-For`.
fn egress_headers(incoming: &HeaderMap, request_id: &str, client_ip: &str) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(incoming.len() + 2);
    for (name, value) in incoming {
        if name == HOST || name == axum::http::header::CONTENT_LENGTH {
            continue;
        }
        if HOP_BY_HOP.contains(&name.as_str()) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }

    let forwarded = match incoming
        .get(FORWARDED_FOR_HEADER)
        .and_then(|v| v.to_str().ok())
    {
        Some(existing) => format!("{existing}, {client_ip}"),
        None => client_ip.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded) {
        headers.insert(HeaderName::from_static(FORWARDED_FOR_HEADER), value);
    }

    headers
}

/// Client IP: first entry of X-Forwarded-For when present (the gateway sits
/// behind a load balancer), otherwise the socket peer.
fn client_ip_of(headers: &HeaderMap, peer_ip: IpAddr) -> String {
    headers
        .get(FORWARDED_FOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| peer_ip.to_string())
}

/// Convert an upstream exchange into the client-facing response.
fn upstream_response(forwarded: Forwarded, request_id: &str) -> Response<Body> {
    let mut builder = Response::builder().status(forwarded.status);
    if let Some(headers) = builder.headers_mut() {
        for (name, value) in &forwarded.headers {
            if HOP_BY_HOP.contains(&name.as_str()) || name == axum::http::header::CONTENT_LENGTH {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }
    }
    match builder.body(Body::from(forwarded.body)) {
        Ok(response) => with_request_id(response, request_id),
        Err(e) => {
            warn!(error = %e, "failed to rebuild upstream response");
            error_response(
                StatusCode::BAD_GATEWAY,
                "Bad Gateway",
                "invalid upstream response",
                request_id,
            )
        }
    }
}

/// Synthesized JSON error response with the gateway envelope.
fn error_response(
    status: StatusCode,
    error: &str,
    reason: &str,
    request_id: &str,
) -> Response<Body> {
    let response = (status, Json(json!({ "error": error, "reason": reason }))).into_response();
    with_request_id(response, request_id)
}

fn with_request_id(mut response: Response<Body>, request_id: &str) -> Response<Body> {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
    response
}
