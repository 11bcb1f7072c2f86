//! End-to-end pipeline tests: real gateway and upstream servers on
//! ephemeral ports, in-memory shared store.

mod common;

use std::time::Duration;

use common::{healthy_upstream, route, spawn_gateway, spawn_upstream};
use edge_gateway::breaker::{BreakerConfig, CircuitState};
use edge_gateway::core::settings::GatewaySettings;
use serde_json::Value;

#[tokio::test]
async fn happy_path_passes_through_and_counts_the_request() {
    let upstream = healthy_upstream().await;
    let gw = spawn_gateway(
        vec![route("svc", "/a/:id", &upstream.base_url)],
        GatewaySettings::default(),
    )
    .await;

    let response = reqwest::get(format!("{}/a/42", gw.base_url)).await.unwrap();
    assert_eq!(response.status(), 200);
    assert!(response.headers().get("x-request-id").is_some());
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["ok"], true);

    // The upstream saw the remainder path and the proxy headers.
    assert_eq!(upstream.hits(), 1);
    assert_eq!(upstream.last_uri().unwrap(), "/42");
    let headers = upstream.last_headers().unwrap();
    assert!(headers.get("x-request-id").is_some());
    assert!(headers.get("x-forwarded-for").is_some());

    let metrics = gw.state.metrics.snapshot_text();
    assert!(metrics.contains("api_requests_total"));
    assert!(metrics.contains("route=\"svc\""));
    assert!(metrics.contains("status_code=\"200\""));
}

#[tokio::test]
async fn query_strings_are_forwarded_verbatim() {
    let upstream = healthy_upstream().await;
    let gw = spawn_gateway(
        vec![route("svc", "/a/:id", &upstream.base_url)],
        GatewaySettings::default(),
    )
    .await;

    let response = reqwest::get(format!("{}/a/42?x=1&y=two", gw.base_url))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(upstream.last_uri().unwrap(), "/42?x=1&y=two");
}

#[tokio::test]
async fn unmatched_requests_are_404() {
    let gw = spawn_gateway(
        vec![route("svc", "/a/:id", "http://127.0.0.1:9")],
        GatewaySettings::default(),
    )
    .await;

    let response = reqwest::get(format!("{}/nothing/here", gw.base_url))
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "Not Found");
}

#[tokio::test]
async fn method_restrictions_apply() {
    let upstream = healthy_upstream().await;
    let mut r = route("svc", "/a", &upstream.base_url);
    r.methods = vec!["POST".to_string()];
    let gw = spawn_gateway(vec![r], GatewaySettings::default()).await;

    let client = reqwest::Client::new();
    let get = client
        .get(format!("{}/a", gw.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(get.status(), 404);

    let post = client
        .post(format!("{}/a", gw.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(post.status(), 200);
}

#[tokio::test]
async fn missing_auth_header_is_denied_before_the_upstream() {
    let upstream = healthy_upstream().await;
    let mut r = route("svc", "/a/:id", &upstream.base_url);
    r.policies = vec!["authentication".to_string()];
    let gw = spawn_gateway(
        vec![r],
        GatewaySettings {
            jwt_secret: Some("s3cret".to_string()),
            ..GatewaySettings::default()
        },
    )
    .await;

    let response = reqwest::get(format!("{}/a/1", gw.base_url)).await.unwrap();
    assert_eq!(response.status(), 401);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "Unauthorized");
    assert_eq!(body["reason"], "Missing authentication header");

    assert_eq!(upstream.hits(), 0);
    assert_eq!(gw.state.breakers.health().len(), 0);
}

#[tokio::test]
async fn api_key_auth_admits_the_request() {
    let upstream = healthy_upstream().await;
    let mut r = route("svc", "/a/:id", &upstream.base_url);
    r.policies = vec!["authentication".to_string()];
    let gw = spawn_gateway(
        vec![r],
        GatewaySettings {
            api_key: Some("k-123".to_string()),
            ..GatewaySettings::default()
        },
    )
    .await;

    let client = reqwest::Client::new();
    let response = client
        .get(format!("{}/a/1", gw.base_url))
        .header("authorization", "ApiKey k-123")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(upstream.hits(), 1);
}

#[tokio::test]
async fn rate_limit_window_denies_the_third_request() {
    let upstream = healthy_upstream().await;
    let mut r = route("svc", "/a/:id", &upstream.base_url);
    r.policies = vec!["rate_limit".to_string()];
    let gw = spawn_gateway(
        vec![r],
        GatewaySettings {
            default_rate_limit: 2,
            ..GatewaySettings::default()
        },
    )
    .await;

    let client = reqwest::Client::new();
    for _ in 0..2 {
        let response = client
            .get(format!("{}/a/1", gw.base_url))
            .header("x-forwarded-for", "1.2.3.4")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }

    let response = client
        .get(format!("{}/a/1", gw.base_url))
        .header("x-forwarded-for", "1.2.3.4")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 429);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "Too Many Requests");
    assert_eq!(upstream.hits(), 2);

    // A different client IP has its own window.
    let response = client
        .get(format!("{}/a/1", gw.base_url))
        .header("x-forwarded-for", "5.6.7.8")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn denylisted_ip_is_403() {
    let upstream = healthy_upstream().await;
    let mut r = route("svc", "/a/:id", &upstream.base_url);
    r.policies = vec!["ip_filter".to_string()];
    let gw = spawn_gateway(
        vec![r],
        GatewaySettings {
            ip_blacklist: vec!["6.6.6.6".to_string()],
            ..GatewaySettings::default()
        },
    )
    .await;

    let client = reqwest::Client::new();
    let response = client
        .get(format!("{}/a/1", gw.base_url))
        .header("x-forwarded-for", "6.6.6.6")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);
    assert_eq!(upstream.hits(), 0);
}

#[tokio::test]
async fn breaker_opens_after_repeated_5xx_and_recovers_on_probe() {
    let upstream = spawn_upstream(|hit| {
        if hit <= 3 {
            (500, "upstream broken".to_string(), 0)
        } else {
            (200, "{\"ok\":true}".to_string(), 0)
        }
    })
    .await;

    let mut r = route("svc", "/a/:id", &upstream.base_url);
    r.circuit_breaker = Some(BreakerConfig {
        failure_threshold: Some(3),
        reset_timeout_ms: Some(300),
        successes_before_reset: 1,
        distributed: false,
    });
    let gw = spawn_gateway(vec![r], GatewaySettings::default()).await;

    let client = reqwest::Client::new();

    // Three upstream 5xx responses pass through while the breaker counts.
    for _ in 0..3 {
        let response = client
            .get(format!("{}/a/1", gw.base_url))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 500);
    }
    assert_eq!(gw.state.breakers.state_of("svc"), Some(CircuitState::Open));

    // Open circuit fails fast without touching the upstream.
    let response = client
        .get(format!("{}/a/1", gw.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 503);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["reason"], "circuit open");
    assert_eq!(upstream.hits(), 3);

    // After the reset timeout one probe goes through and closes the circuit.
    tokio::time::sleep(Duration::from_millis(400)).await;
    let response = client
        .get(format!("{}/a/1", gw.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(upstream.hits(), 4);
    assert_eq!(
        gw.state.breakers.state_of("svc"),
        Some(CircuitState::Closed)
    );

    let metrics = gw.state.metrics.snapshot_text();
    assert!(metrics.contains("circuit_breaker_rejections_total"));
    assert!(metrics.contains("circuit_breaker_failures_total"));
}

#[tokio::test]
async fn upstream_timeout_becomes_504_and_counts_as_failure() {
    let upstream = spawn_upstream(|_| (200, "slow".to_string(), 500)).await;
    let mut r = route("svc", "/a/:id", &upstream.base_url);
    r.timeout_ms = Some(100);
    r.circuit_breaker = Some(BreakerConfig {
        failure_threshold: Some(5),
        reset_timeout_ms: Some(60_000),
        successes_before_reset: 1,
        distributed: false,
    });
    let gw = spawn_gateway(vec![r], GatewaySettings::default()).await;

    let response = reqwest::get(format!("{}/a/1", gw.base_url)).await.unwrap();
    assert_eq!(response.status(), 504);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "Gateway Timeout");

    let health = gw.state.breakers.health();
    assert_eq!(health["svc"].failures, 1);
}

#[tokio::test]
async fn unreachable_upstream_becomes_502() {
    // Nothing listens on this port.
    let gw = spawn_gateway(
        vec![route("svc", "/a/:id", "http://127.0.0.1:9")],
        GatewaySettings::default(),
    )
    .await;

    let response = reqwest::get(format!("{}/a/1", gw.base_url)).await.unwrap();
    assert_eq!(response.status(), 502);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "Bad Gateway");
}

#[tokio::test]
async fn retries_recover_from_transient_5xx() {
    let upstream = spawn_upstream(|hit| {
        if hit <= 2 {
            (500, "flaky".to_string(), 0)
        } else {
            (200, "{\"ok\":true}".to_string(), 0)
        }
    })
    .await;

    let mut r = route("svc", "/a/:id", &upstream.base_url);
    r.retries = Some(2);
    let gw = spawn_gateway(vec![r], GatewaySettings::default()).await;

    let response = reqwest::get(format!("{}/a/1", gw.base_url)).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(upstream.hits(), 3);
}

#[tokio::test]
async fn unregistered_policy_names_are_skipped() {
    let upstream = healthy_upstream().await;
    let mut r = route("svc", "/a/:id", &upstream.base_url);
    r.policies = vec!["no-such-policy".to_string()];
    let gw = spawn_gateway(vec![r], GatewaySettings::default()).await;

    let response = reqwest::get(format!("{}/a/1", gw.base_url)).await.unwrap();
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn management_endpoints_respond() {
    let gw = spawn_gateway(
        vec![route("svc", "/a/:id", "http://127.0.0.1:9")],
        GatewaySettings::default(),
    )
    .await;

    let health = reqwest::get(format!("{}/health", gw.base_url)).await.unwrap();
    assert_eq!(health.status(), 200);
    let body: Value = health.json().await.unwrap();
    assert_eq!(body["status"], "ok");

    let ready = reqwest::get(format!("{}/health/ready", gw.base_url))
        .await
        .unwrap();
    assert_eq!(ready.status(), 200);

    let metrics = reqwest::get(format!("{}/metrics", gw.base_url)).await.unwrap();
    assert_eq!(metrics.status(), 200);
    assert!(metrics
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/plain"));
}

#[tokio::test]
async fn readiness_fails_when_the_store_is_down() {
    let gw = spawn_gateway(
        vec![route("svc", "/a/:id", "http://127.0.0.1:9")],
        GatewaySettings::default(),
    )
    .await;

    gw.store.set_failing(true);
    let ready = reqwest::get(format!("{}/health/ready", gw.base_url))
        .await
        .unwrap();
    assert_eq!(ready.status(), 503);
}

#[tokio::test]
async fn store_outage_fails_open_for_rate_limiting() {
    let upstream = healthy_upstream().await;
    let mut r = route("svc", "/a/:id", &upstream.base_url);
    r.policies = vec!["rate_limit".to_string()];
    let gw = spawn_gateway(
        vec![r],
        GatewaySettings {
            default_rate_limit: 1,
            ..GatewaySettings::default()
        },
    )
    .await;

    gw.store.set_failing(true);
    let client = reqwest::Client::new();
    for _ in 0..4 {
        let response = client
            .get(format!("{}/a/1", gw.base_url))
            .header("x-forwarded-for", "1.2.3.4")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }
}
