//! Gateway routing against live sidecars.
//!
//! Sidecars are echo servers bound inside the host-port window; each
//! manifest pins its `hostPort` to one so the proxied response shows the
//! exact path the plugin received.

mod support;

use axum::http::StatusCode;
use serde_json::{json, Value};
use support::agent::{approval, body_bytes, get_request, manifest, start_echo_sidecar, Agent};

async fn pinned(name: &str) -> Value {
    let port = start_echo_sidecar().await;
    let mut m = manifest(name, "low");
    m["docker"]["hostPort"] = json!(port);
    m
}

async fn enabled_agent(manifests: Vec<Value>) -> Agent {
    let names: Vec<String> = manifests
        .iter()
        .map(|m| m["name"].as_str().unwrap().to_string())
        .collect();
    let agent = Agent::start(&manifests).await;
    for name in names {
        let (status, body) = agent
            .post(&agent.admin(), "/api/plugins/enable", approval(&name, "low"))
            .await;
        assert_eq!(status, StatusCode::OK, "enable {}: {}", name, body);
    }
    agent
}

async fn fetch(agent: &Agent, token: &str, uri: &str) -> (StatusCode, String) {
    let resp = agent.send(get_request(token, uri)).await;
    let status = resp.status();
    let bytes = body_bytes(resp).await;
    (status, String::from_utf8_lossy(&bytes).into_owned())
}

// ============================================================================
// Routing
// ============================================================================

#[tokio::test]
async fn test_canonical_prefix_is_stripped() {
    let agent = enabled_agent(vec![pinned("demo").await]).await;
    let token = agent.viewer();

    assert_eq!(
        fetch(&agent, &token, "/plugins/demo/static/app.js").await,
        (StatusCode::OK, "sidecar /static/app.js".to_string())
    );
    assert_eq!(
        fetch(&agent, &token, "/plugins/demo").await,
        (StatusCode::OK, "sidecar /".to_string())
    );
}

#[tokio::test]
async fn test_legacy_prefix_reaches_same_sidecar() {
    let agent = enabled_agent(vec![pinned("demo").await]).await;
    let token = agent.viewer();

    assert_eq!(
        fetch(&agent, &token, "/api/plugins/demo/api/status?verbose=1").await,
        (StatusCode::OK, "sidecar /api/status?verbose=1".to_string())
    );
}

#[tokio::test]
async fn test_api_words_never_route_to_plugins() {
    let agent = enabled_agent(vec![pinned("demo").await]).await;
    let token = agent.admin();

    let (status, _) = fetch(&agent, &token, "/api/plugins/manifest/extra").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // The real endpoint still answers.
    let (status, body) = agent.get(&token, "/api/plugins/list").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.is_array());
}

#[tokio::test]
async fn test_ui_base_path_is_prepended() {
    let mut demo = pinned("dash").await;
    demo["ui"] = json!({ "path": "/app", "title": "Dashboard" });
    let agent = enabled_agent(vec![demo]).await;
    let token = agent.viewer();

    assert_eq!(
        fetch(&agent, &token, "/plugins/dash/").await,
        (StatusCode::OK, "sidecar /app/".to_string())
    );
    assert_eq!(
        fetch(&agent, &token, "/plugins/dash/app/main.js").await,
        (StatusCode::OK, "sidecar /app/main.js".to_string())
    );
    assert_eq!(
        fetch(&agent, &token, "/plugins/dash/favicon.ico").await,
        (StatusCode::OK, "sidecar /app/favicon.ico".to_string())
    );

    let (_, list) = agent.get(&token, "/api/plugins/list").await;
    assert_eq!(list[0]["proxyUrl"], "/plugins/dash/app");
}

// ============================================================================
// Refusals
// ============================================================================

#[tokio::test]
async fn test_unknown_plugin_is_404() {
    let agent = Agent::start(&[]).await;
    let (status, body) = agent.get(&agent.admin(), "/plugins/ghost/").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");
}

#[tokio::test]
async fn test_disabled_plugin_is_refused() {
    let agent = Agent::start(&[pinned("demo").await]).await;
    let (status, body) = agent.get(&agent.admin(), "/plugins/demo/").await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "Plugin is disabled");
}

#[tokio::test]
async fn test_enabled_but_stopped_plugin_is_unavailable() {
    let agent = enabled_agent(vec![pinned("demo").await]).await;
    agent.manager.runtime().stop("demo").await.unwrap();

    let (status, body) = agent.get(&agent.viewer(), "/plugins/demo/").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "Plugin is not running");
    assert_eq!(body["retryable"], true);
}

#[tokio::test]
async fn test_admin_only_plugin_is_forbidden_to_viewers() {
    let mut vault = pinned("vault").await;
    vault["adminOnly"] = json!(true);
    let agent = enabled_agent(vec![vault]).await;

    let (status, body) = agent.get(&agent.viewer(), "/plugins/vault/").await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "Forbidden");

    assert_eq!(
        fetch(&agent, &agent.admin(), "/api/plugins/vault/secrets").await,
        (StatusCode::OK, "sidecar /secrets".to_string())
    );
}

#[tokio::test]
async fn test_gateway_requires_token() {
    let agent = enabled_agent(vec![pinned("demo").await]).await;
    let req = axum::http::Request::get("/plugins/demo/")
        .body(axum::body::Body::empty())
        .unwrap();
    let resp = agent.send(req).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}
