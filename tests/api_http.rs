// tests/api_http.rs
//
// HTTP-level tests for the status Router without opening sockets.
// We exercise the router directly via tower::ServiceExt::oneshot.
//
// Covered:
// - GET /health   (200 when healthy, 503 when critical)
// - GET /status
// - GET /sources
// - GET /metrics  (404 without a recorder)

mod common;

use std::sync::Arc;

use axum::{
    body::{self, Body},
    http::{Request, StatusCode},
    Router,
};
use serde_json::Value as Json;
use tower::ServiceExt as _; // for `oneshot`

use common::{CountingGenerator, MockExtractor, MockFactory};
use group_reply_relay::api::{self, AppState};
use group_reply_relay::config::{DispatchConfig, SourceConfig, WorkerConfig};
use group_reply_relay::listener::ListenerOptions;
use group_reply_relay::ReplySystem;

const BODY_LIMIT: usize = 1024 * 1024;

fn system() -> Arc<ReplySystem> {
    Arc::new(ReplySystem::new(
        MockExtractor::new(),
        MockFactory::new(),
        CountingGenerator::new(),
        DispatchConfig {
            task_delay_ms: 0,
            ..DispatchConfig::default()
        },
        ListenerOptions::default(),
    ))
}

async fn started_router() -> (Router, Arc<ReplySystem>) {
    let system = system();
    let mut g1 = SourceConfig::new("g1", "u1");
    g1.priority = 2;
    g1.polling_interval_ms = 60_000;
    let mut g2 = SourceConfig::new("g2", "u2");
    g2.priority = 1;
    g2.polling_interval_ms = 60_000;
    system
        .start(vec![g1, g2], vec![WorkerConfig::new("w1")])
        .await
        .expect("start relay");
    (api::router(AppState::new(system.clone())), system)
}

async fn get(app: Router, uri: &str) -> (StatusCode, Vec<u8>) {
    let req = Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .expect("build GET");
    let resp = app.oneshot(req).await.expect("oneshot");
    let status = resp.status();
    let bytes = body::to_bytes(resp.into_body(), BODY_LIMIT)
        .await
        .expect("read body")
        .to_vec();
    (status, bytes)
}

#[tokio::test]
async fn health_is_200_when_running() {
    let (app, system) = started_router().await;

    let (status, bytes) = get(app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    let v: Json = serde_json::from_slice(&bytes).expect("health json");
    assert_eq!(v["level"], "healthy");
    assert_eq!(v["score"], 100);
    assert!(v["issues"].as_array().unwrap().is_empty());
    system.stop().await;
}

#[tokio::test]
async fn health_is_503_before_start() {
    let app = api::router(AppState::new(system()));

    let (status, bytes) = get(app, "/health").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    let v: Json = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(v["level"], "critical");
    let issues: Vec<&str> = v["issues"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|i| i.as_str())
        .collect();
    assert!(issues.contains(&"no active sources"));
    assert!(issues.contains(&"no active workers"));
}

#[tokio::test]
async fn sources_are_listed_by_priority() {
    let (app, system) = started_router().await;

    let (status, bytes) = get(app, "/sources").await;
    assert_eq!(status, StatusCode::OK);
    let v: Json = serde_json::from_slice(&bytes).unwrap();
    let ids: Vec<&str> = v
        .as_array()
        .expect("array of sources")
        .iter()
        .filter_map(|s| s["id"].as_str())
        .collect();
    assert_eq!(ids, vec!["g2", "g1"]);
    assert_eq!(v[0]["status"], "active");
    system.stop().await;
}

#[tokio::test]
async fn status_reports_both_components() {
    let (app, system) = started_router().await;

    let (status, bytes) = get(app, "/status").await;
    assert_eq!(status, StatusCode::OK);
    let v: Json = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(v["running"], true);
    assert_eq!(v["sources"]["total_sources"], 2);
    assert_eq!(v["dispatch"]["active_workers"], 1);
    assert_eq!(v["dispatch"]["workers"][0]["status"], "active");
    system.stop().await;
}

#[tokio::test]
async fn metrics_is_404_without_recorder() {
    let app = api::router(AppState::new(system()));
    let (status, _) = get(app, "/metrics").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
