//! HTTP API handlers and routing.

mod compose;
pub mod error;
mod health;

use axum::{
    http::{header, Method},
    routing::get,
    Json, Router,
};
use serde_json::{json, Value};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::compose::SUPPORTED_VERSIONS;
use crate::state::AppState;

/// Create the API router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::PUT, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE])
        .allow_origin(Any);

    Router::new()
        .merge(health::routes())
        .route("/versions", get(versions))
        .nest("/v0", compose::routes())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn versions() -> Json<Value> {
    Json(json!({
        "mesos_compose": env!("CARGO_PKG_VERSION"),
        "api": ["v0"],
        "compose": SUPPORTED_VERSIONS,
    }))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use tower::ServiceExt;

    use super::*;
    use crate::cluster::InMemoryCluster;
    use crate::compose::ParseOptions;
    use crate::scheduler::Scheduler;
    use crate::store::{MemoryStore, StateStore};

    const WEB: &str = "version: '3'\nservices:\n  web:\n    image: alpine:latest\n    command: sleep 1000\n";

    fn app() -> (Router, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            Arc::new(InMemoryCluster::new()),
            ParseOptions::default(),
        ));
        (create_router(AppState::new(scheduler)), store)
    }

    async fn send(app: &Router, method: &str, uri: &str, body: &str) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_put_compose_reports_created_tasks() {
        let (app, _) = app();
        let (status, body) = send(&app, "PUT", "/v0/compose/shop", WEB).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["code"], 0);
        assert_eq!(body["report"]["created"], 1);

        let (_, tasks) = send(&app, "GET", "/v0/tasks", "").await;
        assert_eq!(tasks["tasks"].as_array().unwrap().len(), 1);
        assert_eq!(tasks["tasks"][0]["state"], "pending");
    }

    #[tokio::test]
    async fn test_bad_engine_label_is_400() {
        let (app, _) = app();
        let doc = "services:\n  web:\n    image: a\n    command: x\n    labels:\n      mesos_compose.container_type: bogus\n";
        let (status, body) = send(&app, "PUT", "/v0/compose/shop", doc).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], 2);
        assert_eq!(body["kind"], "invalid_label_value");
    }

    #[tokio::test]
    async fn test_store_failure_is_code_1_and_on_status_board() {
        let (app, store) = app();
        store.fail_writes(true);
        let (status, body) = send(&app, "PUT", "/v0/compose/shop", WEB).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["code"], 1);
        assert_eq!(body["operation"], "apply");

        let (_, board) = send(&app, "GET", "/v0/status", "").await;
        assert_eq!(board["errors"][0]["scope"], "shop");
        assert_eq!(board["errors"][0]["code"], 1);
    }

    #[tokio::test]
    async fn test_restart_unknown_project_is_404() {
        let (app, _) = app();
        let (status, body) = send(&app, "PUT", "/v0/compose/shop/web/restart", "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["kind"], "not_found");
    }

    #[tokio::test]
    async fn test_health_and_versions() {
        let (app, _) = app();
        let (status, body) = send(&app, "GET", "/readyz", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["components"]["store"]["status"], "ok");

        let (_, versions) = send(&app, "GET", "/versions", "").await;
        assert_eq!(versions["api"][0], "v0");
    }

    #[tokio::test]
    async fn test_kill_routes() {
        let (app, store) = app();
        let doc = "services:\n  web:\n    image: a\n    command: x\n    deploy:\n      replicas: 2\n  db:\n    image: b\n    command: y\n";
        send(&app, "PUT", "/v0/compose/shop", doc).await;

        let (_, tasks) = send(&app, "GET", "/v0/tasks", "").await;
        let web_task = tasks["tasks"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["id"].as_str().unwrap().to_string())
            .find(|id| id.starts_with("shop:web."))
            .unwrap();

        let (status, body) = send(&app, "DELETE", &format!("/v0/compose/shop/web/{web_task}"), "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["operation"], "kill");
        assert_eq!(body["report"]["terminating"], 1);

        let (status, body) = send(&app, "PUT", &format!("/v0/tasks/{web_task}/restart"), "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["kind"], "not_found");

        let (status, body) = send(&app, "DELETE", "/v0/compose/shop/web", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["report"]["services"], serde_json::json!(["db"]));
        assert!(!store.get("shop").await.unwrap().unwrap().services.contains_key("web"));

        let (status, _) = send(&app, "DELETE", "/v0/compose/shop/web", "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
