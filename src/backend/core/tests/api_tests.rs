//! Trigger endpoint and operator surface tests against the in-memory
//! backends.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::ServiceExt;
use uuid::Uuid;

use cascade_core::api::{build_router, AppState};
use cascade_core::dag::{Dag, DagGraph, DelayTaskConfig, Node, NodeConfig, TriggerConfig};
use cascade_core::dispatch::Dispatcher;
use cascade_core::events::BroadcastEventBus;
use cascade_core::queue::TaskQueue;
use cascade_core::store::{InMemoryStateStore, StateStore};

struct Api {
    router: axum::Router,
    store: Arc<InMemoryStateStore>,
}

async fn api_with_dag(trigger: Option<TriggerConfig>) -> (Api, Dag) {
    let store = Arc::new(InMemoryStateStore::new());
    let store_dyn: Arc<dyn StateStore> = store.clone();
    let queue = TaskQueue::in_memory();
    let events = Arc::new(BroadcastEventBus::default());
    let dispatcher = Dispatcher::new(store_dyn.clone(), queue.clone(), events);

    let mut dag = Dag::new(
        Uuid::new_v4(),
        "hooked",
        DagGraph::new(
            vec![Node::new(
                "a",
                NodeConfig::Delay(DelayTaskConfig { duration_ms: 1 }),
            )],
            vec![],
        ),
    )
    .unwrap();
    dag.trigger = trigger;
    store.insert_dag(&dag).await.unwrap();

    let router = build_router(
        AppState {
            store: store_dyn,
            queue,
            dispatcher,
            redis: None,
        },
        Some("https://app.example.com"),
    );

    (Api { router, store }, dag)
}

fn request(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn default_trigger() -> TriggerConfig {
    TriggerConfig {
        token: "tok-123".to_string(),
        path: Some("deploy/prod".to_string()),
        method: "POST".to_string(),
        enabled: true,
    }
}

#[tokio::test]
async fn token_trigger_creates_run() {
    let (api, _dag) = api_with_dag(Some(default_trigger())).await;

    let response = api
        .router
        .oneshot(request("POST", "/api/triggers/tok-123"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["triggered"], true);
    let run_id: Uuid = body["runId"].as_str().unwrap().parse().unwrap();
    assert!(api.store.get_run(run_id).await.unwrap().is_some());
}

#[tokio::test]
async fn unknown_token_is_unauthorized() {
    let (api, _dag) = api_with_dag(Some(default_trigger())).await;

    let response = api
        .router
        .oneshot(request("POST", "/api/triggers/nope"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn method_mismatch_is_rejected() {
    let (api, _dag) = api_with_dag(Some(default_trigger())).await;

    let response = api
        .router
        .oneshot(request("GET", "/api/triggers/tok-123"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn disabled_trigger_is_forbidden() {
    let mut trigger = default_trigger();
    trigger.enabled = false;
    let (api, _dag) = api_with_dag(Some(trigger)).await;

    let response = api
        .router
        .oneshot(request("POST", "/api/triggers/tok-123"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "TRIGGER_DISABLED");
}

#[tokio::test]
async fn path_trigger_creates_run() {
    let (api, _dag) = api_with_dag(Some(default_trigger())).await;

    let response = api
        .router
        .oneshot(request("POST", "/api/hooks/deploy/prod"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["triggered"], true);
}

#[tokio::test]
async fn manual_trigger_by_dag_id() {
    let (api, dag) = api_with_dag(None).await;

    let response = api
        .router
        .oneshot(request("POST", &format!("/api/dags/{}/trigger", dag.id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = api
        .store
        .list_recent_runs(10)
        .await
        .unwrap();
    assert_eq!(response.len(), 1);
    assert_eq!(response[0].triggered_by, "manual");
}

#[tokio::test]
async fn unknown_dag_manual_trigger_is_not_found() {
    let (api, _dag) = api_with_dag(None).await;

    let response = api
        .router
        .oneshot(request(
            "POST",
            &format!("/api/dags/{}/trigger", Uuid::new_v4()),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn inactive_dag_trigger_skips_silently() {
    let (api, mut dag) = api_with_dag(Some(default_trigger())).await;
    dag.active = false;
    api.store.insert_dag(&dag).await.unwrap();

    let response = api
        .router
        .oneshot(request("POST", "/api/triggers/tok-123"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["triggered"], false);
}

#[tokio::test]
async fn run_inspection_and_cancel() {
    let (api, dag) = api_with_dag(None).await;

    let response = api
        .router
        .clone()
        .oneshot(request("POST", &format!("/api/dags/{}/trigger", dag.id)))
        .await
        .unwrap();
    let run_id = body_json(response).await["runId"]
        .as_str()
        .unwrap()
        .to_string();

    let response = api
        .router
        .clone()
        .oneshot(request("GET", &format!("/api/runs/{}", run_id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "queued");

    let response = api
        .router
        .clone()
        .oneshot(request("POST", &format!("/api/runs/{}/cancel", run_id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "cancelled");

    // Second cancel conflicts.
    let response = api
        .router
        .oneshot(request("POST", &format!("/api/runs/{}/cancel", run_id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn healthz_reports_ok_for_memory_backends() {
    let (api, _dag) = api_with_dag(None).await;

    let response = api.router.oneshot(request("GET", "/healthz")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["healthy"], true);
    assert_eq!(body["store"], true);
}

#[tokio::test]
async fn workers_and_queue_stats_endpoints() {
    let (api, _dag) = api_with_dag(None).await;

    let response = api
        .router
        .clone()
        .oneshot(request("GET", "/api/workers"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = api
        .router
        .oneshot(request("GET", "/api/queue/stats"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["pending"], 0);
    assert_eq!(body["deadLetter"], 0);
}
