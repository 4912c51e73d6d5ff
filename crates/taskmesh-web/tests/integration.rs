//! Integration tests for the taskmesh-web crate.
//!
//! These drive the real router with in-process requests: the engine
//! underneath runs on in-memory SQLite and the in-process cache
//! backend, so the full create → decompose → register → schedule →
//! result flow is exercised through the HTTP contract.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use taskmesh_engine::{EngineConfig, Orchestrator};
use taskmesh_store::Database;
use taskmesh_web::{build_router, AppState, InFlightSampler};

async fn test_router() -> Router {
    test_router_with(EngineConfig {
        exploration_rate: 0.0,
        ..EngineConfig::default()
    })
    .await
}

async fn test_router_with(config: EngineConfig) -> Router {
    let db = Database::open_in_memory().unwrap();
    db.run_migrations().await.unwrap();

    let in_flight = InFlightSampler::new(256);
    let orch = Orchestrator::new(
        db,
        config,
        vec![Arc::clone(&in_flight) as Arc<dyn taskmesh_kernel::PoolSampler>],
    );
    build_router(AppState::new(orch, in_flight))
}

async fn send(router: &Router, method: &str, path: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = match body {
        Some(body) => Request::builder()
            .method(method)
            .uri(path)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => Request::builder()
            .method(method)
            .uri(path)
            .body(Body::empty())
            .unwrap(),
    };

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::String(
            String::from_utf8_lossy(&bytes).into_owned(),
        ))
    };
    (status, value)
}

#[tokio::test]
async fn create_task_returns_201() {
    let router = test_router().await;

    let (status, body) = send(
        &router,
        "POST",
        "/api/v1/tasks",
        Some(json!({
            "description": "Create a fibonacci endpoint for the calculator",
            "task_type": "develop_feature"
        })),
    )
    .await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["status"], "pending");
    assert!(body["task_id"].is_string());
}

#[tokio::test]
async fn short_description_rejected_with_envelope() {
    let router = test_router().await;

    let (status, body) = send(
        &router,
        "POST",
        "/api/v1/tasks",
        Some(json!({"description": "short"})),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], "error");
    assert_eq!(body["error_code"], "VALIDATION_001");
    assert_eq!(body["retryable"], false);
}

#[tokio::test]
async fn unknown_task_is_resource_001() {
    let router = test_router().await;
    let (status, body) = send(
        &router,
        "GET",
        &format!("/api/v1/tasks/{}", uuid::Uuid::now_v7()),
        None,
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error_code"], "RESOURCE_001");
}

#[tokio::test]
async fn full_flow_over_http() {
    let router = test_router().await;

    // Register a worker.
    let (status, worker) = send(
        &router,
        "POST",
        "/api/v1/workers/register",
        Some(json!({
            "machine_id": "machine-1",
            "machine_name": "Test Box",
            "tools": ["claude_code"]
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let worker_id = worker["worker_id"].as_str().unwrap().to_string();

    // Duplicate registration returns the same worker id.
    let (_, again) = send(
        &router,
        "POST",
        "/api/v1/workers/register",
        Some(json!({
            "machine_id": "machine-1",
            "machine_name": "Renamed Box",
            "tools": ["claude_code"]
        })),
    )
    .await;
    assert_eq!(again["worker_id"].as_str().unwrap(), worker_id);

    // Create and decompose a task.
    let (_, created) = send(
        &router,
        "POST",
        "/api/v1/tasks",
        Some(json!({
            "description": "Develop the fibonacci feature over HTTP",
            "task_type": "develop_feature"
        })),
    )
    .await;
    let task_id = created["task_id"].as_str().unwrap().to_string();

    let (status, decomposed) = send(
        &router,
        "POST",
        &format!("/api/v1/tasks/{task_id}/decompose"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(decomposed["subtasks"].as_array().unwrap().len(), 4);

    // Ready set is exactly Code Generation.
    let (_, ready) = send(
        &router,
        "GET",
        &format!("/api/v1/tasks/{task_id}/ready-subtasks"),
        None,
    )
    .await;
    let ready = ready.as_array().unwrap().clone();
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0]["name"], "Code Generation");
    let subtask_id = ready[0]["id"].as_str().unwrap().to_string();

    // One-shot schedule binds it.
    let (status, report) = send(
        &router,
        "POST",
        &format!("/api/v1/tasks/{task_id}/schedule"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["subtasks_allocated"], 1);

    // Worker reports the result; progress becomes 25.
    let (status, _) = send(
        &router,
        "POST",
        &format!("/api/v1/subtasks/{subtask_id}/result"),
        Some(json!({"status": "completed", "output": {"files": 1}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, detail) = send(&router, "GET", &format!("/api/v1/tasks/{task_id}"), None).await;
    assert_eq!(detail["progress"], 25);
    assert_eq!(detail["status"], "in_progress");
}

#[tokio::test]
async fn low_evaluation_creates_checkpoint_and_decision_resumes() {
    let router = test_router().await;

    send(
        &router,
        "POST",
        "/api/v1/workers/register",
        Some(json!({
            "machine_id": "m-1",
            "machine_name": "box",
            "tools": ["claude_code"]
        })),
    )
    .await;
    let (_, created) = send(
        &router,
        "POST",
        "/api/v1/tasks",
        Some(json!({
            "description": "Code review task with a poor evaluation",
            "task_type": "code_review"
        })),
    )
    .await;
    let task_id = created["task_id"].as_str().unwrap().to_string();

    send(
        &router,
        "POST",
        &format!("/api/v1/tasks/{task_id}/decompose"),
        None,
    )
    .await;
    send(
        &router,
        "POST",
        &format!("/api/v1/tasks/{task_id}/schedule"),
        None,
    )
    .await;

    let (_, detail) = send(&router, "GET", &format!("/api/v1/tasks/{task_id}"), None).await;
    let subtask_id = detail["subtasks"]
        .as_array()
        .unwrap()
        .iter()
        .find(|s| s["status"] == "in_progress")
        .unwrap()["id"]
        .as_str()
        .unwrap()
        .to_string();

    send(
        &router,
        "POST",
        &format!("/api/v1/subtasks/{subtask_id}/result"),
        Some(json!({"status": "completed", "output": {}})),
    )
    .await;
    let (status, evaluation) = send(
        &router,
        "POST",
        &format!("/api/v1/subtasks/{subtask_id}/evaluations"),
        Some(json!({
            "code_quality": 5.0,
            "completeness": 6.0,
            "security": 5.5,
            "details": {"evaluator": "simulated"}
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(evaluation["overall_score"].as_f64().unwrap() < 7.0);

    // Checkpoint exists with the low-score reason; task paused.
    let (_, checkpoints) = send(
        &router,
        "GET",
        &format!("/api/v1/tasks/{task_id}/checkpoints"),
        None,
    )
    .await;
    let checkpoints = checkpoints.as_array().unwrap().clone();
    assert_eq!(checkpoints.len(), 1);
    assert_eq!(checkpoints[0]["trigger_reason"], "low_evaluation_score");
    let checkpoint_id = checkpoints[0]["id"].as_str().unwrap().to_string();

    let (_, detail) = send(&router, "GET", &format!("/api/v1/tasks/{task_id}"), None).await;
    assert_eq!(detail["status"], "checkpoint");

    // Accept: task resumes.
    let (status, decision) = send(
        &router,
        "POST",
        &format!("/api/v1/checkpoints/{checkpoint_id}/decision"),
        Some(json!({"decision": "accept"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(decision["checkpoint"]["status"], "approved");

    let (_, detail) = send(&router, "GET", &format!("/api/v1/tasks/{task_id}"), None).await;
    assert_eq!(detail["status"], "in_progress");
}

#[tokio::test]
async fn cancel_task_over_http() {
    let router = test_router().await;

    let (_, created) = send(
        &router,
        "POST",
        "/api/v1/tasks",
        Some(json!({"description": "Task to be cancelled via the API"})),
    )
    .await;
    let task_id = created["task_id"].as_str().unwrap().to_string();
    send(
        &router,
        "POST",
        &format!("/api/v1/tasks/{task_id}/decompose"),
        None,
    )
    .await;

    let (status, cancelled) = send(
        &router,
        "POST",
        &format!("/api/v1/tasks/{task_id}/cancel"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cancelled["status"], "cancelled");

    // Cancelling again is an invalid state, not a crash.
    let (status, body) = send(
        &router,
        "POST",
        &format!("/api/v1/tasks/{task_id}/cancel"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error_code"], "TASK_005");
}

#[tokio::test]
async fn scheduler_stats_and_metrics_render() {
    let router = test_router().await;

    let (status, stats) = send(&router, "GET", "/api/v1/scheduler/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(stats["allocation"]["queue_length"].is_number());

    let (status, metrics) = send(&router, "GET", "/metrics", None).await;
    assert_eq!(status, StatusCode::OK);
    let text = metrics.as_str().unwrap_or_default().to_string();
    assert!(text.contains("taskmesh_queue_depth"));

    let (status, health) = send(&router, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "ok");
}

#[tokio::test]
async fn rate_limit_returns_429_envelope() {
    let router = test_router_with(EngineConfig {
        rate_limit_per_minute: 2,
        exploration_rate: 0.0,
        ..EngineConfig::default()
    })
    .await;

    for _ in 0..2 {
        let (status, _) = send(&router, "GET", "/api/v1/workers", None).await;
        assert_eq!(status, StatusCode::OK);
    }

    let (status, body) = send(&router, "GET", "/api/v1/workers", None).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error_code"], "RATE_001");
    assert_eq!(body["retryable"], true);
    assert!(body["retry_after"].as_u64().unwrap() >= 1);

    // Health is exempt.
    let (status, _) = send(&router, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn unknown_template_maps_to_resource_001() {
    let router = test_router().await;

    let (_, created) = send(
        &router,
        "POST",
        "/api/v1/tasks",
        Some(json!({"description": "Task decomposed through a missing template"})),
    )
    .await;
    let task_id = created["task_id"].as_str().unwrap().to_string();

    let (status, body) = send(
        &router,
        "POST",
        &format!("/api/v1/tasks/{task_id}/decompose"),
        Some(json!({"template": "does-not-exist"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error_code"], "RESOURCE_001");
}
