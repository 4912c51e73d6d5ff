//! Router assembly and server startup.
//!
//! The router is one thin layer over the engine's documented
//! operations, plus two cross-cutting guards applied to the API
//! surface: per-IP+endpoint rate limiting and write admission under
//! backpressure. Health and metrics are exempt from both.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderValue, Method};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use taskmesh_engine::EngineError;

use crate::api;
use crate::error::ApiError;
use crate::state::AppState;
use crate::ws;

/// Build the full router with CORS and the request guards.
pub fn build_router(state: AppState) -> Router {
    // Explicit origin list; methods and headers are never wildcarded.
    let origins: Vec<HeaderValue> = state
        .orch
        .config
        .cors_origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(%origin, "ignoring unparseable CORS origin");
                None
            }
        })
        .collect();
    let cors = CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([axum::http::header::CONTENT_TYPE]);

    let api_routes = Router::new()
        .route("/tasks", post(api::create_task).get(api::list_tasks))
        .route("/tasks/{id}", get(api::get_task))
        .route("/tasks/{id}/decompose", post(api::decompose_task))
        .route("/tasks/{id}/ready-subtasks", get(api::ready_subtasks))
        .route("/tasks/{id}/schedule", post(api::schedule_now))
        .route("/tasks/{id}/cancel", post(api::cancel_task))
        .route("/tasks/{id}/checkpoints", get(api::list_checkpoints))
        .route("/subtasks/{id}", get(api::get_subtask))
        .route("/subtasks/{id}/allocate", post(api::allocate_subtask))
        .route("/subtasks/{id}/result", post(api::report_subtask_result))
        .route("/subtasks/{id}/evaluations", post(api::record_evaluation))
        .route("/workers/register", post(api::register_worker))
        .route("/workers", get(api::list_workers))
        .route("/workers/{id}/heartbeat", post(api::worker_heartbeat))
        .route("/workers/{id}/unregister", post(api::unregister_worker))
        .route("/checkpoints/{id}/decision", post(api::checkpoint_decision))
        .route(
            "/checkpoints/{id}/rollback/preview",
            get(api::rollback_preview),
        )
        .route("/checkpoints/{id}/rollback", post(api::rollback_execute))
        .route("/scheduler/stats", get(api::scheduler_stats))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            request_guards,
        ));

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/ws/{task_id}", get(ws::task_ws_handler))
        .route("/workers/{worker_id}/ws", get(ws::worker_ws_handler))
        .route("/health", get(api::health))
        .route("/metrics", get(api::metrics))
        .layer(cors)
        .with_state(state)
}

/// Rate limiting (all API requests) and admission control (writes).
async fn request_guards(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    let method = request.method().clone();
    let ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    // Fixed-window rate limit scoped to caller + endpoint.
    let decision = state
        .orch
        .cache
        .check_rate_limit(
            &format!("ip:{ip}:{path}"),
            state.orch.config.rate_limit_per_minute,
            std::time::Duration::from_secs(60),
        )
        .await;
    if !decision.allowed {
        state
            .orch
            .metrics
            .inc("taskmesh_rate_limited_total", &[("path", path.as_str())]);
        return ApiError(EngineError::RateLimited {
            retry_after_secs: decision.retry_after_secs,
        })
        .into_response();
    }

    // Backpressure is enforcing for writes, advisory for reads.
    if matches!(method, Method::POST | Method::PUT | Method::PATCH | Method::DELETE) {
        if let Err(err) = state.orch.admission.check_write() {
            state.orch.metrics.inc("taskmesh_admission_rejected_total", &[]);
            return ApiError(EngineError::from(err)).into_response();
        }
    }

    state.in_flight.enter();
    let started = std::time::Instant::now();
    let response = next.run(request).await;
    state.in_flight.exit();

    state.orch.metrics.inc(
        "taskmesh_http_requests_total",
        &[
            ("method", method.as_str()),
            ("path", path.as_str()),
            ("status", response.status().as_str()),
        ],
    );
    state.orch.metrics.observe(
        "taskmesh_http_request_seconds",
        &[("method", method.as_str())],
        started.elapsed().as_secs_f64(),
    );

    response
}

/// Bind and serve until shutdown.
pub async fn serve(state: AppState) -> anyhow::Result<()> {
    let addr = state.orch.config.bind_address.clone();
    let router = build_router(state.clone());

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "taskmesh server listening");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
    })
    .await?;

    state.orch.shutdown().await;
    Ok(())
}
