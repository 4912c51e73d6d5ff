//! WebSocket endpoints.
//!
//! `/ws/{task_id}` streams a task's event envelopes to front-end
//! clients. On connect the client's mailbox is drained first and only
//! then does the live subscription start, so a brief disconnect loses
//! nothing. `/api/v1/workers/{worker_id}/ws` is the worker side:
//! heartbeats and subtask results arrive as JSON messages.
//!
//! Liveness: the server pings every 30 s and closes a socket whose pong
//! does not arrive within 10 s.

use std::sync::atomic::Ordering;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use taskmesh_engine::EngineError;
use taskmesh_store::{Heartbeat, SubtaskOutcome, WorkerStatus};

use crate::error::ApiError;
use crate::state::AppState;

const PING_INTERVAL: Duration = Duration::from_secs(30);
const PONG_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Default, Deserialize)]
pub struct ClientWsQuery {
    /// Stable client identity for mailbox continuity across reconnects.
    pub client_id: Option<String>,
}

// ---------------------------------------------------------------------------
// GET /ws/{task_id}
// ---------------------------------------------------------------------------

pub async fn task_ws_handler(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
    Query(query): Query<ClientWsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let limit = state.orch.config.max_ws_connections as u64;
    if state.ws_connections.load(Ordering::Acquire) >= limit {
        return ApiError(EngineError::Backpressure {
            utilization_percent: 100.0,
        })
        .into_response();
    }

    let client_id = query
        .client_id
        .unwrap_or_else(|| format!("client-{}", Uuid::now_v7()));
    ws.on_upgrade(move |socket| handle_task_socket(state, task_id, client_id, socket))
}

async fn handle_task_socket(
    state: AppState,
    task_id: Uuid,
    client_id: String,
    mut socket: WebSocket,
) {
    state.ws_connections.fetch_add(1, Ordering::AcqRel);
    info!(task_id = %task_id, client_id = %client_id, "task websocket connected");

    // Missed events first, then the live subscription: no gap, and at
    // most one duplicate across an overlapping reconnect.
    for envelope in state.orch.bus.drain_mailbox(&client_id).await {
        if let Ok(json) = serde_json::to_string(&envelope) {
            if socket.send(Message::Text(json.into())).await.is_err() {
                state.ws_connections.fetch_sub(1, Ordering::AcqRel);
                return;
            }
        }
    }

    state.orch.bus.register_client(task_id, &client_id);
    let mut events = match state.orch.bus.subscribe(task_id).await {
        Ok(rx) => rx,
        Err(err) => {
            warn!(task_id = %task_id, %err, "subscribe failed; closing socket");
            state.ws_connections.fetch_sub(1, Ordering::AcqRel);
            return;
        }
    };

    let mut ping_timer = tokio::time::interval(PING_INTERVAL);
    ping_timer.tick().await; // first tick fires immediately
    let mut awaiting_pong: Option<Instant> = None;

    let clean_close = loop {
        let pong_deadline = async {
            match awaiting_pong {
                Some(sent_at) => tokio::time::sleep_until(sent_at + PONG_GRACE).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            event = events.recv() => match event {
                Ok(envelope) => {
                    let Ok(json) = serde_json::to_string(&*envelope) else { continue };
                    if socket.send(Message::Text(json.into())).await.is_err() {
                        break false;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(task_id = %task_id, missed, "client lagged; events skipped");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break false,
            },
            message = socket.recv() => match message {
                Some(Ok(Message::Pong(_))) => awaiting_pong = None,
                Some(Ok(Message::Close(_))) => break true,
                Some(Ok(_)) => {}
                Some(Err(_)) | None => break false,
            },
            _ = ping_timer.tick() => {
                if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break false;
                }
                awaiting_pong = Some(Instant::now());
            },
            _ = pong_deadline => {
                debug!(task_id = %task_id, client_id = %client_id, "pong timeout; closing");
                break false;
            },
        }
    };

    state.orch.bus.unsubscribe(task_id);
    if clean_close {
        // Deliberate close: stop buffering for this client.
        state.orch.bus.deregister_client(task_id, &client_id);
    }
    state.ws_connections.fetch_sub(1, Ordering::AcqRel);
    info!(task_id = %task_id, client_id = %client_id, clean_close, "task websocket closed");
}

// ---------------------------------------------------------------------------
// GET /api/v1/workers/{worker_id}/ws
// ---------------------------------------------------------------------------

/// Messages a worker sends over its socket.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WorkerMessage {
    Heartbeat {
        #[serde(default)]
        status: Option<WorkerStatus>,
        #[serde(default)]
        cpu_percent: f64,
        #[serde(default)]
        memory_percent: f64,
        #[serde(default)]
        disk_percent: f64,
    },
    Result {
        subtask_id: Uuid,
        status: String,
        #[serde(default)]
        output: Option<Value>,
        #[serde(default)]
        error: Option<String>,
    },
}

pub async fn worker_ws_handler(
    State(state): State<AppState>,
    Path(worker_id): Path<Uuid>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_worker_socket(state, worker_id, socket))
}

async fn handle_worker_socket(state: AppState, worker_id: Uuid, mut socket: WebSocket) {
    info!(worker_id = %worker_id, "worker websocket connected");

    while let Some(message) = socket.recv().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(_) => break,
        };

        let parsed: WorkerMessage = match serde_json::from_str(text.as_str()) {
            Ok(parsed) => parsed,
            Err(err) => {
                let _ = socket
                    .send(Message::Text(
                        serde_json::json!({"type": "error", "message": err.to_string()})
                            .to_string()
                            .into(),
                    ))
                    .await;
                continue;
            }
        };

        let ack = match parsed {
            WorkerMessage::Heartbeat {
                status,
                cpu_percent,
                memory_percent,
                disk_percent,
            } => state
                .orch
                .ingest_heartbeat(
                    worker_id,
                    Heartbeat {
                        status: status.unwrap_or(WorkerStatus::Online),
                        cpu_percent,
                        memory_percent,
                        disk_percent,
                    },
                )
                .await
                .map(|_| serde_json::json!({"type": "ack", "of": "heartbeat"})),
            WorkerMessage::Result {
                subtask_id,
                status,
                output,
                error,
            } => {
                let outcome = match status.as_str() {
                    "completed" => SubtaskOutcome::Completed {
                        output: output.unwrap_or_else(|| serde_json::json!({})),
                    },
                    _ => SubtaskOutcome::Failed {
                        error: error.unwrap_or_else(|| "worker reported failure".into()),
                    },
                };
                state
                    .orch
                    .report_subtask_result(subtask_id, outcome)
                    .await
                    .map(|subtask| {
                        serde_json::json!({
                            "type": "ack",
                            "of": "result",
                            "subtask_id": subtask.id,
                            "status": subtask.status,
                        })
                    })
            }
        };

        let reply = match ack {
            Ok(reply) => reply,
            Err(err) => serde_json::json!({
                "type": "error",
                "error_code": err.error_code().as_str(),
                "message": err.to_string(),
                "retryable": err.is_retryable(),
            }),
        };
        if socket
            .send(Message::Text(reply.to_string().into()))
            .await
            .is_err()
        {
            break;
        }
    }

    info!(worker_id = %worker_id, "worker websocket closed");
}
