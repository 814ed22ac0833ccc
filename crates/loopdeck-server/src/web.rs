//! Observer-facing surfaces: the WebSocket event stream at `/ws` and the
//! request/response HTTP mirror of the same operations.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use loopdeck_core::error::{DocumentError, GeneratorError, SupervisorError};
use loopdeck_core::protocol::{ClientCommand, ServerMessage};
use loopdeck_core::LoopMode;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::docs::DocumentStore;
use crate::generator::DocumentGenerator;
use crate::hub::HubHandle;
use crate::supervisor::Supervisor;

const OBSERVER_CHANNEL_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct AppState {
    pub hub: HubHandle,
    pub supervisor: Arc<Supervisor>,
    pub documents: Arc<DocumentStore>,
    pub generator: Arc<DocumentGenerator>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(|| async { "ok" }))
        .route("/api/status", get(combined_status))
        .route("/api/documents", get(list_documents))
        .route("/api/documents/:name", get(read_document).put(write_document))
        .route("/api/loop/start", post(start_loop))
        .route("/api/loop/stop", post(stop_loop))
        .route("/api/generate", post(start_generator))
        .route("/api/generate/cancel", post(cancel_generator))
        .with_state(state)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    if !addr.ip().is_loopback() {
        return StatusCode::FORBIDDEN.into_response();
    }
    ws.on_upgrade(move |socket| async move {
        handle_socket(socket, state.hub).await;
    })
}

async fn handle_socket(socket: WebSocket, hub: HubHandle) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(OBSERVER_CHANNEL_CAPACITY);
    let Some(conn_id) = hub.subscribe(tx).await else {
        return;
    };

    let write_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let Ok(text) = serde_json::to_string(&message) else {
                continue;
            };
            if ws_sender.send(Message::Text(text)).await.is_err() {
                return;
            }
        }
    });

    while let Some(result) = ws_receiver.next().await {
        let message = match result {
            Ok(message) => message,
            Err(err) => {
                warn!(event = "read_error", conn_id = conn_id, error = %err);
                break;
            }
        };
        let data = match message {
            Message::Text(text) => text.into_bytes(),
            Message::Binary(bytes) => bytes,
            Message::Close(_) => {
                info!(event = "observer_close", conn_id = conn_id);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => continue,
        };
        match serde_json::from_slice::<ClientCommand>(&data) {
            Ok(command) => hub.command(conn_id, command),
            Err(err) => {
                warn!(event = "command_invalid", conn_id = conn_id, error = %err);
                hub.reject(conn_id, err.to_string());
            }
        }
    }

    hub.disconnect(conn_id);
    // Removing the subscriber drops our sender; the write task drains out.
    let _ = write_task.await;
}

async fn combined_status(State(state): State<AppState>) -> Response {
    match state.hub.combined_status().await {
        Some(status) => Json(status).into_response(),
        None => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

async fn list_documents(State(state): State<AppState>) -> Response {
    Json(serde_json::json!({ "documents": state.documents.names() })).into_response()
}

async fn read_document(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    match state.documents.read(&name).await {
        Ok(content) => content.into_response(),
        Err(err) => document_error_response(err),
    }
}

async fn write_document(
    State(state): State<AppState>,
    Path(name): Path<String>,
    content: String,
) -> Response {
    match state.documents.write(&name, &content).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => document_error_response(err),
    }
}

#[derive(Debug, Deserialize)]
struct StartLoopRequest {
    mode: LoopMode,
    #[serde(default)]
    iteration_limit: u64,
    #[serde(default)]
    scope_label: Option<String>,
}

async fn start_loop(
    State(state): State<AppState>,
    Json(request): Json<StartLoopRequest>,
) -> Response {
    match state
        .supervisor
        .start(request.mode, request.iteration_limit, request.scope_label)
        .await
    {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(err) => {
            let status = match &err {
                SupervisorError::AlreadyRunning => StatusCode::CONFLICT,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            error_response(status, err.code(), &err.to_string())
        }
    }
}

async fn stop_loop(State(state): State<AppState>) -> Response {
    state.supervisor.stop().await;
    StatusCode::ACCEPTED.into_response()
}

async fn start_generator(State(state): State<AppState>) -> Response {
    match state.generator.start().await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(err) => {
            let status = match &err {
                GeneratorError::Busy => StatusCode::CONFLICT,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            error_response(status, err.code(), &err.to_string())
        }
    }
}

async fn cancel_generator(State(state): State<AppState>) -> Response {
    state.generator.cancel().await;
    StatusCode::ACCEPTED.into_response()
}

fn document_error_response(err: DocumentError) -> Response {
    let status = match &err {
        DocumentError::InvalidName(_) => StatusCode::BAD_REQUEST,
        DocumentError::NotFound(_) => StatusCode::NOT_FOUND,
        DocumentError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, err.code(), &err.to_string())
}

fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    (
        status,
        Json(serde_json::json!({ "code": code, "message": message })),
    )
        .into_response()
}
