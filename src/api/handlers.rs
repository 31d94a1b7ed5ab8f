//! HTTP request handlers

use super::sse::sse_stream;
use super::types::{
    CreateSessionRequest, ErrorResponse, EventResponse, FlowListResponse, SessionResponse,
    SuccessResponse,
};
use super::AppState;
use crate::controller::ConversationController;
use crate::flow::{FlowDocument, FlowError};
use crate::machine::{ClientEvent, Machine, TransitionError};
use crate::runtime::SessionError;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Flow catalog
        .route("/api/flows", get(list_flows))
        // Session lifecycle
        .route("/api/sessions", post(create_session))
        .route("/api/sessions/:id", get(get_session).delete(delete_session))
        // Event submission
        .route("/api/sessions/:id/events", post(send_event))
        // SSE streaming
        .route("/api/sessions/:id/stream", get(stream_session))
        // Version
        .route("/version", get(get_version))
        .with_state(state)
}

// ============================================================
// Flows
// ============================================================

async fn list_flows(State(state): State<AppState>) -> Json<FlowListResponse> {
    Json(FlowListResponse {
        flows: state.catalog.summaries(),
    })
}

// ============================================================
// Sessions
// ============================================================

async fn create_session(
    State(state): State<AppState>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<SessionResponse>), AppError> {
    let machine = match (req.flow_id, req.flow) {
        (_, Some(inline)) => {
            let document = FlowDocument::from_value(inline)?;
            Arc::new(Machine::build(&document, &state.registry)?)
        }
        (Some(flow_id), None) => state
            .catalog
            .get(&flow_id)
            .ok_or_else(|| AppError::NotFound(format!("Flow not found: {flow_id}")))?,
        (None, None) => {
            return Err(AppError::BadRequest(
                "Either flowId or flow is required".to_string(),
            ))
        }
    };

    let session = state.sessions.create(machine, req.metadata).await;
    tracing::info!(session_id = %session.id(), "Session created");
    let controller = state.controller(session);
    Ok((StatusCode::CREATED, Json(session_response(&controller).await?)))
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionResponse>, AppError> {
    let session = state.sessions.get(&id).await?;
    let controller = state.controller(session);
    Ok(Json(session_response(&controller).await?))
}

async fn send_event(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(event): Json<ClientEvent>,
) -> Result<Json<EventResponse>, AppError> {
    let session = state.sessions.get(&id).await?;
    let controller = state.controller(session);
    let submission = controller.send(event).await?;
    Ok(Json(EventResponse {
        submission,
        snapshot: controller.session().snapshot(),
    }))
}

async fn stream_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let session = state.sessions.get(&id).await?;
    // Subscribe before reading the snapshot so no update falls in between.
    let updates = session.subscribe();
    Ok(sse_stream(session.snapshot(), updates))
}

async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SuccessResponse>, AppError> {
    state.sessions.remove(&id).await?;
    Ok(Json(SuccessResponse { success: true }))
}

async fn session_response(controller: &ConversationController) -> Result<SessionResponse, AppError> {
    let surface = controller.surface().await?;
    Ok(SessionResponse {
        snapshot: controller.session().snapshot(),
        surface,
    })
}

// ============================================================
// Version
// ============================================================

async fn get_version() -> &'static str {
    concat!("chatflow ", env!("CARGO_PKG_VERSION"))
}

// ============================================================
// Error Handling
// ============================================================

#[derive(Debug)]
enum AppError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Internal(String),
}

impl From<SessionError> for AppError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::NotFound(_) => AppError::NotFound(e.to_string()),
            SessionError::Rejected(TransitionError::UnknownStep(_)) | SessionError::UnknownStep(_) => {
                AppError::Internal(e.to_string())
            }
            SessionError::Rejected(_) => AppError::Conflict(e.to_string()),
            SessionError::Closed => AppError::Internal(e.to_string()),
        }
    }
}

impl From<FlowError> for AppError {
    fn from(e: FlowError) -> Self {
        AppError::BadRequest(e.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::Internal(msg) => {
                tracing::error!(error = %msg, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        let body = Json(ErrorResponse::new(message));
        (status, body).into_response()
    }
}
