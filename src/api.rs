//! REST API server for the chatbot
//!
//! Exposes the conversation orchestrator over HTTP for the chat widget.

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};

use crate::conversational::{ConversationOrchestrator, FALLBACK_REPLY, MISSING_FIELDS};
use crate::error::ChatbotError;

/// =============================
/// Request / Response Models
/// =============================

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct ChatResponse {
    pub response: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sources: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_urls: Option<Vec<String>>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
        }
    }
}

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ErrorResponse>)>;

fn bad_request() -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse::new(MISSING_FIELDS)),
    )
}

fn internal_error() -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse::new(FALLBACK_REPLY)),
    )
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<ConversationOrchestrator>,
}

/// =============================
/// Health Endpoint
/// =============================

async fn health(State(state): State<ApiState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "retrieval": state.orchestrator.retrieval_enabled(),
    }))
}

/// =============================
/// Chat Endpoint
/// =============================

async fn chat_handler(
    State(state): State<ApiState>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> ApiResult<ChatResponse> {
    let Json(req) = payload.map_err(|rejection| {
        warn!("Rejected chat request body: {}", rejection);
        bad_request()
    })?;

    let session_id = req.session_id.unwrap_or_default();
    let message = req.message.unwrap_or_default();

    match state.orchestrator.handle_turn(&session_id, &message).await {
        Ok(reply) if reply.degraded => Err(internal_error()),
        Ok(reply) => Ok(Json(ChatResponse {
            response: reply.response,
            sources: reply.sources,
            source_urls: reply.source_urls,
        })),
        Err(ChatbotError::InvalidRequest(_)) => Err(bad_request()),
        Err(e) => {
            error!(session_id = %session_id, "Chat turn failed: {}", e);
            Err(internal_error())
        }
    }
}

/// =============================
/// Index Maintenance
/// =============================

async fn rebuild_index(State(state): State<ApiState>) -> ApiResult<serde_json::Value> {
    let Some(augmenter) = state.orchestrator.augmenter() else {
        return Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new("Retrieval is disabled")),
        ));
    };

    match augmenter.index().rebuild().await {
        Ok(index) => {
            info!(entries = index.len(), "Retrieval index rebuilt on request");
            Ok(Json(serde_json::json!({ "entries": index.len() })))
        }
        Err(e) => {
            error!("Index rebuild failed: {}", e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new(e.to_string())),
            ))
        }
    }
}

/// =============================
/// Router
/// =============================

pub fn create_router(orchestrator: Arc<ConversationOrchestrator>) -> Router {
    let state = ApiState { orchestrator };

    Router::new()
        .route("/health", get(health))
        .route("/chat", post(chat_handler))
        .route("/admin/index/rebuild", post(rebuild_index))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    orchestrator: Arc<ConversationOrchestrator>,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(orchestrator);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", port);
    info!("Local: http://127.0.0.1:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}
