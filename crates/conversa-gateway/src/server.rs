use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use conversa_core::{ConversaError, Turn};
use conversa_session::{
    CleanupReport, MaintenanceScheduler, RestoreOutcome, SessionCoordinator, SessionSummary,
    StoreStats, Transcript, TranscriptSummary,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Shared application state.
pub struct AppState {
    /// The session subsystem behind every endpoint.
    pub coordinator: Arc<SessionCoordinator>,
    /// Scheduler handle for the on-demand cleanup trigger.
    pub scheduler: Arc<MaintenanceScheduler>,
}

/// Error wrapper translating [`ConversaError`] into HTTP responses.
pub struct ApiError(ConversaError);

impl From<ConversaError> for ApiError {
    fn from(err: ConversaError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ConversaError::NotFound(_) => StatusCode::NOT_FOUND,
            ConversaError::Validation(_) => StatusCode::BAD_REQUEST,
            ConversaError::Connectivity(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({"error": self.0.to_string()}))).into_response()
    }
}

/// The main HTTP server.
pub struct GatewayServer;

impl GatewayServer {
    /// Builds the router over a coordinator and its maintenance scheduler.
    pub fn build(
        coordinator: Arc<SessionCoordinator>,
        scheduler: Arc<MaintenanceScheduler>,
    ) -> Router {
        let state = Arc::new(AppState {
            coordinator,
            scheduler,
        });

        Router::new()
            .route("/health", get(health_handler))
            .route("/stats", get(stats_handler))
            .route("/sessions", get(list_sessions_handler))
            .route("/sessions/cleanup", post(cleanup_handler))
            .route("/sessions/{id}", delete(clear_session_handler))
            .route("/sessions/{id}/history", get(history_handler))
            .route("/sessions/{id}/exists", get(exists_handler))
            .route("/sessions/{id}/restore", post(restore_handler))
            .route("/transcripts", get(list_transcripts_handler))
            .route("/transcripts/save", post(save_transcript_handler))
            .route("/transcripts/search", get(search_transcripts_handler))
            .route(
                "/transcripts/{id}",
                get(get_transcript_handler).delete(delete_transcript_handler),
            )
            .with_state(state)
    }
}

fn default_limit() -> usize {
    50
}

#[derive(Deserialize)]
struct LimitParams {
    #[serde(default = "default_limit")]
    limit: usize,
}

#[derive(Deserialize)]
struct PageParams {
    #[serde(default = "default_limit")]
    limit: usize,
    #[serde(default)]
    offset: usize,
    session_id: Option<Uuid>,
}

#[derive(Deserialize)]
struct SearchParams {
    q: String,
}

#[derive(Deserialize)]
struct SaveTranscriptRequest {
    session_id: Uuid,
    title: Option<String>,
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "conversa",
        "cache_mode": state.coordinator.cache_mode(),
    }))
}

async fn stats_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<StoreStats>, ApiError> {
    Ok(Json(state.coordinator.stats().await?))
}

async fn list_sessions_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<SessionSummary>>, ApiError> {
    Ok(Json(state.coordinator.list_active_sessions().await?))
}

async fn history_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(params): Query<LimitParams>,
) -> Result<Json<Vec<Turn>>, ApiError> {
    Ok(Json(state.coordinator.get_history(id, params.limit).await?))
}

async fn exists_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let exists = state.coordinator.session_exists(id).await?;
    Ok(Json(json!({"exists": exists})))
}

async fn clear_session_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.coordinator.clear_session(id).await?;
    info!(session_id = %id, "session cleared");
    Ok(StatusCode::NO_CONTENT)
}

async fn restore_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(params): Query<LimitParams>,
) -> Result<Json<RestoreOutcome>, ApiError> {
    let outcome = state
        .coordinator
        .restore_from_durable(id, params.limit)
        .await?;
    info!(session_id = %id, restored = outcome.restored, "restore requested");
    Ok(Json(outcome))
}

async fn cleanup_handler(State(state): State<Arc<AppState>>) -> Json<CleanupReport> {
    Json(state.scheduler.run_once().await)
}

async fn list_transcripts_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<PageParams>,
) -> Result<Json<Vec<TranscriptSummary>>, ApiError> {
    let transcripts = match params.session_id {
        Some(session_id) => {
            state
                .coordinator
                .list_transcripts_for_session(session_id, params.limit)
                .await?
        }
        None => {
            state
                .coordinator
                .list_all_transcripts(params.limit, params.offset)
                .await?
        }
    };
    Ok(Json(transcripts))
}

async fn get_transcript_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Transcript>, ApiError> {
    let transcript = state
        .coordinator
        .get_transcript(id)
        .await?
        .ok_or_else(|| ConversaError::NotFound(format!("transcript {id} does not exist")))?;
    Ok(Json(transcript))
}

async fn save_transcript_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SaveTranscriptRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let id = state
        .coordinator
        .save_transcript(req.session_id, req.title.as_deref())
        .await?;
    info!(session_id = %req.session_id, transcript_id = %id, "transcript saved");
    Ok(Json(json!({"transcript_id": id})))
}

async fn delete_transcript_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    if state.coordinator.delete_transcript(id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ConversaError::NotFound(format!("transcript {id} does not exist")).into())
    }
}

async fn search_transcripts_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SearchParams>,
) -> Result<Json<Vec<TranscriptSummary>>, ApiError> {
    Ok(Json(state.coordinator.search_transcripts(&params.q).await?))
}
