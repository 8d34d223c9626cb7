use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

use super::sse;
use crate::ci::{CiPollResult, CiPoller, validate_sha};
use crate::errors::CiError;
use crate::orchestrator::{BatchCallbacks, BatchHandle, IssueProcessor};
use crate::session::{ProcessingOptions, SessionRegistry};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub registry: SessionRegistry,
    pub processor: IssueProcessor,
    pub default_options: ProcessingOptions,
    pub batches: Mutex<HashMap<Uuid, BatchHandle>>,
    /// `None` when no repository is configured for CI polling.
    pub ci: Option<CiPoller>,
    pub ci_auto_fix: bool,
    pub ci_polls: Mutex<HashMap<String, watch::Receiver<CiPollResult>>>,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(processor: IssueProcessor, default_options: ProcessingOptions) -> Self {
        Self {
            registry: processor.registry().clone(),
            processor,
            default_options,
            batches: Mutex::new(HashMap::new()),
            ci: None,
            ci_auto_fix: false,
            ci_polls: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_ci(mut self, poller: CiPoller, auto_fix: bool) -> Self {
        self.ci = Some(poller);
        self.ci_auto_fix = auto_fix;
        self
    }

    fn batches(&self) -> MutexGuard<'_, HashMap<Uuid, BatchHandle>> {
        self.batches.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ci_polls(&self) -> MutexGuard<'_, HashMap<String, watch::Receiver<CiPollResult>>> {
        self.ci_polls.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ── Request / response payload types ──────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessRequest {
    pub issue_ids: Vec<String>,
    #[serde(default)]
    pub options: Option<ProcessingOptions>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessResponse {
    pub batch_id: Uuid,
    pub issue_ids: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelResponse {
    pub batch_id: Uuid,
    /// False when the batch had already finished.
    pub cancelled: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CiPollRequest {
    pub sha: String,
    #[serde(default)]
    pub auto_fix: Option<bool>,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unavailable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<CiError> for ApiError {
    fn from(err: CiError) -> Self {
        match err {
            CiError::InvalidSha(_) => ApiError::BadRequest(err.to_string()),
            CiError::MissingRepo => ApiError::Unavailable(err.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/process", post(process_issues))
        .route("/api/batches/{id}/cancel", post(cancel_batch))
        .route("/api/sessions", get(list_sessions))
        .route(
            "/api/sessions/{issue_id}",
            get(get_session).delete(delete_session),
        )
        .route("/api/sessions/{issue_id}/stream", get(stream_session))
        .route("/api/ci/poll", post(start_ci_poll))
        .route("/api/ci/{sha}", get(get_ci_status))
        .route("/health", get(health_check))
}

// ── Helpers ───────────────────────────────────────────────────────────

/// Trim ids, drop blanks and duplicates, keep first-seen order.
fn normalize_issue_ids(ids: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    ids.into_iter()
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty() && seen.insert(id.clone()))
        .collect()
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn process_issues(
    State(state): State<SharedState>,
    Json(req): Json<ProcessRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let issue_ids = normalize_issue_ids(req.issue_ids);
    if issue_ids.is_empty() {
        return Err(ApiError::BadRequest("issueIds must not be empty".to_string()));
    }
    let options = req.options.unwrap_or_else(|| state.default_options.clone());
    if options.max_iterations == 0 {
        return Err(ApiError::BadRequest("maxIterations must be at least 1".to_string()));
    }

    let handle = state
        .processor
        .process_issues(issue_ids.clone(), options, BatchCallbacks::new());
    let batch_id = handle.id();
    tracing::info!(batch_id = %batch_id, issues = %issue_ids.join(","), "Batch accepted");

    let mut batches = state.batches();
    batches.retain(|_, h| !h.is_finished());
    batches.insert(batch_id, handle);

    Ok((
        StatusCode::ACCEPTED,
        Json(ProcessResponse {
            batch_id,
            issue_ids,
        }),
    ))
}

async fn cancel_batch(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let batches = state.batches();
    let handle = batches
        .get(&id)
        .ok_or_else(|| ApiError::NotFound(format!("Batch {} not found", id)))?;
    let cancelled = handle.cancel();
    Ok(Json(CancelResponse {
        batch_id: id,
        cancelled,
    }))
}

async fn list_sessions(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.registry.list_sessions())
}

async fn get_session(
    State(state): State<SharedState>,
    Path(issue_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .registry
        .get_session(&issue_id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Session {} not found", issue_id)))
}

async fn delete_session(
    State(state): State<SharedState>,
    Path(issue_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if state.registry.remove_session(&issue_id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("Session {} not found", issue_id)))
    }
}

async fn stream_session(
    State(state): State<SharedState>,
    Path(issue_id): Path<String>,
) -> impl IntoResponse {
    sse::session_stream(&state.registry, &issue_id)
}

async fn start_ci_poll(
    State(state): State<SharedState>,
    Json(req): Json<CiPollRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let poller = state
        .ci
        .as_ref()
        .ok_or_else(|| ApiError::Unavailable(CiError::MissingRepo.to_string()))?;
    let sha = validate_sha(&req.sha)?;

    let mut polls = state.ci_polls();
    if let Some(rx) = polls.get(&sha)
        && !rx.borrow().done
    {
        let current = rx.borrow().clone();
        return Ok((StatusCode::ACCEPTED, Json(current)));
    }

    let handle = poller.spawn(&sha, req.auto_fix.unwrap_or(state.ci_auto_fix))?;
    let initial = handle.updates.borrow().clone();
    polls.insert(sha.clone(), handle.updates);
    tracing::info!(sha = %sha, "CI polling started");
    Ok((StatusCode::ACCEPTED, Json(initial)))
}

async fn get_ci_status(
    State(state): State<SharedState>,
    Path(sha): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let sha = validate_sha(&sha)?;
    let polls = state.ci_polls();
    let rx = polls
        .get(&sha)
        .ok_or_else(|| ApiError::NotFound(format!("No CI poll for {}", sha)))?;
    let result = rx.borrow().clone();
    Ok(Json(result))
}
