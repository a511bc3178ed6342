//! HTTP surface: accept broadcasts, report status, expose pool health.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use bc_common::PoolStats;
use bc_dispatch::{BroadcastHandle, BroadcastOrchestrator, BroadcastRequest, DispatchError, DispatchPool};

use crate::auth::Authenticator;

/// In-flight sends older than this show up as stalled on /health
const STALL_THRESHOLD: Duration = Duration::from_secs(300);

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<BroadcastOrchestrator>,
    pub pool: Arc<DispatchPool>,
    pub auth: Arc<dyn Authenticator>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/broadcasts", post(create_broadcast))
        .route("/broadcasts/:id/status", get(broadcast_status))
        .route("/health", get(health))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateBroadcastBody {
    #[serde(default)]
    message_content: Option<String>,
    #[serde(default)]
    template_name: Option<String>,
    #[serde(default = "default_language")]
    language_code: String,
    business_account_id: String,
    sender_phone_id: String,
    recipients: Vec<String>,
}

fn default_language() -> String {
    "en_US".to_string()
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    broadcast_id: String,
    status_counts: BTreeMap<String, u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    pool: PoolStats,
    stalled_jobs: usize,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
}

enum ApiError {
    Unauthorized,
    Dispatch(DispatchError),
}

impl From<DispatchError> for ApiError {
    fn from(e: DispatchError) -> Self {
        Self::Dispatch(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message) = match self {
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "UNAUTHORIZED",
                "Missing or invalid bearer token".to_string(),
            ),
            ApiError::Dispatch(e) => {
                let (status, error) = match &e {
                    DispatchError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "INVALID_REQUEST"),
                    DispatchError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
                    DispatchError::Queue(_) | DispatchError::Persistence(_) => {
                        (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
                    }
                };
                (status, error, e.to_string())
            }
        };

        (status, Json(ErrorResponse { error, message })).into_response()
    }
}

fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .and_then(|token| state.auth.authenticate(token))
        .ok_or(ApiError::Unauthorized)
}

async fn create_broadcast(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateBroadcastBody>,
) -> Result<(StatusCode, Json<BroadcastHandle>), ApiError> {
    let user_id = authenticate(&state, &headers)?;

    let handle = state
        .orchestrator
        .submit(BroadcastRequest {
            user_id,
            message_content: body.message_content,
            template_name: body.template_name,
            language_code: body.language_code,
            business_account_id: body.business_account_id,
            sender_phone_id: body.sender_phone_id,
            recipients: body.recipients,
        })
        .await?;

    // accepted for dispatch; delivery outcomes arrive via the status endpoint
    Ok((StatusCode::ACCEPTED, Json(handle)))
}

async fn broadcast_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    authenticate(&state, &headers)?;

    let counts = state.orchestrator.get_status(&id).await?;
    Ok(Json(StatusResponse {
        broadcast_id: id,
        status_counts: counts
            .into_iter()
            .map(|(status, count)| (status.as_str().to_string(), count))
            .collect(),
    }))
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "UP",
        pool: state.pool.stats(),
        stalled_jobs: state.pool.stalled_jobs(STALL_THRESHOLD).len(),
    })
}
