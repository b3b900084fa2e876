//! HTTP control surface over the [`AccountSupervisor`].
//!
//! Operator routes address accounts by id under `/api/accounts`. Owner
//! routes address an account by its token under `/api/me/{token}`.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use rc_core::types::AccountId;
use rc_engine::client::ClientError;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tower_http::trace::TraceLayer;

use crate::supervisor::{AccountSupervisor, AccountUpdate, InviteSignup, SupervisorError, WindowRequest};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// The course platform or identity provider failed.
    #[error("upstream: {0}")]
    Upstream(String),

    #[error("internal error: {0}")]
    InternalError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Upstream(msg) => (StatusCode::BAD_GATEWAY, msg),
            ApiError::InternalError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<SupervisorError> for ApiError {
    fn from(err: SupervisorError) -> Self {
        let message = err.to_string();
        match err {
            SupervisorError::NotFound(_) => ApiError::NotFound(message),
            SupervisorError::Config(_) | SupervisorError::InvalidInvite => ApiError::BadRequest(message),
            SupervisorError::Duplicate(_) => ApiError::Conflict(message),
            SupervisorError::Login(ClientError::AuthExpired(_)) => ApiError::BadRequest(message),
            SupervisorError::Login(_) => ApiError::Upstream(message),
            SupervisorError::Store(_) => {
                tracing::error!(error = %message, "account store failure");
                ApiError::InternalError(message)
            }
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ---------------------------------------------------------------------------
// Query parameters
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct ControlQuery {
    #[serde(default)]
    pub force_override: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct LogsQuery {
    pub limit: Option<usize>,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn router(supervisor: AccountSupervisor) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/accounts", get(list_accounts).post(upsert_account))
        .route("/api/accounts/{id}", get(account_status).delete(delete_account))
        .route("/api/accounts/{id}/start", post(start_account))
        .route("/api/accounts/{id}/stop", post(stop_account))
        .route("/api/accounts/{id}/window", put(update_window))
        .route("/api/accounts/{id}/logs", get(account_logs).delete(clear_account_logs))
        .route("/api/signup", post(signup))
        .route("/api/me/{token}", get(owner_status).put(owner_update))
        .route("/api/me/{token}/start", post(owner_start))
        .route("/api/me/{token}/stop", post(owner_stop))
        .route("/api/me/{token}/window", put(owner_window))
        .route("/api/me/{token}/logs", get(owner_logs).delete(owner_clear_logs))
        .layer(TraceLayer::new_for_http())
        .with_state(supervisor)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

// -- Operator routes ----------------------------------------------------------

async fn list_accounts(State(sv): State<AccountSupervisor>) -> impl IntoResponse {
    Json(sv.list().await)
}

async fn upsert_account(
    State(sv): State<AccountSupervisor>,
    Json(update): Json<AccountUpdate>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(sv.upsert(update).await?))
}

async fn account_status(
    State(sv): State<AccountSupervisor>,
    Path(id): Path<AccountId>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(sv.status(id).await?))
}

async fn delete_account(
    State(sv): State<AccountSupervisor>,
    Path(id): Path<AccountId>,
) -> ApiResult<impl IntoResponse> {
    sv.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn start_account(
    State(sv): State<AccountSupervisor>,
    Path(id): Path<AccountId>,
    Query(q): Query<ControlQuery>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(sv.start(id, q.force_override).await?))
}

async fn stop_account(
    State(sv): State<AccountSupervisor>,
    Path(id): Path<AccountId>,
    Query(q): Query<ControlQuery>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(sv.stop(id, q.force_override).await?))
}

async fn update_window(
    State(sv): State<AccountSupervisor>,
    Path(id): Path<AccountId>,
    Json(req): Json<WindowRequest>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(sv.update_window(id, &req).await?))
}

async fn account_logs(
    State(sv): State<AccountSupervisor>,
    Path(id): Path<AccountId>,
    Query(q): Query<LogsQuery>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(sv.logs(id, q.limit).await?))
}

async fn clear_account_logs(
    State(sv): State<AccountSupervisor>,
    Path(id): Path<AccountId>,
) -> ApiResult<impl IntoResponse> {
    sv.clear_logs(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// -- Owner routes -------------------------------------------------------------

async fn signup(
    State(sv): State<AccountSupervisor>,
    Json(req): Json<InviteSignup>,
) -> ApiResult<impl IntoResponse> {
    Ok((StatusCode::CREATED, Json(sv.create_via_invite(req).await?)))
}

async fn owner_status(
    State(sv): State<AccountSupervisor>,
    Path(token): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(sv.status_by_token(&token).await?))
}

async fn owner_update(
    State(sv): State<AccountSupervisor>,
    Path(token): Path<String>,
    Json(update): Json<AccountUpdate>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(sv.update_by_token(&token, update).await?))
}

async fn owner_start(
    State(sv): State<AccountSupervisor>,
    Path(token): Path<String>,
    Query(q): Query<ControlQuery>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(sv.start_by_token(&token, q.force_override).await?))
}

async fn owner_stop(
    State(sv): State<AccountSupervisor>,
    Path(token): Path<String>,
    Query(q): Query<ControlQuery>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(sv.stop_by_token(&token, q.force_override).await?))
}

async fn owner_window(
    State(sv): State<AccountSupervisor>,
    Path(token): Path<String>,
    Json(req): Json<WindowRequest>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(sv.update_window_by_token(&token, &req).await?))
}

async fn owner_logs(
    State(sv): State<AccountSupervisor>,
    Path(token): Path<String>,
    Query(q): Query<LogsQuery>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(sv.logs_by_token(&token, q.limit).await?))
}

async fn owner_clear_logs(
    State(sv): State<AccountSupervisor>,
    Path(token): Path<String>,
) -> ApiResult<impl IntoResponse> {
    sv.clear_logs_by_token(&token).await?;
    Ok(StatusCode::NO_CONTENT)
}
