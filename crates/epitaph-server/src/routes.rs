use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::middleware;
use axum::response::IntoResponse;
use axum::routing::get;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;
use uuid::Uuid;

use epitaph_core::error::AppError;
use epitaph_core::traits::{EnrichmentWriter, SubjectSource};

use crate::auth::require_admin_token;
use crate::dto::{
    HealthResponse, HistoryEntryResponse, HistoryResponse, ListRunsQuery, RunListResponse,
    RunProgressResponse, StartRunRequest, StartRunResponse, StopRunResponse,
};
use crate::error::ApiError;
use crate::openapi::ApiDoc;
use crate::state::AppState;

/// Build the full router with all routes and middleware.
pub fn router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/v1/runs", get(list_runs).post(start_run))
        .route("/v1/runs/{id}", get(get_run).delete(stop_run))
        .route("/v1/subjects/{id}/history", get(subject_history))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_admin_token,
        ));

    let public = Router::new()
        .route("/health", get(health))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()));

    public.merge(api).with_state(state)
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

#[utoipa::path(
    post,
    path = "/v1/runs",
    request_body = StartRunRequest,
    responses(
        (status = 202, description = "Run started", body = StartRunResponse),
        (status = 400, description = "Bad request", body = crate::dto::ErrorResponse),
        (status = 409, description = "A run of this type is active", body = crate::dto::ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "runs"
)]
pub async fn start_run(
    State(state): State<Arc<AppState>>,
    axum::Json(body): axum::Json<StartRunRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let config = body.into_config()?;
    let run_type = config.run_type.clone();
    let run_id = state.runs.start(config).await?;

    Ok((
        StatusCode::ACCEPTED,
        axum::Json(StartRunResponse { run_id, run_type }),
    ))
}

#[utoipa::path(
    get,
    path = "/v1/runs",
    params(ListRunsQuery),
    responses(
        (status = 200, description = "Recent runs, newest first", body = RunListResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "runs"
)]
pub async fn list_runs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListRunsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = query.limit.unwrap_or(20).clamp(1, 100);
    let runs = state.runs.list(limit).await?;
    let total = runs.len();

    Ok(axum::Json(RunListResponse {
        runs: runs.into_iter().map(RunProgressResponse::from).collect(),
        total,
    }))
}

#[utoipa::path(
    get,
    path = "/v1/runs/{id}",
    params(
        ("id" = Uuid, Path, description = "Run ID")
    ),
    responses(
        (status = 200, description = "Run progress", body = RunProgressResponse),
        (status = 404, description = "Not found", body = crate::dto::ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "runs"
)]
pub async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let progress = state
        .runs
        .progress(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("Run not found: {id}")))?;

    Ok(axum::Json(RunProgressResponse::from(progress)))
}

#[utoipa::path(
    delete,
    path = "/v1/runs/{id}",
    params(
        ("id" = Uuid, Path, description = "Run ID")
    ),
    responses(
        (status = 202, description = "Stop requested", body = StopRunResponse),
        (status = 404, description = "Not found", body = crate::dto::ErrorResponse),
        (status = 409, description = "Run already finished", body = crate::dto::ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "runs"
)]
pub async fn stop_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    if state.runs.stop(id).await {
        let response = StopRunResponse {
            run_id: id,
            stop_requested: true,
        };
        return Ok((StatusCode::ACCEPTED, axum::Json(response)));
    }

    match state.runs.progress(id).await? {
        Some(progress) => Err(AppError::Conflict(format!(
            "Run {id} is not active: {}",
            progress.status
        ))
        .into()),
        None => Err(ApiError::not_found(format!("Run not found: {id}"))),
    }
}

// ---------------------------------------------------------------------------
// Subjects
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/v1/subjects/{id}/history",
    params(
        ("id" = i64, Path, description = "Subject ID")
    ),
    responses(
        (status = 200, description = "Field history, oldest first", body = HistoryResponse),
        (status = 404, description = "Not found", body = crate::dto::ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "subjects"
)]
pub async fn subject_history(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    if state.db.get_subject(id).await?.is_none() {
        return Err(ApiError::not_found(format!("Subject not found: {id}")));
    }

    let entries = state.db.history(id).await?;
    let total = entries.len();

    Ok(axum::Json(HistoryResponse {
        subject_id: id,
        entries: entries.into_iter().map(HistoryEntryResponse::from).collect(),
        total,
    }))
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse),
        (status = 503, description = "Service is unhealthy", body = HealthResponse),
    ),
    tag = "system"
)]
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let db_status = match state.db.health_check().await {
        Ok(()) => "ok",
        Err(_) => "error",
    };

    let status = if db_status == "ok" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = HealthResponse {
        status: if db_status == "ok" {
            "healthy"
        } else {
            "unhealthy"
        },
        database: db_status,
    };

    (status, axum::Json(response))
}
