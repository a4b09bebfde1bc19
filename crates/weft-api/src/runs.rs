// Run status HTTP routes

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, patch},
    Json, Router,
};
use serde::Deserialize;
use utoipa::ToSchema;
use uuid::Uuid;

use weft_core::model::Run;

use crate::auth::AuthUser;
use crate::AppState;

/// Query parameters for listing runs
#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ListRunsParams {
    pub workflow_id: Uuid,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    20
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/runs", get(list_runs))
        .route("/v1/runs/:id", get(get_run))
        .route("/v1/runs/:id/cancel", patch(cancel_run))
        .with_state(state)
}

fn internal<E: std::fmt::Display>(e: E) -> StatusCode {
    tracing::error!("request failed: {e}");
    StatusCode::INTERNAL_SERVER_ERROR
}

async fn load_visible_run(state: &AppState, user: AuthUser, id: Uuid) -> Result<Run, StatusCode> {
    let run = state
        .db
        .get_run(id)
        .await
        .map_err(internal)?
        .ok_or(StatusCode::NOT_FOUND)?;
    if run.user_id != user.0 {
        // Cross-tenant access reads as absence
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(run)
}

/// GET /v1/runs?workflowId= - Recent runs of a workflow
#[utoipa::path(
    get,
    path = "/v1/runs",
    params(
        ("workflowId" = Uuid, Query, description = "Workflow to list runs for"),
        ("limit" = Option<i64>, Query, description = "Max results (default 20)")
    ),
    responses(
        (status = 200, description = "Runs, newest first", body = Vec<Run>),
        (status = 404, description = "Workflow not found")
    ),
    tag = "runs"
)]
pub async fn list_runs(
    State(state): State<AppState>,
    user: AuthUser,
    Query(params): Query<ListRunsParams>,
) -> Result<Json<Vec<Run>>, StatusCode> {
    let workflow = state
        .db
        .get_workflow(params.workflow_id)
        .await
        .map_err(internal)?
        .ok_or(StatusCode::NOT_FOUND)?;
    if workflow.user_id != user.0 {
        return Err(StatusCode::NOT_FOUND);
    }

    let runs = state
        .db
        .list_runs(params.workflow_id, params.limit.clamp(1, 100))
        .await
        .map_err(internal)?;
    Ok(Json(runs))
}

/// GET /v1/runs/{id} - Run status and outputs
#[utoipa::path(
    get,
    path = "/v1/runs/{id}",
    params(("id" = Uuid, Path, description = "Run ID")),
    responses(
        (status = 200, description = "The run", body = Run),
        (status = 404, description = "Not found")
    ),
    tag = "runs"
)]
pub async fn get_run(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<Run>, StatusCode> {
    let run = load_visible_run(&state, user, id).await?;
    Ok(Json(run))
}

/// PATCH /v1/runs/{id}/cancel - Cancel a queued or running run
///
/// A queued run is finalized immediately; a running run is stopped by its
/// worker at the next suspension point (observed via heartbeat).
#[utoipa::path(
    patch,
    path = "/v1/runs/{id}/cancel",
    params(("id" = Uuid, Path, description = "Run ID")),
    responses(
        (status = 200, description = "Cancellation recorded", body = Run),
        (status = 404, description = "Not found"),
        (status = 409, description = "Run already finished")
    ),
    tag = "runs"
)]
pub async fn cancel_run(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<Run>, StatusCode> {
    let run = load_visible_run(&state, user, id).await?;
    if run.status.is_terminal() {
        return Err(StatusCode::CONFLICT);
    }

    let cancelled = state.db.cancel_run(id).await.map_err(internal)?;
    if !cancelled {
        return Err(StatusCode::CONFLICT);
    }

    let run = state
        .db
        .get_run(id)
        .await
        .map_err(internal)?
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(run))
}
