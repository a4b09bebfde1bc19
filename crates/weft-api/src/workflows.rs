// Workflow CRUD and manual-run HTTP routes

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use utoipa::ToSchema;
use uuid::Uuid;

use weft_core::model::{
    Run, Trigger, Workflow, WorkflowConfig, WorkflowMetadata, WorkflowStatus,
};
use weft_engine::ScheduleError;
use weft_storage::{CreateWorkflow, UpdateWorkflow};

use crate::auth::AuthUser;
use crate::AppState;

/// Request to create a workflow
#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateWorkflowRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub trigger: Trigger,
    pub config: WorkflowConfig,
    #[serde(default)]
    pub metadata: Option<WorkflowMetadata>,
    #[serde(default)]
    pub organization_id: Option<Uuid>,
    #[serde(default)]
    pub status: Option<WorkflowStatus>,
}

/// Request to partially update a workflow
#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateWorkflowRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub status: Option<WorkflowStatus>,
    pub trigger: Option<Trigger>,
    pub config: Option<WorkflowConfig>,
    pub metadata: Option<WorkflowMetadata>,
}

/// Query parameters for listing workflows
#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ListWorkflowsParams {
    pub organization_id: Option<Uuid>,
    #[serde(default = "default_page")]
    pub page: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_page() -> i64 {
    1
}

fn default_limit() -> i64 {
    20
}

/// Request body for a manual run
#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct RunWorkflowRequest {
    #[serde(default)]
    pub input: serde_json::Value,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/workflows", get(list_workflows).post(create_workflow))
        .route(
            "/v1/workflows/:id",
            get(get_workflow)
                .patch(update_workflow)
                .delete(delete_workflow),
        )
        .route("/v1/workflows/:id/run", post(run_workflow))
        .with_state(state)
}

/// Fetch a workflow the user may read: their own, or one in the
/// organization they are acting in
async fn load_visible(
    state: &AppState,
    user: AuthUser,
    id: Uuid,
) -> Result<Workflow, StatusCode> {
    let workflow = state
        .db
        .get_workflow(id)
        .await
        .map_err(internal)?
        .ok_or(StatusCode::NOT_FOUND)?;

    // Cross-tenant access reads as absence
    if workflow.user_id != user.0 && workflow.organization_id.is_none() {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(workflow)
}

fn require_owner(workflow: &Workflow, user: AuthUser) -> Result<(), StatusCode> {
    if workflow.user_id != user.0 {
        return Err(StatusCode::FORBIDDEN);
    }
    Ok(())
}

fn internal<E: std::fmt::Display>(e: E) -> StatusCode {
    tracing::error!("request failed: {e}");
    StatusCode::INTERNAL_SERVER_ERROR
}

/// GET /v1/workflows - List workflows, newest first
#[utoipa::path(
    get,
    path = "/v1/workflows",
    params(
        ("organizationId" = Option<Uuid>, Query, description = "Scope to an organization"),
        ("page" = Option<i64>, Query, description = "Page number (1-based)"),
        ("limit" = Option<i64>, Query, description = "Page size (default 20)")
    ),
    responses(
        (status = 200, description = "List of workflows", body = Vec<Workflow>),
        (status = 401, description = "Not authenticated")
    ),
    tag = "workflows"
)]
pub async fn list_workflows(
    State(state): State<AppState>,
    user: AuthUser,
    Query(params): Query<ListWorkflowsParams>,
) -> Result<Json<Vec<Workflow>>, StatusCode> {
    let limit = params.limit.clamp(1, 100);
    let workflows = state
        .db
        .list_workflows(user.0, params.organization_id, params.page, limit)
        .await
        .map_err(internal)?;
    Ok(Json(workflows))
}

/// POST /v1/workflows - Create a workflow
#[utoipa::path(
    post,
    path = "/v1/workflows",
    request_body = CreateWorkflowRequest,
    responses(
        (status = 201, description = "Workflow created", body = Workflow),
        (status = 401, description = "Not authenticated")
    ),
    tag = "workflows"
)]
pub async fn create_workflow(
    State(state): State<AppState>,
    user: AuthUser,
    Json(req): Json<CreateWorkflowRequest>,
) -> Result<(StatusCode, Json<Workflow>), StatusCode> {
    let workflow = state
        .db
        .create_workflow(CreateWorkflow {
            user_id: user.0,
            organization_id: req.organization_id,
            name: req.name,
            description: req.description,
            status: req.status.unwrap_or(WorkflowStatus::Draft),
            trigger: req.trigger,
            config: req.config,
            metadata: req.metadata,
        })
        .await
        .map_err(internal)?;

    state.scheduler.refresh().await.map_err(internal)?;
    Ok((StatusCode::CREATED, Json(workflow)))
}

/// GET /v1/workflows/{id}
#[utoipa::path(
    get,
    path = "/v1/workflows/{id}",
    params(("id" = Uuid, Path, description = "Workflow ID")),
    responses(
        (status = 200, description = "The workflow", body = Workflow),
        (status = 404, description = "Not found")
    ),
    tag = "workflows"
)]
pub async fn get_workflow(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<Workflow>, StatusCode> {
    let workflow = load_visible(&state, user, id).await?;
    Ok(Json(workflow))
}

/// PATCH /v1/workflows/{id} - Owner-scoped partial update
#[utoipa::path(
    patch,
    path = "/v1/workflows/{id}",
    params(("id" = Uuid, Path, description = "Workflow ID")),
    request_body = UpdateWorkflowRequest,
    responses(
        (status = 200, description = "Updated workflow", body = Workflow),
        (status = 403, description = "Not the owner"),
        (status = 404, description = "Not found")
    ),
    tag = "workflows"
)]
pub async fn update_workflow(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateWorkflowRequest>,
) -> Result<Json<Workflow>, StatusCode> {
    let workflow = load_visible(&state, user, id).await?;
    require_owner(&workflow, user)?;

    let updated = state
        .db
        .update_workflow(
            id,
            UpdateWorkflow {
                name: req.name,
                description: req.description,
                status: req.status,
                trigger: req.trigger,
                config: req.config,
                metadata: req.metadata,
            },
        )
        .await
        .map_err(internal)?
        .ok_or(StatusCode::NOT_FOUND)?;

    // Status or trigger changes take effect without a restart
    state.scheduler.refresh().await.map_err(internal)?;
    Ok(Json(updated))
}

/// DELETE /v1/workflows/{id} - Owner-scoped; cancels queued runs
#[utoipa::path(
    delete,
    path = "/v1/workflows/{id}",
    params(("id" = Uuid, Path, description = "Workflow ID")),
    responses(
        (status = 204, description = "Deleted"),
        (status = 403, description = "Not the owner"),
        (status = 404, description = "Not found")
    ),
    tag = "workflows"
)]
pub async fn delete_workflow(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, StatusCode> {
    let workflow = load_visible(&state, user, id).await?;
    require_owner(&workflow, user)?;

    // Queued runs are cancelled before the rows go away
    let dropped = state.queue.drop_ready(id).await.map_err(internal)?;
    for run_id in dropped {
        let _ = state.db.cancel_run(run_id).await;
    }

    let deleted = state.db.delete_workflow(id).await.map_err(internal)?;
    if !deleted {
        return Err(StatusCode::NOT_FOUND);
    }
    state.scheduler.refresh().await.map_err(internal)?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /v1/workflows/{id}/run - Enqueue a manual run
#[utoipa::path(
    post,
    path = "/v1/workflows/{id}/run",
    params(("id" = Uuid, Path, description = "Workflow ID")),
    request_body = RunWorkflowRequest,
    responses(
        (status = 202, description = "Run enqueued", body = Run),
        (status = 404, description = "Not found"),
        (status = 409, description = "Workflow is not runnable")
    ),
    tag = "workflows"
)]
pub async fn run_workflow(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    body: Option<Json<RunWorkflowRequest>>,
) -> Result<(StatusCode, Json<Run>), StatusCode> {
    let workflow = load_visible(&state, user, id).await?;
    let input = body.map(|Json(req)| req.input).unwrap_or_default();

    let run = state
        .scheduler
        .trigger_manual(&workflow, input)
        .await
        .map_err(|e| match e {
            ScheduleError::NotRunnable(_) => StatusCode::CONFLICT,
            other => internal(other),
        })?;

    Ok((StatusCode::ACCEPTED, Json(run)))
}
