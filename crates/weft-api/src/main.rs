// Weft API server

mod auth;
mod credentials;
mod runs;
mod webhooks;
mod workflows;

use anyhow::{Context, Result};
use axum::{routing::get, Json, Router};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;

use weft_engine::{PgWorkQueue, Scheduler, WorkQueue};
use weft_storage::{Database, SecretCipher};

/// App state shared across routes
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub queue: Arc<dyn WorkQueue>,
    pub scheduler: Scheduler,
    pub encryption: SecretCipher,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        workflows::list_workflows,
        workflows::create_workflow,
        workflows::get_workflow,
        workflows::update_workflow,
        workflows::delete_workflow,
        workflows::run_workflow,
        runs::list_runs,
        runs::get_run,
        runs::cancel_run,
        credentials::create_credential,
        credentials::list_credentials,
        credentials::delete_credential,
        webhooks::deliver,
    ),
    components(schemas(
        weft_core::model::Workflow,
        weft_core::model::WorkflowConfig,
        weft_core::model::WorkflowStatus,
        weft_core::model::Trigger,
        weft_core::model::Step,
        weft_core::model::Run,
        weft_core::model::RunStatus,
        weft_core::model::StepResult,
        weft_core::CredentialSummary,
        workflows::CreateWorkflowRequest,
        workflows::UpdateWorkflowRequest,
        workflows::RunWorkflowRequest,
        credentials::CreateCredentialRequest,
        webhooks::WebhookResponse,
    )),
    tags(
        (name = "workflows", description = "Workflow management"),
        (name = "runs", description = "Run status and cancellation"),
        (name = "credentials", description = "Credential vault"),
        (name = "webhooks", description = "External trigger ingress"),
    )
)]
struct ApiDoc;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "weft_api=debug,weft_engine=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let database_url =
        std::env::var("DATABASE_URL").context("DATABASE_URL environment variable required")?;
    let db = Database::from_url(&database_url).await?;
    db.migrate().await?;
    tracing::info!("database connection established");

    let encryption = SecretCipher::from_env()?;
    let queue: Arc<dyn WorkQueue> = Arc::new(PgWorkQueue::new(db.pool().clone()));

    // The API enqueues through the scheduler but does not run its cron
    // loop; that belongs to the worker process.
    let scheduler = Scheduler::new(db.clone(), Arc::clone(&queue));
    scheduler.refresh().await?;

    let state = AppState {
        db: Arc::new(db),
        queue,
        scheduler,
        encryption,
    };

    let app = Router::new()
        .route("/health", get(health))
        .route(
            "/openapi.json",
            get(|| async { Json(ApiDoc::openapi()) }),
        )
        .merge(workflows::routes(state.clone()))
        .merge(runs::routes(state.clone()))
        .merge(credentials::routes(state.clone()))
        .merge(webhooks::routes(state.clone()))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any));

    let port = std::env::var("PORT").unwrap_or_else(|_| "3001".into());
    let addr = format!("0.0.0.0:{port}");
    tracing::info!(%addr, "weft-api listening");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
