// Webhook ingress
//
// Unauthenticated by design: the caller is an external system. A workflow
// declaring a shared secret only fires when the x-webhook-secret header
// matches, checked in constant time by the scheduler.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::post,
    Json, Router,
};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::AppState;

/// Runs enqueued for a webhook delivery
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct WebhookResponse {
    pub run_ids: Vec<Uuid>,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/webhooks/:path", post(deliver))
        .with_state(state)
}

/// POST /v1/webhooks/{path} - External trigger delivery
#[utoipa::path(
    post,
    path = "/v1/webhooks/{path}",
    params(("path" = String, Path, description = "Webhook path registered on a workflow")),
    responses(
        (status = 202, description = "Runs enqueued", body = WebhookResponse),
        (status = 404, description = "No workflow listens on this path")
    ),
    tag = "webhooks"
)]
pub async fn deliver(
    State(state): State<AppState>,
    Path(path): Path<String>,
    headers: HeaderMap,
    body: Option<Json<Value>>,
) -> Result<(StatusCode, Json<WebhookResponse>), StatusCode> {
    let headers: HashMap<String, String> = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_lowercase(), v.to_string()))
        })
        .collect();
    let body = body.map(|Json(v)| v).unwrap_or(Value::Null);

    let runs = state
        .scheduler
        .deliver_webhook(&path, body, headers)
        .await
        .map_err(|e| {
            tracing::error!("webhook delivery failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    if runs.is_empty() {
        // No matching workflow, or every match rejected the secret
        return Err(StatusCode::NOT_FOUND);
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(WebhookResponse {
            run_ids: runs.into_iter().map(|r| r.id).collect(),
        }),
    ))
}
