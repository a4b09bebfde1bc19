// Vault HTTP routes
//
// Plaintext crosses this surface exactly once, on create, and is encrypted
// before it reaches storage. Listing returns metadata only.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use base64::Engine as _;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use utoipa::ToSchema;
use uuid::Uuid;

use weft_core::{CredentialKind, CredentialSummary};
use weft_storage::CreateCredential;

use crate::auth::AuthUser;
use crate::AppState;

/// Request to store a credential
#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateCredentialRequest {
    pub platform: String,
    pub name: String,
    pub kind: CredentialKind,
    /// Single-value credentials
    #[serde(default)]
    pub value: Option<String>,
    /// Multi-field credentials: field name to plaintext
    #[serde(default)]
    pub fields: Option<HashMap<String, String>>,
    #[serde(default)]
    pub organization_id: Option<Uuid>,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/credentials", get(list_credentials).post(create_credential))
        .route("/v1/credentials/:id", axum::routing::delete(delete_credential))
        .with_state(state)
}

fn internal<E: std::fmt::Display>(e: E) -> StatusCode {
    tracing::error!("request failed: {e}");
    StatusCode::INTERNAL_SERVER_ERROR
}

/// POST /v1/credentials - Store an encrypted credential
#[utoipa::path(
    post,
    path = "/v1/credentials",
    request_body = CreateCredentialRequest,
    responses(
        (status = 201, description = "Credential stored", body = CredentialSummary),
        (status = 400, description = "Neither value nor fields provided")
    ),
    tag = "credentials"
)]
pub async fn create_credential(
    State(state): State<AppState>,
    user: AuthUser,
    Json(req): Json<CreateCredentialRequest>,
) -> Result<(StatusCode, Json<CredentialSummary>), StatusCode> {
    let encrypted_value = match &req.value {
        Some(plaintext) => Some(
            state
                .encryption
                .seal(plaintext)
                .map_err(internal)?,
        ),
        None => None,
    };

    let fields = match &req.fields {
        Some(fields) if !fields.is_empty() => {
            let mut encrypted = Map::new();
            for (name, plaintext) in fields {
                let ciphertext = state
                    .encryption
                    .seal(plaintext)
                    .map_err(internal)?;
                encrypted.insert(
                    name.clone(),
                    Value::String(base64::engine::general_purpose::STANDARD.encode(ciphertext)),
                );
            }
            Some(Value::Object(encrypted))
        }
        _ => None,
    };

    if encrypted_value.is_none() && fields.is_none() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let summary = state
        .db
        .create_credential(CreateCredential {
            user_id: user.0,
            organization_id: req.organization_id,
            platform: req.platform,
            name: req.name,
            kind: req.kind,
            encrypted_value,
            fields,
        })
        .await
        .map_err(internal)?;

    Ok((StatusCode::CREATED, Json(summary)))
}

/// GET /v1/credentials - Metadata only, never plaintext
#[utoipa::path(
    get,
    path = "/v1/credentials",
    responses(
        (status = 200, description = "Credential metadata", body = Vec<CredentialSummary>)
    ),
    tag = "credentials"
)]
pub async fn list_credentials(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<Vec<CredentialSummary>>, StatusCode> {
    let summaries = state
        .db
        .list_credentials(user.0, None)
        .await
        .map_err(internal)?;
    Ok(Json(summaries))
}

/// DELETE /v1/credentials/{id}
#[utoipa::path(
    delete,
    path = "/v1/credentials/{id}",
    params(("id" = Uuid, Path, description = "Credential ID")),
    responses(
        (status = 204, description = "Deleted"),
        (status = 404, description = "Not found")
    ),
    tag = "credentials"
)]
pub async fn delete_credential(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, StatusCode> {
    let deleted = state
        .db
        .delete_credential(id, user.0)
        .await
        .map_err(internal)?;
    if deleted {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}
