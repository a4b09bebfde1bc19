// Session-token authentication
//
// Opaque bearer tokens; only the SHA-256 hash is stored, so a database
// leak does not leak sessions.

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::AppState;

/// The authenticated user for a request
#[derive(Debug, Clone, Copy)]
pub struct AuthUser(pub Uuid);

/// Hash a bearer token the way sessions are stored
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

#[axum::async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = StatusCode;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or(StatusCode::UNAUTHORIZED)?;

        let user_id = state
            .db
            .find_user_by_session(&hash_token(token))
            .await
            .map_err(|e| {
                tracing::error!("session lookup failed: {e}");
                StatusCode::INTERNAL_SERVER_ERROR
            })?
            .ok_or(StatusCode::UNAUTHORIZED)?;

        Ok(AuthUser(user_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_token_is_stable_and_hex() {
        let h1 = hash_token("tok-abc");
        let h2 = hash_token("tok-abc");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
        assert!(h1.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(hash_token("tok-abc"), hash_token("tok-abd"));
    }
}
