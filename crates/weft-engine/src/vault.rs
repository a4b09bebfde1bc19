//! Credential vault service
//!
//! Materializes the per-run plaintext credential map: decrypts the rows
//! for a (user, org?) scope, folds in OAuth access tokens (refreshing
//! them when close to expiry), and expands the alias table so every
//! spelling of a platform resolves to the same secret.
//!
//! Plaintext exists only in the returned map; listing interfaces go
//! through the storage layer and surface metadata only.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::{Map, Value};
use sqlx::postgres::PgListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use weft_core::CredentialMap;
use weft_storage::{CredentialRow, Database, SecretCipher, CREDENTIALS_CHANNEL};

/// OAuth application settings for a provider whose tokens can refresh
#[derive(Debug, Clone)]
pub struct OAuthProviderConfig {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
}

struct CachedEntry {
    map: CredentialMap,
    loaded_at: Instant,
}

/// Per-process credential vault with a short-TTL cache
///
/// Cache entries are invalidated out of band through Postgres
/// LISTEN/NOTIFY when a credential row changes.
pub struct Vault {
    db: Database,
    cipher: SecretCipher,
    http: reqwest::Client,
    cache: DashMap<(Uuid, Option<Uuid>), CachedEntry>,
    cache_ttl: Duration,
    /// Coalesces concurrent refreshes per OAuth account
    refresh_locks: DashMap<Uuid, Arc<tokio::sync::Mutex<()>>>,
    providers: HashMap<String, OAuthProviderConfig>,
    /// Tokens expiring within this margin are refreshed before use
    refresh_margin: chrono::Duration,
}

impl Vault {
    pub fn new(db: Database, cipher: SecretCipher) -> Self {
        Self {
            db,
            cipher,
            http: reqwest::Client::new(),
            cache: DashMap::new(),
            cache_ttl: Duration::from_secs(60),
            refresh_locks: DashMap::new(),
            providers: HashMap::new(),
            refresh_margin: chrono::Duration::seconds(60),
        }
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn with_provider(mut self, name: impl Into<String>, config: OAuthProviderConfig) -> Self {
        self.providers.insert(name.into(), config);
        self
    }

    /// The plaintext credential map for one run
    ///
    /// Org-scoped rows take precedence over personal rows for the same
    /// platform. The returned map is a clone; the caller drops it with the
    /// run context at run completion.
    pub async fn credentials_for_run(
        &self,
        user_id: Uuid,
        organization_id: Option<Uuid>,
    ) -> Result<CredentialMap> {
        let key = (user_id, organization_id);
        if let Some(entry) = self.cache.get(&key) {
            if entry.loaded_at.elapsed() < self.cache_ttl {
                return Ok(entry.map.clone());
            }
        }

        let mut map = CredentialMap::new();

        // Rows arrive personal-first; later inserts win, so org rows take
        // precedence on platform collision.
        let rows = self
            .db
            .credential_rows_for_scope(user_id, organization_id)
            .await?;
        for row in rows {
            match self.decrypt_row(&row) {
                Ok(value) => {
                    map.insert(row.platform.clone(), value);
                }
                Err(e) => {
                    warn!(credential_id = %row.id, platform = %row.platform, "failed to decrypt credential: {e:#}");
                }
            }
        }

        // OAuth access tokens appear under their provider name
        for account in self.db.list_oauth_accounts(user_id).await? {
            match self.access_token_for(&account).await {
                Ok(token) => {
                    map.insert(account.provider.clone(), Value::String(token));
                }
                Err(e) => {
                    warn!(provider = %account.provider, "failed to materialize OAuth token: {e:#}");
                }
            }
        }

        expand_aliases(&mut map);

        self.cache.insert(
            key,
            CachedEntry {
                map: map.clone(),
                loaded_at: Instant::now(),
            },
        );
        Ok(map)
    }

    /// Pre-populate the cache for recently-active users at worker start
    pub async fn warm_cache(&self, user_ids: &[Uuid]) {
        for &user_id in user_ids {
            if let Err(e) = self.credentials_for_run(user_id, None).await {
                debug!(%user_id, "cache warm-up skipped user: {e:#}");
            }
        }
        info!(users = user_ids.len(), "credential cache warmed");
    }

    /// Drop every cache entry for a user
    pub fn invalidate_user(&self, user_id: Uuid) {
        self.cache.retain(|(cached_user, _), _| *cached_user != user_id);
    }

    /// Subscribe to credential-change notifications and invalidate
    ///
    /// Runs until the connection drops; the worker restarts it via its
    /// supervision of background tasks.
    pub fn spawn_invalidation_listener(self: Arc<Self>) -> JoinHandle<()> {
        let vault = self;
        tokio::spawn(async move {
            let mut listener = match PgListener::connect_with(vault.db.pool()).await {
                Ok(l) => l,
                Err(e) => {
                    warn!("credential invalidation listener failed to connect: {e}");
                    return;
                }
            };
            if let Err(e) = listener.listen(CREDENTIALS_CHANNEL).await {
                warn!("credential invalidation listener failed to subscribe: {e}");
                return;
            }
            info!(channel = CREDENTIALS_CHANNEL, "credential invalidation listener started");

            loop {
                match listener.recv().await {
                    Ok(notification) => {
                        if let Ok(user_id) = notification.payload().parse::<Uuid>() {
                            debug!(%user_id, "invalidating cached credentials");
                            vault.invalidate_user(user_id);
                        }
                    }
                    Err(e) => {
                        warn!("credential invalidation listener stopped: {e}");
                        return;
                    }
                }
            }
        })
    }

    fn decrypt_row(&self, row: &CredentialRow) -> Result<Value> {
        if let Some(ciphertext) = &row.encrypted_value {
            let plaintext = self.cipher.open(ciphertext)?;
            return Ok(Value::String(plaintext));
        }

        // Multi-field: each field independently encrypted, base64 in JSON
        if let Some(Value::Object(fields)) = &row.fields {
            use base64::Engine as _;
            let mut out = Map::new();
            for (name, encoded) in fields {
                let encoded = encoded
                    .as_str()
                    .context("multi-field ciphertext is not a string")?;
                let ciphertext = base64::engine::general_purpose::STANDARD
                    .decode(encoded)
                    .context("multi-field ciphertext is not base64")?;
                let plaintext = self.cipher.open(&ciphertext)?;
                out.insert(name.clone(), Value::String(plaintext));
            }
            return Ok(Value::Object(out));
        }

        anyhow::bail!("credential row has neither a value nor fields")
    }

    /// Current access token for an account, refreshing when near expiry
    ///
    /// Concurrent refreshes for one account coalesce behind a process-local
    /// mutex; across processes the compare-and-set on `expires_at` makes
    /// the losing exchange a no-op.
    async fn access_token_for(&self, account: &weft_storage::OAuthAccountRow) -> Result<String> {
        if !needs_refresh(account.expires_at, self.refresh_margin) {
            return self.cipher.open(&account.access_token);
        }

        let Some(provider) = self.providers.get(&account.provider) else {
            // Non-refreshable: hand back the stored token and let the module
            // surface the expiry.
            return self.cipher.open(&account.access_token);
        };
        if account.refresh_token.is_none() {
            return self.cipher.open(&account.access_token);
        }

        let lock = self
            .refresh_locks
            .entry(account.id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // Another task may have refreshed while this one waited
        let current = self
            .db
            .get_oauth_account(account.user_id, &account.provider)
            .await?
            .context("oauth account disappeared during refresh")?;
        if !needs_refresh(current.expires_at, self.refresh_margin) {
            return self.cipher.open(&current.access_token);
        }

        let refresh_ciphertext = current
            .refresh_token
            .as_ref()
            .context("refresh token disappeared during refresh")?;
        let refresh_token = self.cipher.open(refresh_ciphertext)?;
        let response = self
            .http
            .post(&provider.token_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.as_str()),
                ("client_id", provider.client_id.as_str()),
                ("client_secret", provider.client_secret.as_str()),
            ])
            .send()
            .await
            .context("token refresh request failed")?;

        if !response.status().is_success() {
            anyhow::bail!(
                "token refresh for '{}' returned HTTP {}",
                account.provider,
                response.status()
            );
        }
        let token: TokenResponse = response
            .json()
            .await
            .context("token refresh response was not valid JSON")?;

        let new_access = self.cipher.seal(&token.access_token)?;
        let new_refresh = token
            .refresh_token
            .as_deref()
            .map(|t| self.cipher.seal(t))
            .transpose()?;
        let new_expiry = token
            .expires_in
            .map(|secs| Utc::now() + chrono::Duration::seconds(secs));

        let rotated = self
            .db
            .rotate_oauth_tokens(
                current.id,
                current.expires_at,
                &new_access,
                new_refresh.as_deref(),
                new_expiry,
            )
            .await?;

        if rotated {
            debug!(provider = %account.provider, "oauth tokens rotated");
            Ok(token.access_token)
        } else {
            // Lost the cross-process race; use whatever won
            let winner = self
                .db
                .get_oauth_account(account.user_id, &account.provider)
                .await?
                .context("oauth account disappeared after refresh race")?;
            self.cipher.open(&winner.access_token)
        }
    }
}

/// Whether a token expiring at `expires_at` is due for refresh
pub fn needs_refresh(
    expires_at: Option<chrono::DateTime<Utc>>,
    margin: chrono::Duration,
) -> bool {
    match expires_at {
        Some(at) => at - Utc::now() <= margin,
        None => false,
    }
}

/// Explicit alias spellings: variant -> canonical
const ALIAS_TABLE: &[(&str, &str)] = &[
    ("youtube_apikey", "youtube"),
    ("youtube_api_key", "youtube"),
    ("twitter_oauth2", "twitter"),
    ("twitter_oauth", "twitter"),
    ("rapidapi_api_key", "rapidapi"),
    ("openai_api_key", "openai"),
    ("anthropic_api_key", "anthropic"),
    ("github_token", "github"),
    ("slack_bot_token", "slack"),
    ("telegram_bot_token", "telegram"),
    ("discord_bot_token", "discord"),
];

/// Suffixes stripped to derive a canonical platform name
const ALIAS_SUFFIXES: &[&str] = &["_api_key", "_apikey", "_oauth2", "_oauth"];

/// Insert canonical aliases for every variant spelling in the map
///
/// Aliases never overwrite existing explicit entries.
pub fn expand_aliases(map: &mut CredentialMap) {
    let mut additions: Vec<(String, Value)> = Vec::new();

    for (key, value) in map.iter() {
        let canonical = ALIAS_TABLE
            .iter()
            .find(|(variant, _)| variant == key)
            .map(|(_, canonical)| canonical.to_string())
            .or_else(|| {
                ALIAS_SUFFIXES
                    .iter()
                    .find_map(|suffix| key.strip_suffix(suffix))
                    .map(str::to_string)
            });

        if let Some(canonical) = canonical {
            if !canonical.is_empty() && !map.contains_key(&canonical) {
                additions.push((canonical, value.clone()));
            }
        }
    }

    for (key, value) in additions {
        // Two variants of the same platform: first one wins
        map.entry(key).or_insert(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_alias_expansion_spellings() {
        let mut map = CredentialMap::new();
        map.insert("youtube_api_key".into(), json!("yt-key"));
        map.insert("twitter_oauth2".into(), json!("tw-token"));
        map.insert("rapidapi_api_key".into(), json!("ra-key"));
        map.insert("openai_api_key".into(), json!("oa-key"));
        expand_aliases(&mut map);

        assert_eq!(map.get("youtube"), Some(&json!("yt-key")));
        assert_eq!(map.get("twitter"), Some(&json!("tw-token")));
        assert_eq!(map.get("rapidapi"), Some(&json!("ra-key")));
        assert_eq!(map.get("openai"), Some(&json!("oa-key")));
        // Originals stay
        assert_eq!(map.get("openai_api_key"), Some(&json!("oa-key")));
    }

    #[test]
    fn test_alias_never_overwrites_explicit_entry() {
        let mut map = CredentialMap::new();
        map.insert("openai".into(), json!("explicit"));
        map.insert("openai_api_key".into(), json!("variant"));
        expand_aliases(&mut map);

        assert_eq!(map.get("openai"), Some(&json!("explicit")));
    }

    #[test]
    fn test_suffix_rule_covers_unlisted_platforms() {
        let mut map = CredentialMap::new();
        map.insert("weatherstack_api_key".into(), json!("ws"));
        expand_aliases(&mut map);
        assert_eq!(map.get("weatherstack"), Some(&json!("ws")));
    }

    #[test]
    fn test_needs_refresh_margin() {
        let margin = chrono::Duration::seconds(60);
        assert!(!needs_refresh(None, margin));
        assert!(!needs_refresh(
            Some(Utc::now() + chrono::Duration::hours(1)),
            margin
        ));
        assert!(needs_refresh(
            Some(Utc::now() + chrono::Duration::seconds(30)),
            margin
        ));
        assert!(needs_refresh(
            Some(Utc::now() - chrono::Duration::hours(1)),
            margin
        ));
    }
}
