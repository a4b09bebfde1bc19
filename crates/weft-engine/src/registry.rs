//! Module registry: dotted name to function lookup
//!
//! Modules are the plugin surface of the platform. Each one is an async
//! function `(inputs, context) -> Result<Value, ModuleError>` registered
//! under a dotted path like `utilities.string.upper`. The registry is
//! populated once at worker startup and read-only afterwards; a module that
//! fails to load is replaced by an error stub so the rest of the catalog
//! stays usable.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use weft_core::{CredentialMap, ModuleError};

/// Result of one module invocation
pub type ModuleResult = Result<Value, ModuleError>;

/// Boxed module future
pub type ModuleFuture = Pin<Box<dyn Future<Output = ModuleResult> + Send>>;

/// A registered module function
pub type ModuleFn = Arc<dyn Fn(Value, ModuleContext) -> ModuleFuture + Send + Sync>;

/// Durable key/value backend exposed to `data.state.*` modules
///
/// Backed by the versioned `workflow_state` table in production and by a
/// map in tests. Dynamic per-workflow tables are deliberately not offered.
#[async_trait]
pub trait StateBackend: Send + Sync + 'static {
    async fn load(&self, workflow_id: Uuid, key: &str) -> Result<Option<Value>, ModuleError>;
    async fn save(&self, workflow_id: Uuid, key: &str, value: &Value) -> Result<(), ModuleError>;
}

/// No-op state backend for contexts without storage wired in
pub struct NullStateBackend;

#[async_trait]
impl StateBackend for NullStateBackend {
    async fn load(&self, _workflow_id: Uuid, _key: &str) -> Result<Option<Value>, ModuleError> {
        Ok(None)
    }

    async fn save(&self, _workflow_id: Uuid, _key: &str, _value: &Value) -> Result<(), ModuleError> {
        Err(ModuleError::internal("state backend not available"))
    }
}

/// Per-invocation context handed to modules
///
/// Exposes credential lookup, the owning run/workflow ids, the shared HTTP
/// client, and the state backend. Modules log through `tracing` with the
/// run id attached by the engine's span.
#[derive(Clone)]
pub struct ModuleContext {
    pub run_id: Uuid,
    pub workflow_id: Uuid,
    pub user_id: Uuid,
    credentials: Arc<CredentialMap>,
    http: reqwest::Client,
    state: Arc<dyn StateBackend>,
}

impl ModuleContext {
    pub fn new(
        run_id: Uuid,
        workflow_id: Uuid,
        user_id: Uuid,
        credentials: Arc<CredentialMap>,
        http: reqwest::Client,
        state: Arc<dyn StateBackend>,
    ) -> Self {
        Self {
            run_id,
            workflow_id,
            user_id,
            credentials,
            http,
            state,
        }
    }

    /// Context with no credentials or storage, for tests
    pub fn bare(run_id: Uuid, workflow_id: Uuid) -> Self {
        Self::new(
            run_id,
            workflow_id,
            Uuid::nil(),
            Arc::new(CredentialMap::new()),
            reqwest::Client::new(),
            Arc::new(NullStateBackend),
        )
    }

    /// Look up a credential by platform name (aliases already expanded)
    pub fn credential(&self, platform: &str) -> Option<&Value> {
        self.credentials.get(platform)
    }

    /// Credential required by the module; missing is a permanent error
    pub fn require_credential(&self, platform: &str) -> Result<&Value, ModuleError> {
        self.credential(platform)
            .ok_or_else(|| ModuleError::credential_missing(platform))
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn state(&self) -> &Arc<dyn StateBackend> {
        &self.state
    }
}

/// Outcome of a registry preload
#[derive(Debug, Clone)]
pub struct PreloadReport {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub duration: Duration,
}

/// Name to function lookup, read-only after preload
pub struct ModuleRegistry {
    modules: HashMap<String, ModuleFn>,
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self {
            modules: HashMap::new(),
        }
    }

    /// Register a module under its dotted name
    pub fn register<F, Fut>(&mut self, name: &str, handler: F)
    where
        F: Fn(Value, ModuleContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ModuleResult> + Send + 'static,
    {
        let handler: ModuleFn = Arc::new(move |inputs, ctx| Box::pin(handler(inputs, ctx)));
        self.modules.insert(name.to_string(), handler);
    }

    /// Register a stub that fails every invocation with a permanent error
    ///
    /// Used when a module fails to load at preload time: the failure is
    /// deferred to run time instead of poisoning the whole catalog.
    pub fn register_error_stub(&mut self, name: &str, reason: &str) {
        let name_owned = name.to_string();
        let reason = reason.to_string();
        let handler: ModuleFn = Arc::new(move |_inputs, _ctx| {
            let msg = format!("module '{name_owned}' failed to load: {reason}");
            Box::pin(async move { Err(ModuleError::validation(msg)) })
        });
        self.modules.insert(name.to_string(), handler);
    }

    pub fn get(&self, name: &str) -> Option<ModuleFn> {
        self.modules.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.modules.keys().map(|s| s.as_str())
    }

    /// Load the built-in catalog
    ///
    /// Walks every category and registers its functions. Per-module failures
    /// are tolerated: the module is installed as an error stub and counted
    /// in the report.
    pub fn preload(&mut self) -> PreloadReport {
        let started = Instant::now();
        let mut succeeded = 0;
        let mut failed = 0;

        for (name, result) in crate::modules::catalog() {
            match result {
                Ok(handler) => {
                    self.modules.insert(name.clone(), handler);
                    succeeded += 1;
                }
                Err(reason) => {
                    warn!(module = %name, %reason, "module failed to load, installing error stub");
                    self.register_error_stub(&name, &reason);
                    failed += 1;
                }
            }
        }

        let report = PreloadReport {
            total: succeeded + failed,
            succeeded,
            failed,
            duration: started.elapsed(),
        };
        info!(
            total = report.total,
            succeeded = report.succeeded,
            failed = report.failed,
            duration_ms = report.duration.as_millis() as u64,
            "module registry preloaded"
        );
        report
    }
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("modules", &self.modules.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_register_and_invoke() {
        let mut registry = ModuleRegistry::new();
        registry.register("test.echo", |inputs, _ctx| async move { Ok(inputs) });

        let handler = registry.get("test.echo").expect("registered");
        let ctx = ModuleContext::bare(Uuid::nil(), Uuid::nil());
        let out = handler(json!({"x": 1}), ctx).await.unwrap();
        assert_eq!(out, json!({"x": 1}));
    }

    #[tokio::test]
    async fn test_error_stub_fails_permanently() {
        let mut registry = ModuleRegistry::new();
        registry.register_error_stub("social.broken.post", "missing native dependency");

        let handler = registry.get("social.broken.post").unwrap();
        let ctx = ModuleContext::bare(Uuid::nil(), Uuid::nil());
        let err = handler(json!({}), ctx).await.unwrap_err();
        assert_eq!(err.kind, weft_core::ErrorKind::Validation);
        assert!(!err.retryable());
        assert!(err.message.contains("social.broken.post"));
    }

    #[test]
    fn test_preload_reports_builtins() {
        let mut registry = ModuleRegistry::new();
        let report = registry.preload();
        assert!(report.total > 0);
        assert_eq!(report.failed, 0);
        assert_eq!(report.total, report.succeeded);
        assert!(registry.contains("utilities.string.upper"));
        assert!(registry.contains("http.request"));
    }

    #[test]
    fn test_unknown_module_absent() {
        let registry = ModuleRegistry::new();
        assert!(registry.get("social.twitter.reply").is_none());
    }

    #[tokio::test]
    async fn test_require_credential() {
        let mut creds = CredentialMap::new();
        creds.insert("openai".into(), json!("sk-1"));
        let ctx = ModuleContext::new(
            Uuid::nil(),
            Uuid::nil(),
            Uuid::nil(),
            Arc::new(creds),
            reqwest::Client::new(),
            Arc::new(NullStateBackend),
        );
        assert_eq!(ctx.require_credential("openai").unwrap(), &json!("sk-1"));
        let err = ctx.require_credential("stripe").unwrap_err();
        assert_eq!(err.kind, weft_core::ErrorKind::CredentialMissing);
    }
}
