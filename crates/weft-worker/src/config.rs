//! Worker configuration from the environment

use std::collections::HashMap;

use anyhow::{Context, Result};

/// Settings read once at startup
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub database_url: String,

    /// Identity in logs, metrics and queue claims (`WORKER_NAME`)
    pub worker_name: String,

    /// Concurrent runs per worker (`WORKFLOW_CONCURRENCY`, default 50)
    pub concurrency: usize,

    /// Skip the registry preload walk (`SKIP_MODULE_PRELOAD`, dev only)
    pub skip_module_preload: bool,

    /// Environment variables exposed to expressions as `env.*`
    /// (`WEFT_ENV_WHITELIST`, comma-separated names)
    pub env_whitelist: HashMap<String, String>,

    /// Users whose credentials are pre-warmed at startup
    pub credential_warm_count: i64,
}

impl WorkerSettings {
    pub fn from_env() -> Result<Self> {
        let database_url =
            std::env::var("DATABASE_URL").context("DATABASE_URL environment variable required")?;

        let worker_name = std::env::var("WORKER_NAME").unwrap_or_else(|_| {
            let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "local".into());
            format!("weft-{host}-{}", std::process::id())
        });

        let concurrency = std::env::var("WORKFLOW_CONCURRENCY")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(weft_engine::worker::DEFAULT_CONCURRENCY)
            .max(1);

        let skip_module_preload = std::env::var("SKIP_MODULE_PRELOAD")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        // Only explicitly enumerated variables reach the expression scope
        let env_whitelist = std::env::var("WEFT_ENV_WHITELIST")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .filter_map(|name| std::env::var(name).ok().map(|v| (name.to_string(), v)))
            .collect();

        let credential_warm_count = std::env::var("CREDENTIAL_WARM_COUNT")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(20);

        Ok(Self {
            database_url,
            worker_name,
            concurrency,
            skip_module_preload,
            env_whitelist,
            credential_warm_count,
        })
    }
}
