//! Production run processor: storage-backed execution of one queue item
//!
//! Loads the workflow and credentials, drives the engine, and persists the
//! terminal run plus the workflow's run counters.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use weft_core::model::RunStatus;
use weft_core::{ErrorKind, ModuleError, RunError};
use weft_storage::Database;

use crate::engine::Engine;
use crate::queue::WorkItem;
use crate::registry::StateBackend;
use crate::vault::Vault;
use crate::worker::RunProcessor;

/// `data.state.*` backend over the versioned workflow_state table
pub struct DbStateBackend {
    db: Database,
}

impl DbStateBackend {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl StateBackend for DbStateBackend {
    async fn load(&self, workflow_id: Uuid, key: &str) -> Result<Option<Value>, ModuleError> {
        self.db
            .load_state(workflow_id, key)
            .await
            .map_err(|e| ModuleError::internal(format!("state load failed: {e}")))
    }

    async fn save(&self, workflow_id: Uuid, key: &str, value: &Value) -> Result<(), ModuleError> {
        self.db
            .save_state(workflow_id, key, value, None, false)
            .await
            .map(|_| ())
            .map_err(|e| ModuleError::internal(format!("state save failed: {e}")))
    }
}

/// Wires storage, vault and engine into one [`RunProcessor`]
pub struct RunPipeline {
    db: Database,
    vault: Arc<Vault>,
    engine: Arc<Engine>,
}

impl RunPipeline {
    pub fn new(db: Database, vault: Arc<Vault>, engine: Arc<Engine>) -> Self {
        Self { db, vault, engine }
    }
}

#[async_trait]
impl RunProcessor for RunPipeline {
    async fn process(
        &self,
        item: WorkItem,
        cancel: CancellationToken,
    ) -> anyhow::Result<RunStatus> {
        let Some(run) = self.db.get_run(item.run_id).await? else {
            warn!(run_id = %item.run_id, "queue item references a missing run");
            return Ok(RunStatus::Cancelled);
        };
        if run.status.is_terminal() {
            // Cancelled (or otherwise finished) while still queued
            return Ok(run.status);
        }

        let Some(workflow) = self.db.get_workflow(item.workflow_id).await? else {
            // Workflow deleted with the run still queued
            self.db.cancel_run(run.id).await?;
            return Ok(RunStatus::Cancelled);
        };

        if !self.db.mark_run_running(run.id).await? {
            // Someone else transitioned it; nothing to do
            let current = self.db.get_run(run.id).await?.map(|r| r.status);
            return Ok(current.unwrap_or(RunStatus::Cancelled));
        }

        let credentials = match self
            .vault
            .credentials_for_run(run.user_id, run.organization_id)
            .await
        {
            Ok(map) => map,
            Err(e) => {
                // The vault being unreachable fails the run with an
                // actionable, sanitized message.
                let error = RunError::new(
                    ErrorKind::CredentialMissing,
                    "credentials could not be loaded for this run",
                );
                warn!(run_id = %run.id, "credential load failed: {e:#}");
                let now = chrono::Utc::now();
                self.db
                    .finish_run(run.id, RunStatus::Error, &[], Some(&error), None, now, now)
                    .await?;
                self.db
                    .record_run_outcome(workflow.id, RunStatus::Error, None)
                    .await?;
                return Ok(RunStatus::Error);
            }
        };

        let platforms: Vec<String> = credentials.keys().cloned().collect();
        if !platforms.is_empty() {
            let _ = self.db.touch_credentials_used(run.user_id, &platforms).await;
        }

        let done = self
            .engine
            .execute(&workflow, &run, item.input, credentials, cancel)
            .await;

        let persisted = self
            .db
            .finish_run(
                done.id,
                done.status,
                &done.steps,
                done.error.as_ref(),
                done.output.as_ref(),
                done.started_at.unwrap_or(done.created_at),
                done.finished_at.unwrap_or_else(chrono::Utc::now),
            )
            .await?;
        if persisted {
            self.db
                .record_run_outcome(workflow.id, done.status, done.output.as_ref())
                .await?;
        } else {
            // The run reached a terminal state through another path
            // (API cancellation); terminal states are immutable.
            info!(run_id = %done.id, "run already terminal, result discarded");
        }

        Ok(done.status)
    }
}
