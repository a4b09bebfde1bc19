// Database row models (internal, may differ from public DTOs)

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

use weft_core::model::{
    Run, RunStatus, Trigger, TriggeredBy, Workflow, WorkflowConfig, WorkflowMetadata,
    WorkflowStatus,
};
use weft_core::RunError;

// ============================================
// Workflows
// ============================================

/// Workflow row from database
#[derive(Debug, Clone, FromRow)]
pub struct WorkflowRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub organization_id: Option<Uuid>,
    pub name: String,
    pub description: String,
    pub status: String,
    pub trigger: Value,
    pub config: Value,
    pub metadata: Option<Value>,
    pub run_count: i64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_run_status: Option<String>,
    pub last_run_output: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRow {
    /// Decode the JSON columns into the domain type
    pub fn into_domain(self) -> anyhow::Result<Workflow> {
        let status: WorkflowStatus = self
            .status
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))?;
        let trigger: Trigger = serde_json::from_value(self.trigger)?;
        let config: WorkflowConfig = serde_json::from_value(self.config)?;
        let metadata: Option<WorkflowMetadata> =
            self.metadata.map(serde_json::from_value).transpose()?;
        let last_run_status: Option<RunStatus> = self
            .last_run_status
            .map(|s| s.parse().map_err(|e: String| anyhow::anyhow!(e)))
            .transpose()?;

        Ok(Workflow {
            id: self.id,
            user_id: self.user_id,
            organization_id: self.organization_id,
            name: self.name,
            description: self.description,
            status,
            trigger,
            config,
            metadata,
            run_count: self.run_count,
            last_run_at: self.last_run_at,
            last_run_status,
            last_run_output: self.last_run_output,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Input for creating a workflow
#[derive(Debug, Clone)]
pub struct CreateWorkflow {
    pub user_id: Uuid,
    pub organization_id: Option<Uuid>,
    pub name: String,
    pub description: String,
    pub status: WorkflowStatus,
    pub trigger: Trigger,
    pub config: WorkflowConfig,
    pub metadata: Option<WorkflowMetadata>,
}

/// Input for a partial workflow update
#[derive(Debug, Clone, Default)]
pub struct UpdateWorkflow {
    pub name: Option<String>,
    pub description: Option<String>,
    pub status: Option<WorkflowStatus>,
    pub trigger: Option<Trigger>,
    pub config: Option<WorkflowConfig>,
    pub metadata: Option<WorkflowMetadata>,
}

// ============================================
// Runs
// ============================================

/// Run row from database
#[derive(Debug, Clone, FromRow)]
pub struct RunRow {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub user_id: Uuid,
    pub organization_id: Option<Uuid>,
    pub triggered_by: String,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub status: String,
    pub steps: Value,
    pub error: Option<Value>,
    pub output: Option<Value>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl RunRow {
    pub fn into_domain(self) -> anyhow::Result<Run> {
        let status: RunStatus = self.status.parse().map_err(|e: String| anyhow::anyhow!(e))?;
        let triggered_by: TriggeredBy = self
            .triggered_by
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))?;
        let error: Option<RunError> = self.error.map(serde_json::from_value).transpose()?;

        Ok(Run {
            id: self.id,
            workflow_id: self.workflow_id,
            user_id: self.user_id,
            organization_id: self.organization_id,
            triggered_by,
            scheduled_for: self.scheduled_for,
            status,
            steps: serde_json::from_value(self.steps)?,
            error,
            output: self.output,
            started_at: self.started_at,
            finished_at: self.finished_at,
            created_at: self.created_at,
        })
    }
}

/// Input for creating a queued run
///
/// The trigger-supplied input rides on the queue item, not the run row.
#[derive(Debug, Clone)]
pub struct CreateRun {
    pub workflow_id: Uuid,
    pub user_id: Uuid,
    pub organization_id: Option<Uuid>,
    pub triggered_by: TriggeredBy,
    pub scheduled_for: Option<DateTime<Utc>>,
}

// ============================================
// Credentials
// ============================================

/// Credential row from database; secret columns hold ciphertext envelopes
#[derive(Debug, Clone, FromRow)]
pub struct CredentialRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub organization_id: Option<Uuid>,
    pub platform: String,
    pub name: String,
    pub kind: String,
    pub encrypted_value: Option<Vec<u8>>,
    /// Multi-field credentials: map of field name to base64 ciphertext
    pub fields: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// Input for storing a credential
#[derive(Debug, Clone)]
pub struct CreateCredential {
    pub user_id: Uuid,
    pub organization_id: Option<Uuid>,
    pub platform: String,
    pub name: String,
    pub kind: weft_core::CredentialKind,
    pub encrypted_value: Option<Vec<u8>>,
    pub fields: Option<Value>,
}

// ============================================
// OAuth accounts
// ============================================

/// OAuth account row; token columns hold ciphertext envelopes
#[derive(Debug, Clone, FromRow)]
pub struct OAuthAccountRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub provider: String,
    pub access_token: Vec<u8>,
    pub refresh_token: Option<Vec<u8>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ============================================
// Workflow state store
// ============================================

/// Versioned state row; the last 10 versions per key are retained
#[derive(Debug, Clone, FromRow)]
pub struct StateRow {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub key: String,
    pub value: Value,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

// ============================================
// Sessions
// ============================================

/// API session row; the token itself is never stored, only its hash
#[derive(Debug, Clone, FromRow)]
pub struct SessionRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

