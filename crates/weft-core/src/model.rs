//! Workflow and run documents
//!
//! A workflow is an immutable-per-version JSON document: a trigger plus an
//! ordered list of steps invoking registered modules. A run is one execution
//! of a workflow; its terminal state never transitions again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::RunError;

/// Default whole-run timeout in milliseconds
pub const DEFAULT_RUN_TIMEOUT_MS: u64 = 300_000;

/// Lifecycle status of a workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Draft,
    Active,
    Paused,
    Error,
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Draft => write!(f, "draft"),
            Self::Active => write!(f, "active"),
            Self::Paused => write!(f, "paused"),
            Self::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for WorkflowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown workflow status: {other}")),
        }
    }
}

/// What starts a run
///
/// Wire shape is `{ "type": ..., "config": { ... } }`. Only manual, cron and
/// webhook triggers are materialized by the scheduler; the chat family is
/// delivered through an external adapter that enqueues the same run shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", content = "config", rename_all = "snake_case")]
pub enum Trigger {
    Manual,
    Cron {
        expression: String,
        #[serde(default)]
        timezone: Option<String>,
    },
    Webhook {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        secret: Option<String>,
    },
    Chat,
    #[serde(rename = "chat-input")]
    ChatInput,
    Telegram,
    Discord,
}

impl Trigger {
    /// Webhook path, when this is a webhook trigger
    pub fn webhook_path(&self) -> Option<&str> {
        match self {
            Self::Webhook { path, .. } => Some(path),
            _ => None,
        }
    }

    /// Cron expression, when this is a cron trigger
    pub fn cron_expression(&self) -> Option<&str> {
        match self {
            Self::Cron { expression, .. } => Some(expression),
            _ => None,
        }
    }
}

/// Loop declaration on a step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoopSpec {
    /// Expression producing the sequence to iterate
    pub over: String,

    /// Variable name bound to the current item
    #[serde(rename = "as")]
    pub as_name: String,

    /// Run iterations concurrently
    #[serde(default)]
    pub parallel: bool,

    /// Concurrency limit; required when `parallel` is set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
}

/// One entry in a workflow's step list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    /// Unique within the workflow
    pub id: String,

    /// Dotted module path resolved through the registry, e.g. `utilities.string.upper`
    pub module: String,

    /// Module inputs; scalar string leaves may contain `{{ ... }}` templates
    #[serde(default)]
    pub inputs: Value,

    /// Variable name the step's output is bound to, in addition to `steps.<id>`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_as: Option<String>,

    /// Expression gating execution; falsy skips the step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,

    /// Iterate the step body over a sequence
    #[serde(default, rename = "loop", skip_serializing_if = "Option::is_none")]
    pub loop_spec: Option<LoopSpec>,

    /// Step-level retry count; falls back to the workflow default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,

    /// Keep executing later steps after this one fails
    #[serde(default)]
    pub continue_on_error: bool,
}

/// Display hint for a run's output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OutputDisplay {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<String>>,
}

/// Execution configuration of a workflow document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowConfig {
    /// Whole-run timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout: u64,

    /// Default retry count for steps that do not declare their own
    #[serde(default)]
    pub retries: u32,

    pub steps: Vec<Step>,

    /// Expression evaluated after the last step to produce the run output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_value: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_display: Option<OutputDisplay>,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_RUN_TIMEOUT_MS
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_RUN_TIMEOUT_MS,
            retries: 0,
            steps: vec![],
            return_value: None,
            output_display: None,
        }
    }
}

/// Free-form workflow metadata
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct WorkflowMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

/// A user-authored workflow
///
/// Belongs to exactly one user; organization scope is optional. Mutated only
/// by the owner or an organization admin.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub id: Uuid,
    pub user_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<Uuid>,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub status: WorkflowStatus,
    pub trigger: Trigger,
    pub config: WorkflowConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<WorkflowMetadata>,
    pub run_count: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_status: Option<RunStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_output: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Originator of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TriggeredBy {
    Manual,
    Cron,
    Webhook,
    Chat,
}

impl std::fmt::Display for TriggeredBy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Manual => write!(f, "manual"),
            Self::Cron => write!(f, "cron"),
            Self::Webhook => write!(f, "webhook"),
            Self::Chat => write!(f, "chat"),
        }
    }
}

impl std::str::FromStr for TriggeredBy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Self::Manual),
            "cron" => Ok(Self::Cron),
            "webhook" => Ok(Self::Webhook),
            "chat" => Ok(Self::Chat),
            other => Err(format!("unknown trigger source: {other}")),
        }
    }
}

/// Lifecycle status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Success,
    Error,
    Cancelled,
}

impl RunStatus {
    /// Terminal statuses are immutable
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Error | Self::Cancelled)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Running => write!(f, "running"),
            Self::Success => write!(f, "success"),
            Self::Error => write!(f, "error"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "error" => Ok(Self::Error),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// Outcome of one step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    Error,
    Skipped,
    Cancelled,
}

/// Result of executing one step within a run
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub step_id: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<crate::error::ModuleError>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub attempts: u32,
}

impl StepResult {
    /// A skipped step (condition evaluated falsy)
    pub fn skipped(step_id: &str, at: DateTime<Utc>) -> Self {
        Self {
            step_id: step_id.to_string(),
            status: StepStatus::Skipped,
            output: None,
            error: None,
            started_at: at,
            finished_at: at,
            duration_ms: 0,
            attempts: 0,
        }
    }
}

/// One execution of a workflow
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub user_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<Uuid>,
    pub triggered_by: TriggeredBy,

    /// Cron tick this run was enqueued for; used for tick dedupe
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_for: Option<DateTime<Utc>>,

    pub status: RunStatus,
    #[serde(default)]
    pub steps: Vec<StepResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Kind of secret held by a credential
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    ApiKey,
    Token,
    Secret,
    ConnectionString,
    MultiField,
}

impl std::fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ApiKey => write!(f, "api_key"),
            Self::Token => write!(f, "token"),
            Self::Secret => write!(f, "secret"),
            Self::ConnectionString => write!(f, "connection_string"),
            Self::MultiField => write!(f, "multi_field"),
        }
    }
}

impl std::str::FromStr for CredentialKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "api_key" => Ok(Self::ApiKey),
            "token" => Ok(Self::Token),
            "secret" => Ok(Self::Secret),
            "connection_string" => Ok(Self::ConnectionString),
            "multi_field" => Ok(Self::MultiField),
            other => Err(format!("unknown credential kind: {other}")),
        }
    }
}

/// Credential metadata surfaced by listing interfaces
///
/// Plaintext never appears on this type; it exists only inside a run's
/// execution context.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CredentialSummary {
    pub id: Uuid,
    pub platform: String,
    pub name: String,
    pub kind: CredentialKind,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_trigger_wire_shape() {
        let t: Trigger = serde_json::from_value(json!({
            "type": "cron",
            "config": { "expression": "0 0 9 * * *", "timezone": "Europe/Amsterdam" }
        }))
        .unwrap();
        assert_eq!(t.cron_expression(), Some("0 0 9 * * *"));

        let t: Trigger = serde_json::from_value(json!({ "type": "manual" })).unwrap();
        assert_eq!(t, Trigger::Manual);

        let t: Trigger = serde_json::from_value(json!({ "type": "chat-input" })).unwrap();
        assert_eq!(t, Trigger::ChatInput);
    }

    #[test]
    fn test_step_document_round_trip() {
        let doc = json!({
            "id": "reply",
            "module": "social.twitter.reply",
            "inputs": { "text": "{{ steps.draft.output }}" },
            "outputAs": "posted",
            "condition": "{{ input.enabled }}",
            "loop": { "over": "input.mentions", "as": "mention" }
        });
        let step: Step = serde_json::from_value(doc.clone()).unwrap();
        assert_eq!(step.output_as.as_deref(), Some("posted"));
        assert_eq!(step.loop_spec.as_ref().unwrap().as_name, "mention");
        assert!(!step.loop_spec.as_ref().unwrap().parallel);

        let back = serde_json::to_value(&step).unwrap();
        assert_eq!(back["outputAs"], doc["outputAs"]);
        assert_eq!(back["loop"]["as"], doc["loop"]["as"]);
    }

    #[test]
    fn test_config_defaults() {
        let cfg: WorkflowConfig = serde_json::from_value(json!({ "steps": [] })).unwrap();
        assert_eq!(cfg.timeout, DEFAULT_RUN_TIMEOUT_MS);
        assert_eq!(cfg.retries, 0);
        assert!(cfg.return_value.is_none());
    }

    #[test]
    fn test_run_status_terminality() {
        assert!(!RunStatus::Queued.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Success.is_terminal());
        assert!(RunStatus::Error.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_status_parse_round_trip() {
        for s in ["queued", "running", "success", "error", "cancelled"] {
            let parsed: RunStatus = s.parse().unwrap();
            assert_eq!(parsed.to_string(), s);
        }
        assert!("finished".parse::<RunStatus>().is_err());
    }
}
