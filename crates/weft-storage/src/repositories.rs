// Repository layer for database operations

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use weft_core::model::{Run, RunStatus, StepResult, Workflow, WorkflowStatus};
use weft_core::{CredentialSummary, RunError};

use crate::models::*;

/// Pub/sub channel notified on credential mutation so worker-side caches
/// can invalidate without polling
pub const CREDENTIALS_CHANNEL: &str = "weft_credentials";

const WORKFLOW_COLUMNS: &str = "id, user_id, organization_id, name, description, status, trigger, config, metadata, run_count, last_run_at, last_run_status, last_run_output, created_at, updated_at";
const RUN_COLUMNS: &str = "id, workflow_id, user_id, organization_id, triggered_by, scheduled_for, status, steps, error, output, started_at, finished_at, created_at";
const CREDENTIAL_COLUMNS: &str = "id, user_id, organization_id, platform, name, kind, encrypted_value, fields, created_at, last_used_at";

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create database connection from URL
    pub async fn from_url(database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply pending migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Close the pool; part of the ordered shutdown sequence
    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ============================================
    // Workflows
    // ============================================

    pub async fn create_workflow(&self, input: CreateWorkflow) -> Result<Workflow> {
        let row = sqlx::query_as::<_, WorkflowRow>(&format!(
            r#"
            INSERT INTO workflows (id, user_id, organization_id, name, description, status, trigger, config, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING {WORKFLOW_COLUMNS}
            "#,
        ))
        .bind(Uuid::now_v7())
        .bind(input.user_id)
        .bind(input.organization_id)
        .bind(&input.name)
        .bind(&input.description)
        .bind(input.status.to_string())
        .bind(serde_json::to_value(&input.trigger)?)
        .bind(serde_json::to_value(&input.config)?)
        .bind(input.metadata.map(|m| serde_json::to_value(&m)).transpose()?)
        .fetch_one(&self.pool)
        .await?;

        row.into_domain()
    }

    pub async fn get_workflow(&self, id: Uuid) -> Result<Option<Workflow>> {
        let row = sqlx::query_as::<_, WorkflowRow>(&format!(
            "SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(WorkflowRow::into_domain).transpose()
    }

    /// List workflows visible to a user, newest first
    ///
    /// With an organization id the listing is org-scoped; otherwise it is the
    /// user's personal workflows.
    pub async fn list_workflows(
        &self,
        user_id: Uuid,
        organization_id: Option<Uuid>,
        page: i64,
        limit: i64,
    ) -> Result<Vec<Workflow>> {
        let offset = (page.max(1) - 1) * limit;
        let rows = match organization_id {
            Some(org) => {
                sqlx::query_as::<_, WorkflowRow>(&format!(
                    r#"
                    SELECT {WORKFLOW_COLUMNS} FROM workflows
                    WHERE organization_id = $1
                    ORDER BY created_at DESC
                    LIMIT $2 OFFSET $3
                    "#
                ))
                .bind(org)
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, WorkflowRow>(&format!(
                    r#"
                    SELECT {WORKFLOW_COLUMNS} FROM workflows
                    WHERE user_id = $1 AND organization_id IS NULL
                    ORDER BY created_at DESC
                    LIMIT $2 OFFSET $3
                    "#
                ))
                .bind(user_id)
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter().map(WorkflowRow::into_domain).collect()
    }

    pub async fn update_workflow(
        &self,
        id: Uuid,
        input: UpdateWorkflow,
    ) -> Result<Option<Workflow>> {
        let trigger = input.trigger.map(|t| serde_json::to_value(&t)).transpose()?;
        let config = input.config.map(|c| serde_json::to_value(&c)).transpose()?;
        let metadata = input
            .metadata
            .map(|m| serde_json::to_value(&m))
            .transpose()?;

        let row = sqlx::query_as::<_, WorkflowRow>(&format!(
            r#"
            UPDATE workflows
            SET
                name = COALESCE($2, name),
                description = COALESCE($3, description),
                status = COALESCE($4, status),
                trigger = COALESCE($5, trigger),
                config = COALESCE($6, config),
                metadata = COALESCE($7, metadata),
                updated_at = NOW()
            WHERE id = $1
            RETURNING {WORKFLOW_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(input.name)
        .bind(input.description)
        .bind(input.status.map(|s| s.to_string()))
        .bind(trigger)
        .bind(config)
        .bind(metadata)
        .fetch_optional(&self.pool)
        .await?;

        row.map(WorkflowRow::into_domain).transpose()
    }

    pub async fn delete_workflow(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM workflows WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_workflow_status(&self, id: Uuid, status: WorkflowStatus) -> Result<()> {
        sqlx::query("UPDATE workflows SET status = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(status.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Bump run counters after a run reaches a terminal state
    pub async fn record_run_outcome(
        &self,
        workflow_id: Uuid,
        status: RunStatus,
        output: Option<&Value>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE workflows
            SET run_count = run_count + 1,
                last_run_at = NOW(),
                last_run_status = $2,
                last_run_output = $3,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(workflow_id)
        .bind(status.to_string())
        .bind(output)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// All active workflows with a cron trigger, for the scheduler
    pub async fn list_active_cron_workflows(&self) -> Result<Vec<Workflow>> {
        let rows = sqlx::query_as::<_, WorkflowRow>(&format!(
            r#"
            SELECT {WORKFLOW_COLUMNS} FROM workflows
            WHERE status = 'active' AND trigger->>'type' = 'cron'
            "#
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(WorkflowRow::into_domain).collect()
    }

    /// Active workflows whose webhook trigger matches a path
    pub async fn find_webhook_workflows(&self, path: &str) -> Result<Vec<Workflow>> {
        let rows = sqlx::query_as::<_, WorkflowRow>(&format!(
            r#"
            SELECT {WORKFLOW_COLUMNS} FROM workflows
            WHERE status = 'active'
              AND trigger->>'type' = 'webhook'
              AND trigger->'config'->>'path' = $1
            "#
        ))
        .bind(path)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(WorkflowRow::into_domain).collect()
    }

    // ============================================
    // Runs
    // ============================================

    /// Create a queued run; its input is carried on the queue item
    pub async fn create_run(&self, input: CreateRun) -> Result<Run> {
        let row = sqlx::query_as::<_, RunRow>(&format!(
            r#"
            INSERT INTO workflow_runs (id, workflow_id, user_id, organization_id, triggered_by, scheduled_for, status, steps)
            VALUES ($1, $2, $3, $4, $5, $6, 'queued', '[]'::jsonb)
            RETURNING {RUN_COLUMNS}
            "#
        ))
        .bind(Uuid::now_v7())
        .bind(input.workflow_id)
        .bind(input.user_id)
        .bind(input.organization_id)
        .bind(input.triggered_by.to_string())
        .bind(input.scheduled_for)
        .fetch_one(&self.pool)
        .await?;

        row.into_domain()
    }

    pub async fn get_run(&self, id: Uuid) -> Result<Option<Run>> {
        let row = sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {RUN_COLUMNS} FROM workflow_runs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(RunRow::into_domain).transpose()
    }

    pub async fn list_runs(&self, workflow_id: Uuid, limit: i64) -> Result<Vec<Run>> {
        let rows = sqlx::query_as::<_, RunRow>(&format!(
            r#"
            SELECT {RUN_COLUMNS} FROM workflow_runs
            WHERE workflow_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#
        ))
        .bind(workflow_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(RunRow::into_domain).collect()
    }

    /// Transition a queued run to running
    ///
    /// Returns false when the run is no longer queued (already claimed
    /// elsewhere, or cancelled).
    pub async fn mark_run_running(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE workflow_runs SET status = 'running', started_at = NOW() WHERE id = $1 AND status = 'queued'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Persist a run's terminal state
    ///
    /// The guard on the current status makes terminal states immutable: a
    /// finished run is never transitioned again.
    pub async fn finish_run(
        &self,
        id: Uuid,
        status: RunStatus,
        steps: &[StepResult],
        error: Option<&RunError>,
        output: Option<&Value>,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> Result<bool> {
        debug_assert!(status.is_terminal());
        let result = sqlx::query(
            r#"
            UPDATE workflow_runs
            SET status = $2, steps = $3, error = $4, output = $5, started_at = $6, finished_at = $7
            WHERE id = $1 AND status IN ('queued', 'running')
            "#,
        )
        .bind(id)
        .bind(status.to_string())
        .bind(serde_json::to_value(steps)?)
        .bind(error.map(serde_json::to_value).transpose()?)
        .bind(output)
        .bind(started_at)
        .bind(finished_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Cancel a run that has not finished
    pub async fn cancel_run(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_runs
            SET status = 'cancelled', finished_at = NOW()
            WHERE id = $1 AND status IN ('queued', 'running')
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Cron tick dedupe: whether any run exists for this scheduled timestamp
    pub async fn run_exists_for_tick(
        &self,
        workflow_id: Uuid,
        scheduled_for: DateTime<Utc>,
    ) -> Result<bool> {
        let row: (bool,) = sqlx::query_as(
            "SELECT EXISTS(SELECT 1 FROM workflow_runs WHERE workflow_id = $1 AND scheduled_for = $2)",
        )
        .bind(workflow_id)
        .bind(scheduled_for)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    /// Users with the most recent runs, for credential cache warm-up
    pub async fn list_recently_active_users(&self, limit: i64) -> Result<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT user_id FROM workflow_runs
            GROUP BY user_id
            ORDER BY MAX(created_at) DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    // ============================================
    // Credentials
    // ============================================

    pub async fn create_credential(&self, input: CreateCredential) -> Result<CredentialSummary> {
        let row = sqlx::query_as::<_, CredentialRow>(&format!(
            r#"
            INSERT INTO user_credentials (id, user_id, organization_id, platform, name, kind, encrypted_value, fields)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {CREDENTIAL_COLUMNS}
            "#
        ))
        .bind(Uuid::now_v7())
        .bind(input.user_id)
        .bind(input.organization_id)
        .bind(&input.platform)
        .bind(&input.name)
        .bind(input.kind.to_string())
        .bind(&input.encrypted_value)
        .bind(&input.fields)
        .fetch_one(&self.pool)
        .await?;

        self.notify_credentials_changed(input.user_id).await?;
        credential_summary(row)
    }

    /// Listing surfaces metadata only; ciphertext never leaves this module
    pub async fn list_credentials(
        &self,
        user_id: Uuid,
        organization_id: Option<Uuid>,
    ) -> Result<Vec<CredentialSummary>> {
        let rows = self.credential_rows_for_scope(user_id, organization_id).await?;
        rows.into_iter().map(credential_summary).collect()
    }

    /// Encrypted rows for a (user, org?) scope, for the vault to decrypt
    ///
    /// Org-scoped rows sort after personal rows so callers applying them in
    /// order end with org rows taking precedence.
    pub async fn credential_rows_for_scope(
        &self,
        user_id: Uuid,
        organization_id: Option<Uuid>,
    ) -> Result<Vec<CredentialRow>> {
        let rows = match organization_id {
            Some(org) => {
                sqlx::query_as::<_, CredentialRow>(&format!(
                    r#"
                    SELECT {CREDENTIAL_COLUMNS} FROM user_credentials
                    WHERE user_id = $1 AND (organization_id IS NULL OR organization_id = $2)
                    ORDER BY organization_id NULLS FIRST, created_at
                    "#
                ))
                .bind(user_id)
                .bind(org)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, CredentialRow>(&format!(
                    r#"
                    SELECT {CREDENTIAL_COLUMNS} FROM user_credentials
                    WHERE user_id = $1 AND organization_id IS NULL
                    ORDER BY created_at
                    "#
                ))
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(rows)
    }

    pub async fn delete_credential(&self, id: Uuid, user_id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM user_credentials WHERE id = $1 AND user_id = $2")
            .bind(id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() > 0 {
            self.notify_credentials_changed(user_id).await?;
            return Ok(true);
        }
        Ok(false)
    }

    pub async fn touch_credentials_used(&self, user_id: Uuid, platforms: &[String]) -> Result<()> {
        sqlx::query(
            "UPDATE user_credentials SET last_used_at = NOW() WHERE user_id = $1 AND platform = ANY($2)",
        )
        .bind(user_id)
        .bind(platforms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn notify_credentials_changed(&self, user_id: Uuid) -> Result<()> {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(CREDENTIALS_CHANNEL)
            .bind(user_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ============================================
    // OAuth accounts
    // ============================================

    pub async fn list_oauth_accounts(&self, user_id: Uuid) -> Result<Vec<OAuthAccountRow>> {
        let rows = sqlx::query_as::<_, OAuthAccountRow>(
            r#"
            SELECT id, user_id, provider, access_token, refresh_token, expires_at, created_at, updated_at
            FROM accounts
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn get_oauth_account(
        &self,
        user_id: Uuid,
        provider: &str,
    ) -> Result<Option<OAuthAccountRow>> {
        let row = sqlx::query_as::<_, OAuthAccountRow>(
            r#"
            SELECT id, user_id, provider, access_token, refresh_token, expires_at, created_at, updated_at
            FROM accounts
            WHERE user_id = $1 AND provider = $2
            "#,
        )
        .bind(user_id)
        .bind(provider)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Persist rotated tokens with compare-and-set on `expires_at`
    ///
    /// Returns false when another process already rotated (the stored
    /// expiry no longer matches); callers then re-read instead of clobbering
    /// the newer tokens.
    pub async fn rotate_oauth_tokens(
        &self,
        id: Uuid,
        expected_expires_at: Option<DateTime<Utc>>,
        access_token: &[u8],
        refresh_token: Option<&[u8]>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE accounts
            SET access_token = $3,
                refresh_token = COALESCE($4, refresh_token),
                expires_at = $5,
                updated_at = NOW()
            WHERE id = $1 AND expires_at IS NOT DISTINCT FROM $2
            "#,
        )
        .bind(id)
        .bind(expected_expires_at)
        .bind(access_token)
        .bind(refresh_token)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    // ============================================
    // Workflow state store
    // ============================================

    /// Save a state value, bumping the version
    ///
    /// Writing a value identical to the latest version is a no-op unless
    /// `force` is set. The last 10 versions per key are retained.
    pub async fn save_state(
        &self,
        workflow_id: Uuid,
        key: &str,
        value: &Value,
        expires_at: Option<DateTime<Utc>>,
        force: bool,
    ) -> Result<i32> {
        let mut tx = self.pool.begin().await?;

        let latest: Option<(i32, Value)> = sqlx::query_as(
            r#"
            SELECT version, value FROM workflow_state
            WHERE workflow_id = $1 AND key = $2
            ORDER BY version DESC
            LIMIT 1
            FOR UPDATE
            "#,
        )
        .bind(workflow_id)
        .bind(key)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some((version, existing)) = &latest {
            if !force && existing == value {
                tx.commit().await?;
                return Ok(*version);
            }
        }

        let next_version = latest.map(|(v, _)| v + 1).unwrap_or(1);

        sqlx::query(
            r#"
            INSERT INTO workflow_state (id, workflow_id, key, value, version, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(workflow_id)
        .bind(key)
        .bind(value)
        .bind(next_version)
        .bind(expires_at)
        .execute(&mut *tx)
        .await?;

        // Retain the last 10 versions
        sqlx::query(
            r#"
            DELETE FROM workflow_state
            WHERE workflow_id = $1 AND key = $2 AND version <= $3 - 10
            "#,
        )
        .bind(workflow_id)
        .bind(key)
        .bind(next_version)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(next_version)
    }

    /// Latest non-expired state value for a key
    pub async fn load_state(&self, workflow_id: Uuid, key: &str) -> Result<Option<Value>> {
        let row: Option<(Value,)> = sqlx::query_as(
            r#"
            SELECT value FROM workflow_state
            WHERE workflow_id = $1 AND key = $2
              AND (expires_at IS NULL OR expires_at > NOW())
            ORDER BY version DESC
            LIMIT 1
            "#,
        )
        .bind(workflow_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(v,)| v))
    }

    /// Drop expired state rows; returns the number removed
    pub async fn sweep_expired_state(&self) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM workflow_state WHERE expires_at IS NOT NULL AND expires_at <= NOW()")
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    // ============================================
    // Sessions
    // ============================================

    /// Resolve a session token hash to its user, ignoring expired sessions
    pub async fn find_user_by_session(&self, token_hash: &str) -> Result<Option<Uuid>> {
        let row: Option<(Uuid,)> = sqlx::query_as(
            "SELECT user_id FROM sessions WHERE token_hash = $1 AND expires_at > NOW()",
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(id,)| id))
    }

    pub async fn create_session(
        &self,
        user_id: Uuid,
        token_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<SessionRow> {
        let row = sqlx::query_as::<_, SessionRow>(
            r#"
            INSERT INTO sessions (id, user_id, token_hash, expires_at)
            VALUES ($1, $2, $3, $4)
            RETURNING id, user_id, token_hash, expires_at, created_at
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(user_id)
        .bind(token_hash)
        .bind(expires_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }
}

fn credential_summary(row: CredentialRow) -> Result<CredentialSummary> {
    Ok(CredentialSummary {
        id: row.id,
        platform: row.platform,
        name: row.name,
        kind: row.kind.parse().map_err(|e: String| anyhow::anyhow!(e))?,
        created_at: row.created_at,
        last_used_at: row.last_used_at,
    })
}
