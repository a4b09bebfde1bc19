//! Postgres implementation of the work queue
//!
//! Claiming uses `FOR UPDATE SKIP LOCKED` over the oldest ready item per
//! idle workflow. A partial unique index on `(workflow_id) WHERE status =
//! 'claimed'` makes the one-in-flight-per-workflow invariant a database
//! guarantee; a conflicting concurrent claim aborts and the poller simply
//! retries.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use super::{QueueDepth, QueueError, WorkItem, WorkQueue};

/// Durable queue over the `queue_items` table
#[derive(Clone)]
pub struct PgWorkQueue {
    pool: PgPool,
}

impl PgWorkQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn store_err(e: sqlx::Error) -> QueueError {
    QueueError::Store(e.to_string())
}

/// Unique-violation from the one-in-flight index means another worker won
/// the claim race this round
fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(
        e,
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505")
    )
}

#[async_trait]
impl WorkQueue for PgWorkQueue {
    async fn enqueue(
        &self,
        workflow_id: Uuid,
        run_id: Uuid,
        input: Value,
    ) -> Result<Uuid, QueueError> {
        let id = Uuid::now_v7();
        sqlx::query(
            r#"
            INSERT INTO queue_items (id, workflow_id, run_id, input)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(id)
        .bind(workflow_id)
        .bind(run_id)
        .bind(&input)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(id)
    }

    async fn claim(&self, worker_id: &str, max_items: usize) -> Result<Vec<WorkItem>, QueueError> {
        let result = sqlx::query_as::<_, (Uuid, Uuid, Uuid, Value)>(
            r#"
            WITH candidate AS (
                SELECT q.id
                FROM queue_items q
                WHERE q.status = 'ready'
                  AND NOT EXISTS (
                      SELECT 1 FROM queue_items c
                      WHERE c.workflow_id = q.workflow_id AND c.status = 'claimed'
                  )
                  AND q.sequence = (
                      SELECT MIN(q2.sequence) FROM queue_items q2
                      WHERE q2.workflow_id = q.workflow_id AND q2.status = 'ready'
                  )
                ORDER BY q.sequence
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE queue_items
            SET status = 'claimed', claimed_by = $1, claimed_at = NOW(), heartbeat_at = NOW()
            WHERE id IN (SELECT id FROM candidate)
            RETURNING id, workflow_id, run_id, input
            "#,
        )
        .bind(worker_id)
        .bind(max_items as i64)
        .fetch_all(&self.pool)
        .await;

        let rows = match result {
            Ok(rows) => rows,
            Err(e) if is_unique_violation(&e) => return Ok(vec![]),
            Err(e) => return Err(store_err(e)),
        };

        Ok(rows
            .into_iter()
            .map(|(id, workflow_id, run_id, input)| WorkItem {
                id,
                workflow_id,
                run_id,
                input,
            })
            .collect())
    }

    async fn heartbeat(&self, item_id: Uuid, worker_id: &str) -> Result<bool, QueueError> {
        // Refresh liveness and report whether the run was cancelled out of band
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            UPDATE queue_items q
            SET heartbeat_at = NOW()
            FROM workflow_runs r
            WHERE q.id = $1 AND q.claimed_by = $2 AND q.status = 'claimed'
              AND r.id = q.run_id
            RETURNING r.status
            "#,
        )
        .bind(item_id)
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;

        match row {
            Some((status,)) => Ok(status != "cancelled"),
            None => Err(QueueError::ItemNotFound(item_id)),
        }
    }

    async fn ack(&self, item_id: Uuid) -> Result<(), QueueError> {
        let result = sqlx::query("DELETE FROM queue_items WHERE id = $1")
            .bind(item_id)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        if result.rows_affected() == 0 {
            return Err(QueueError::ItemNotFound(item_id));
        }
        Ok(())
    }

    async fn release(&self, item_id: Uuid) -> Result<(), QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE queue_items
            SET status = 'ready', claimed_by = NULL, claimed_at = NULL, heartbeat_at = NULL
            WHERE id = $1 AND status = 'claimed'
            "#,
        )
        .bind(item_id)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        if result.rows_affected() == 0 {
            return Err(QueueError::ItemNotFound(item_id));
        }
        Ok(())
    }

    async fn requeue_abandoned(
        &self,
        visibility_timeout: Duration,
    ) -> Result<Vec<Uuid>, QueueError> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE queue_items
            SET status = 'ready', claimed_by = NULL, claimed_at = NULL, heartbeat_at = NULL
            WHERE status = 'claimed'
              AND heartbeat_at < NOW() - make_interval(secs => $1)
            RETURNING id
            "#,
        )
        .bind(visibility_timeout.as_secs_f64())
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn drop_ready(&self, workflow_id: Uuid) -> Result<Vec<Uuid>, QueueError> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            "DELETE FROM queue_items WHERE workflow_id = $1 AND status = 'ready' RETURNING run_id",
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn depth(&self) -> Result<QueueDepth, QueueError> {
        let row: (i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'ready'),
                COUNT(*) FILTER (WHERE status = 'claimed')
            FROM queue_items
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(QueueDepth {
            ready: row.0 as u64,
            in_flight: row.1 as u64,
        })
    }
}
