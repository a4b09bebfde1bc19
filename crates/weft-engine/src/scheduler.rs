//! Trigger materialization: cron table, webhook delivery, manual runs
//!
//! The scheduler turns trigger events into queue entries. Cron state is a
//! per-workflow iterator rebuilt by `refresh()` whenever a workflow's
//! status or trigger changes, so changes take effect without a restart.
//! Ticks are deduplicated on `(workflow, scheduled timestamp)` and downtime
//! produces at most one catch-up run per workflow.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Utc};
use cron::Schedule;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use weft_core::model::{Run, Trigger, TriggeredBy, Workflow, WorkflowStatus};
use weft_storage::{CreateRun, Database};

use crate::queue::WorkQueue;

/// Scheduling failures surfaced to the HTTP layer
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("workflow is {0}, not runnable")]
    NotRunnable(WorkflowStatus),

    #[error("webhook secret mismatch")]
    SecretMismatch,

    #[error("a run for this tick is already queued or running")]
    DuplicateTick,

    #[error("invalid cron expression: {0}")]
    InvalidCron(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

struct CronEntry {
    workflow: Workflow,
    schedule: Schedule,
    timezone: Option<FixedOffset>,
    next_due: DateTime<Utc>,
}

/// Materializes trigger events into queue entries
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    db: Database,
    queue: Arc<dyn WorkQueue>,
    entries: Mutex<HashMap<Uuid, CronEntry>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    tick_interval: Duration,
    refresh_interval: Duration,
}

impl Scheduler {
    pub fn new(db: Database, queue: Arc<dyn WorkQueue>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            inner: Arc::new(SchedulerInner {
                db,
                queue,
                entries: Mutex::new(HashMap::new()),
                shutdown_tx,
                shutdown_rx,
                tick_interval: Duration::from_secs(1),
                refresh_interval: Duration::from_secs(30),
            }),
        }
    }

    /// Rebuild the cron table from the active workflows
    ///
    /// Called at startup and whenever a workflow's status or trigger
    /// changes.
    pub async fn refresh(&self) -> anyhow::Result<()> {
        let workflows = self.inner.db.list_active_cron_workflows().await?;
        let now = Utc::now();

        let mut entries = HashMap::new();
        for workflow in workflows {
            let Trigger::Cron {
                expression,
                timezone,
            } = &workflow.trigger
            else {
                continue;
            };

            let schedule = match parse_cron(expression) {
                Ok(s) => s,
                Err(e) => {
                    warn!(workflow_id = %workflow.id, %expression, "skipping workflow with invalid cron: {e}");
                    continue;
                }
            };
            let tz = timezone.as_deref().and_then(parse_timezone);
            let Some(next_due) = next_occurrence(&schedule, tz, now) else {
                debug!(workflow_id = %workflow.id, "cron schedule has no future occurrences");
                continue;
            };

            entries.insert(
                workflow.id,
                CronEntry {
                    workflow,
                    schedule,
                    timezone: tz,
                    next_due,
                },
            );
        }

        let count = entries.len();
        *self.inner.entries.lock() = entries;
        info!(workflows = count, "cron table refreshed");
        Ok(())
    }

    /// Start the tick loop
    ///
    /// The cron table also re-reads itself periodically, picking up
    /// workflow changes made by other processes between explicit
    /// `refresh()` calls.
    pub fn start(&self) -> JoinHandle<()> {
        let scheduler = self.clone();
        let mut shutdown_rx = self.inner.shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scheduler.inner.tick_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut refresh_ticker = tokio::time::interval(scheduler.inner.refresh_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        scheduler.fire_due_ticks().await;
                    }
                    _ = refresh_ticker.tick() => {
                        if let Err(e) = scheduler.refresh().await {
                            warn!("periodic cron refresh failed: {e:#}");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("scheduler loop: shutdown requested");
                        return;
                    }
                }
            }
        })
    }

    /// Stop enqueueing; first stage of the ordered shutdown
    pub fn shutdown(&self) {
        let _ = self.inner.shutdown_tx.send(true);
    }

    async fn fire_due_ticks(&self) {
        let now = Utc::now();

        // Collect due work under the lock, enqueue outside it
        let due: Vec<(Workflow, DateTime<Utc>)> = {
            let mut entries = self.inner.entries.lock();
            let mut due = Vec::new();
            for entry in entries.values_mut() {
                if entry.next_due > now {
                    continue;
                }
                let (fire_at, next_due) =
                    catch_up(&entry.schedule, entry.timezone, entry.next_due, now);
                entry.next_due = next_due;
                if let Some(fire_at) = fire_at {
                    due.push((entry.workflow.clone(), fire_at));
                }
            }
            due
        };

        for (workflow, fire_at) in due {
            match self.enqueue_cron_run(&workflow, fire_at).await {
                Ok(run) => {
                    debug!(workflow_id = %workflow.id, run_id = %run.id, scheduled_for = %fire_at, "cron run enqueued");
                }
                Err(ScheduleError::DuplicateTick) => {
                    debug!(workflow_id = %workflow.id, scheduled_for = %fire_at, "cron tick deduplicated");
                }
                Err(e) => {
                    warn!(workflow_id = %workflow.id, "failed to enqueue cron run: {e}");
                }
            }
        }
    }

    async fn enqueue_cron_run(
        &self,
        workflow: &Workflow,
        scheduled_for: DateTime<Utc>,
    ) -> Result<Run, ScheduleError> {
        if self
            .inner
            .db
            .run_exists_for_tick(workflow.id, scheduled_for)
            .await
            .map_err(ScheduleError::Other)?
        {
            return Err(ScheduleError::DuplicateTick);
        }

        self.enqueue(workflow, TriggeredBy::Cron, Some(scheduled_for), json!({}))
            .await
            .map_err(|e| {
                // The unique (workflow, scheduled_for) index backstops the
                // existence check against a concurrent scheduler.
                if e.to_string().contains("duplicate key") {
                    ScheduleError::DuplicateTick
                } else {
                    ScheduleError::Other(e)
                }
            })
    }

    /// Enqueue a manual run; ownership is checked by the API layer
    pub async fn trigger_manual(
        &self,
        workflow: &Workflow,
        input: Value,
    ) -> Result<Run, ScheduleError> {
        match workflow.status {
            WorkflowStatus::Active | WorkflowStatus::Draft => {}
            other => return Err(ScheduleError::NotRunnable(other)),
        }
        self.enqueue(workflow, TriggeredBy::Manual, None, input)
            .await
            .map_err(ScheduleError::Other)
    }

    /// Deliver an external webhook call to every matching workflow
    ///
    /// A workflow declaring a shared secret only fires when the
    /// `x-webhook-secret` header matches it.
    pub async fn deliver_webhook(
        &self,
        path: &str,
        body: Value,
        headers: HashMap<String, String>,
    ) -> Result<Vec<Run>, ScheduleError> {
        let workflows = self
            .inner
            .db
            .find_webhook_workflows(path)
            .await
            .map_err(ScheduleError::Other)?;

        let provided_secret = headers.get("x-webhook-secret").map(String::as_str);
        let input = json!({ "body": body, "headers": headers });

        let mut runs = Vec::new();
        for workflow in workflows {
            if let Trigger::Webhook {
                secret: Some(expected),
                ..
            } = &workflow.trigger
            {
                let ok = provided_secret
                    .map(|p| constant_time_eq(p.as_bytes(), expected.as_bytes()))
                    .unwrap_or(false);
                if !ok {
                    warn!(workflow_id = %workflow.id, %path, "webhook secret mismatch");
                    continue;
                }
            }
            let run = self
                .enqueue(&workflow, TriggeredBy::Webhook, None, input.clone())
                .await
                .map_err(ScheduleError::Other)?;
            runs.push(run);
        }
        Ok(runs)
    }

    async fn enqueue(
        &self,
        workflow: &Workflow,
        triggered_by: TriggeredBy,
        scheduled_for: Option<DateTime<Utc>>,
        input: Value,
    ) -> anyhow::Result<Run> {
        let run = self
            .inner
            .db
            .create_run(CreateRun {
                workflow_id: workflow.id,
                user_id: workflow.user_id,
                organization_id: workflow.organization_id,
                triggered_by,
                scheduled_for,
            })
            .await?;

        self.inner
            .queue
            .enqueue(workflow.id, run.id, input)
            .await
            .map_err(|e| anyhow::anyhow!("failed to enqueue run: {e}"))?;

        Ok(run)
    }
}

/// Parse a cron expression, accepting the 5-field form without seconds
pub fn parse_cron(expression: &str) -> Result<Schedule, ScheduleError> {
    let normalized = normalize_cron(expression);
    Schedule::from_str(&normalized).map_err(|e| ScheduleError::InvalidCron(e.to_string()))
}

/// The `cron` crate wants a seconds field; prepend one for 5-field input
fn normalize_cron(expression: &str) -> String {
    let fields = expression.split_whitespace().count();
    if fields == 5 {
        format!("0 {expression}")
    } else {
        expression.to_string()
    }
}

/// Timezones are fixed offsets ("+02:00", "-05:30") or "UTC"
fn parse_timezone(tz: &str) -> Option<FixedOffset> {
    if tz.eq_ignore_ascii_case("utc") {
        return FixedOffset::east_opt(0);
    }
    let dt = format!("1970-01-01T00:00:00{tz}");
    DateTime::parse_from_rfc3339(&dt).ok().map(|d| *d.offset())
}

fn next_occurrence(
    schedule: &Schedule,
    tz: Option<FixedOffset>,
    after: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    match tz {
        Some(tz) => schedule
            .after(&after.with_timezone(&tz))
            .next()
            .map(|d| d.to_utc()),
        None => schedule.after(&after).next(),
    }
}

/// Advance past every tick due by `now`, firing at most once
///
/// Returns `(tick to fire, next future due time)`. After downtime the most
/// recent missed tick is the one fired; the backlog is dropped.
fn catch_up(
    schedule: &Schedule,
    tz: Option<FixedOffset>,
    mut next_due: DateTime<Utc>,
    now: DateTime<Utc>,
) -> (Option<DateTime<Utc>>, DateTime<Utc>) {
    let mut fire: Option<DateTime<Utc>> = None;
    // Bounded walk: a pathological schedule cannot stall the tick loop
    for _ in 0..10_000 {
        if next_due > now {
            return (fire, next_due);
        }
        fire = Some(next_due);
        match next_occurrence(schedule, tz, next_due) {
            Some(next) => next_due = next,
            None => return (fire, DateTime::<Utc>::MAX_UTC),
        }
    }
    (fire, next_due)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_normalize_cron_accepts_five_fields() {
        assert!(parse_cron("*/5 * * * *").is_ok());
        assert!(parse_cron("0 9 * * MON").is_ok());
        assert!(parse_cron("0 0 9 * * *").is_ok());
        assert!(parse_cron("not a cron").is_err());
    }

    #[test]
    fn test_parse_timezone() {
        assert_eq!(parse_timezone("UTC"), FixedOffset::east_opt(0));
        assert_eq!(parse_timezone("+02:00"), FixedOffset::east_opt(2 * 3600));
        assert_eq!(parse_timezone("-05:30"), FixedOffset::west_opt(5 * 3600 + 1800));
        assert_eq!(parse_timezone("Mars/Olympus"), None);
    }

    #[test]
    fn test_catch_up_no_tick_due() {
        let schedule = parse_cron("0 * * * * *").unwrap(); // every minute
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 30).unwrap();
        let next_due = Utc.with_ymd_and_hms(2026, 3, 1, 10, 1, 0).unwrap();

        let (fire, new_due) = catch_up(&schedule, None, next_due, now);
        assert_eq!(fire, None);
        assert_eq!(new_due, next_due);
    }

    #[test]
    fn test_catch_up_single_tick() {
        let schedule = parse_cron("0 * * * * *").unwrap();
        let next_due = Utc.with_ymd_and_hms(2026, 3, 1, 10, 1, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 10, 1, 0).unwrap();

        let (fire, new_due) = catch_up(&schedule, None, next_due, now);
        assert_eq!(fire, Some(next_due));
        assert_eq!(new_due, Utc.with_ymd_and_hms(2026, 3, 1, 10, 2, 0).unwrap());
    }

    #[test]
    fn test_catch_up_after_downtime_fires_once() {
        let schedule = parse_cron("0 * * * * *").unwrap();
        // Scheduler was down for an hour: sixty missed ticks
        let next_due = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 10).unwrap();

        let (fire, new_due) = catch_up(&schedule, None, next_due, now);
        // Only the most recent missed tick fires
        assert_eq!(fire, Some(Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap()));
        assert_eq!(new_due, Utc.with_ymd_and_hms(2026, 3, 1, 10, 1, 0).unwrap());
    }

    #[test]
    fn test_timezone_shifts_occurrence() {
        let schedule = parse_cron("0 0 9 * * *").unwrap(); // 09:00 daily
        let tz = parse_timezone("+02:00");
        let after = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();

        let next = next_occurrence(&schedule, tz, after).unwrap();
        // 09:00 at +02:00 is 07:00 UTC
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 1, 7, 0, 0).unwrap());
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secreT"));
        assert!(!constant_time_eq(b"secret", b"secrets"));
        assert!(!constant_time_eq(b"", b"x"));
        assert!(constant_time_eq(b"", b""));
    }
}
