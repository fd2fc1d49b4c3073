use crate::backoff::{ExponentialPolicy, RetryPolicy};
use crate::clock::{Clock, SystemClock};
use crate::errors::{QueueError, Result};
use crate::history::{JobEvent, JobFilter};
use crate::status::JobStatus;
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_rusqlite::Connection;
use tracing::{debug, info, warn};

/// Capacity of the job event channel. Slow subscribers lose the oldest events.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

const SETTINGS_KEY_RETRY: &str = "retry";

const DEFAULT_FAILURE_MESSAGE: &str = "printer reported failure";

pub const CLAIM_EXPIRED_MESSAGE: &str = "claim expired: printer never reported an outcome";

const JOB_COLUMNS: &str = "id, device_id, payload, status, created_at, updated_at, claimed_at, \
                           printed_at, error_message, retry_count, max_retries, next_retry_at";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PrintJob {
    pub id: String,
    pub device_id: String,
    /// Rendering-ready print data, stored and returned unmodified.
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub printed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl PrintJob {
    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }
}

/// Runtime retry settings. Persisted alongside the jobs and read fresh by
/// every reconciler run, so toggling them needs no restart.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetrySettings {
    pub enabled: bool,
    /// Ceiling stamped on jobs submitted without their own `max_retries`.
    pub default_max_retries: u32,
    /// Upper bound on jobs requeued per reconciler run.
    pub batch_size: u32,
    /// `printing` jobs older than this are failed by the reconciler.
    pub claim_timeout_secs: Option<u64>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            default_max_retries: 3,
            batch_size: 100,
            claim_timeout_secs: Some(300),
        }
    }
}

impl RetrySettings {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(QueueError::InvalidRequest(
                "batch_size must be at least 1".to_string(),
            ));
        }
        if self.claim_timeout_secs == Some(0) {
            return Err(QueueError::InvalidRequest(
                "claim_timeout_secs must be positive when set".to_string(),
            ));
        }
        Ok(())
    }
}

/// Partial update of [`RetrySettings`]. Absent fields keep their stored value.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetrySettingsPatch {
    pub enabled: Option<bool>,
    pub default_max_retries: Option<u32>,
    pub batch_size: Option<u32>,
    /// `null` switches the stale-claim sweep off.
    #[serde(default, deserialize_with = "present_or_null")]
    pub claim_timeout_secs: Option<Option<u64>>,
}

impl RetrySettingsPatch {
    pub fn apply(self, base: RetrySettings) -> RetrySettings {
        RetrySettings {
            enabled: self.enabled.unwrap_or(base.enabled),
            default_max_retries: self.default_max_retries.unwrap_or(base.default_max_retries),
            batch_size: self.batch_size.unwrap_or(base.batch_size),
            claim_timeout_secs: self.claim_timeout_secs.unwrap_or(base.claim_timeout_secs),
        }
    }
}

fn present_or_null<'de, D, T>(deserializer: D) -> std::result::Result<Option<Option<T>>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// Job count per status.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: u64,
    pub printing: u64,
    pub completed: u64,
    pub failed: u64,
}

impl QueueStats {
    pub fn depth(&self) -> u64 {
        self.pending + self.printing
    }
}

/// Result of a conditional update keyed by job id.
enum Transition {
    Applied(PrintJob),
    NotFound,
    WrongState(JobStatus),
}

/// Persistent print job store.
///
/// Every status change is a single conditional `UPDATE ... WHERE id = ? AND
/// status = <expected>`, so concurrent pollers, duplicated callbacks and an
/// overlapping reconciler can never move a job along an edge it is not on.
pub struct QueueManager {
    conn: Connection,
    clock: Arc<dyn Clock>,
    retry_policy: Arc<dyn RetryPolicy>,
    events: broadcast::Sender<JobEvent>,
}

impl QueueManager {
    /// Open (or create) the queue database.
    ///
    /// `initial_settings` seeds the runtime retry settings on first open only;
    /// settings already stored in the database win.
    pub async fn new(db_path: PathBuf, initial_settings: RetrySettings) -> Result<Self> {
        initial_settings.validate()?;

        let in_memory = db_path.as_os_str() == ":memory:";
        let conn = Connection::open(db_path).await?;
        let settings_json = serde_json::to_string(&initial_settings)?;

        conn.call(move |conn| {
            conn.busy_timeout(Duration::from_secs(5))?;
            if !in_memory {
                conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
                    row.get::<_, String>(0)
                })?;
            }

            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS print_jobs (
                    id TEXT PRIMARY KEY,
                    device_id TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    status TEXT NOT NULL
                        CHECK (status IN ('pending', 'printing', 'completed', 'failed')),
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL,
                    claimed_at INTEGER,
                    printed_at INTEGER,
                    error_message TEXT,
                    retry_count INTEGER NOT NULL DEFAULT 0,
                    max_retries INTEGER NOT NULL,
                    next_retry_at INTEGER
                );

                CREATE INDEX IF NOT EXISTS idx_device_pending
                    ON print_jobs(device_id, status, created_at);

                CREATE INDEX IF NOT EXISTS idx_status_retry
                    ON print_jobs(status, next_retry_at);

                CREATE INDEX IF NOT EXISTS idx_updated
                    ON print_jobs(updated_at);

                CREATE TABLE IF NOT EXISTS queue_settings (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                );
                "#,
            )?;

            conn.execute(
                "INSERT OR IGNORE INTO queue_settings (key, value) VALUES (?1, ?2)",
                params![SETTINGS_KEY_RETRY, settings_json],
            )?;

            Ok(())
        })
        .await?;

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            conn,
            clock: Arc::new(SystemClock),
            retry_policy: Arc::new(ExponentialPolicy::default()),
            events,
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Live feed of every status transition. The store never waits on
    /// subscribers; one that falls behind sees `RecvError::Lagged`.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    fn publish(&self, from: Option<JobStatus>, job: &PrintJob) {
        // No subscribers is the normal headless case
        let _ = self.events.send(JobEvent::from_transition(from, job));
    }

    /// Create a `pending` job for `device_id`.
    pub async fn submit(
        &self,
        device_id: &str,
        payload: serde_json::Value,
        max_retries: Option<u32>,
    ) -> Result<PrintJob> {
        let device_id = device_id.trim();
        if device_id.is_empty() {
            return Err(QueueError::InvalidRequest("device_id is required".to_string()));
        }
        if is_empty_payload(&payload) {
            return Err(QueueError::InvalidRequest("job_data is required".to_string()));
        }

        let max_retries = match max_retries {
            Some(n) => n,
            None => self.retry_settings().await?.default_max_retries,
        };

        let now = self.now();
        let job = PrintJob {
            id: uuid::Uuid::new_v4().to_string(),
            device_id: device_id.to_string(),
            payload,
            status: JobStatus::Pending,
            created_at: now,
            updated_at: now,
            claimed_at: None,
            printed_at: None,
            error_message: None,
            retry_count: 0,
            max_retries,
            next_retry_at: None,
        };

        let payload_json = serde_json::to_string(&job.payload)?;
        let row = job.clone();

        self.conn
            .call(move |conn| {
                conn.execute(
                    r#"
                    INSERT INTO print_jobs (
                        id, device_id, payload, status, created_at, updated_at,
                        retry_count, max_retries
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?5, 0, ?6)
                    "#,
                    params![
                        row.id,
                        row.device_id,
                        payload_json,
                        row.status,
                        row.created_at.timestamp_millis(),
                        row.max_retries,
                    ],
                )?;
                Ok(())
            })
            .await?;

        debug!("Print job {} submitted for device {}", job.id, job.device_id);
        self.publish(None, &job);

        Ok(job)
    }

    /// Claim the oldest pending job for `device_id`, moving it to `printing`.
    ///
    /// Find and mark happen in one conditional UPDATE, so two concurrent polls
    /// can never receive the same job.
    pub async fn claim_next(&self, device_id: &str) -> Result<Option<PrintJob>> {
        let device_id = device_id.trim().to_string();
        if device_id.is_empty() {
            return Err(QueueError::MissingDeviceId);
        }

        let now_ms = self.now().timestamp_millis();

        let claimed = self
            .conn
            .call(move |conn| {
                let sql = format!(
                    r#"
                    UPDATE print_jobs
                    SET status = ?3, claimed_at = ?2, updated_at = ?2
                    WHERE id = (
                        SELECT id FROM print_jobs
                        WHERE device_id = ?1 AND status = ?4
                        ORDER BY created_at ASC, rowid ASC
                        LIMIT 1
                    )
                    AND status = ?4
                    RETURNING {JOB_COLUMNS}
                    "#
                );
                let job = conn
                    .prepare(&sql)?
                    .query_row(
                        params![device_id, now_ms, JobStatus::Printing, JobStatus::Pending],
                        job_from_row,
                    )
                    .optional()?;
                Ok(job)
            })
            .await?;

        if let Some(job) = &claimed {
            debug!("Print job {} claimed by device {}", job.id, job.device_id);
            self.publish(Some(JobStatus::Pending), job);
        }

        Ok(claimed)
    }

    /// `printing -> completed`. Sets `printed_at`, clears any stale error.
    pub async fn mark_completed(&self, job_id: &str) -> Result<PrintJob> {
        let now_ms = self.now().timestamp_millis();

        self.transition(job_id, JobStatus::Printing, move |tx, id| {
            let sql = format!(
                r#"
                UPDATE print_jobs
                SET status = ?3, printed_at = ?2, updated_at = ?2,
                    error_message = NULL, next_retry_at = NULL
                WHERE id = ?1 AND status = ?4
                RETURNING {JOB_COLUMNS}
                "#
            );
            tx.prepare(&sql)?
                .query_row(
                    params![id, now_ms, JobStatus::Completed, JobStatus::Printing],
                    job_from_row,
                )
                .optional()
        })
        .await
    }

    /// `printing -> failed`. Records the error and schedules the earliest
    /// requeue using the configured retry policy. `retry_count` is untouched.
    pub async fn mark_failed(&self, job_id: &str, error_message: Option<&str>) -> Result<PrintJob> {
        let now_ms = self.now().timestamp_millis();
        let policy = self.retry_policy.clone();
        let message = error_message
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(DEFAULT_FAILURE_MESSAGE)
            .to_string();

        let job = self
            .transition(job_id, JobStatus::Printing, move |tx, id| {
                fail_printing_job(tx, id, now_ms, &message, policy.as_ref(), None)
            })
            .await?;

        info!(
            "Print job {} failed on device {} (retry {}/{}): {}",
            job.id,
            job.device_id,
            job.retry_count,
            job.max_retries,
            job.error_message.as_deref().unwrap_or_default()
        );

        Ok(job)
    }

    /// Reconciler requeue: `failed -> pending` only while under the retry
    /// ceiling and once `next_retry_at` has elapsed.
    ///
    /// Returns `None` when the job no longer qualifies (another run or a
    /// manual retry got there first).
    pub async fn requeue_failed(&self, job_id: &str) -> Result<Option<PrintJob>> {
        let now_ms = self.now().timestamp_millis();
        let id = job_id.to_string();

        let requeued = self
            .conn
            .call(move |conn| {
                let sql = format!(
                    r#"
                    UPDATE print_jobs
                    SET status = ?3, retry_count = retry_count + 1,
                        error_message = NULL, next_retry_at = NULL,
                        claimed_at = NULL, updated_at = ?2
                    WHERE id = ?1
                      AND status = ?4
                      AND retry_count < max_retries
                      AND next_retry_at IS NOT NULL
                      AND next_retry_at <= ?2
                    RETURNING {JOB_COLUMNS}
                    "#
                );
                let job = conn
                    .prepare(&sql)?
                    .query_row(
                        params![id, now_ms, JobStatus::Pending, JobStatus::Failed],
                        job_from_row,
                    )
                    .optional()?;
                Ok(job)
            })
            .await?;

        if let Some(job) = &requeued {
            self.publish(Some(JobStatus::Failed), job);
        }

        Ok(requeued)
    }

    /// Operator override: `failed -> pending` regardless of the retry ceiling.
    pub async fn retry_job(&self, job_id: &str) -> Result<PrintJob> {
        let now_ms = self.now().timestamp_millis();

        self.transition(job_id, JobStatus::Failed, move |tx, id| {
            let sql = format!(
                r#"
                UPDATE print_jobs
                SET status = ?3, retry_count = retry_count + 1,
                    error_message = NULL, next_retry_at = NULL,
                    claimed_at = NULL, updated_at = ?2
                WHERE id = ?1 AND status = ?4
                RETURNING {JOB_COLUMNS}
                "#
            );
            tx.prepare(&sql)?
                .query_row(
                    params![id, now_ms, JobStatus::Pending, JobStatus::Failed],
                    job_from_row,
                )
                .optional()
        })
        .await
    }

    /// Failed jobs whose retry time has elapsed and that are still under their
    /// ceiling, oldest schedule first.
    pub async fn due_for_retry(&self, limit: u32) -> Result<Vec<PrintJob>> {
        self.failed_due(limit, "retry_count < max_retries").await
    }

    /// Failed jobs whose retry time has elapsed but that have used up their
    /// retry budget. They stay `failed` until an operator intervenes.
    pub async fn exhausted_due(&self, limit: u32) -> Result<Vec<PrintJob>> {
        self.failed_due(limit, "retry_count >= max_retries").await
    }

    async fn failed_due(&self, limit: u32, budget_clause: &'static str) -> Result<Vec<PrintJob>> {
        let now_ms = self.now().timestamp_millis();

        let jobs = self
            .conn
            .call(move |conn| {
                let sql = format!(
                    r#"
                    SELECT {JOB_COLUMNS}
                    FROM print_jobs
                    WHERE status = ?1
                      AND next_retry_at IS NOT NULL
                      AND next_retry_at <= ?2
                      AND {budget_clause}
                    ORDER BY next_retry_at ASC, created_at ASC
                    LIMIT ?3
                    "#
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params![JobStatus::Failed, now_ms, limit], job_from_row)?;

                let mut jobs = Vec::new();
                for job_result in rows {
                    jobs.push(job_result?);
                }
                Ok(jobs)
            })
            .await?;

        Ok(jobs)
    }

    /// Fail `printing` jobs claimed longer than `timeout` ago. A printer that
    /// claims a job and then drops off the network never calls back; this is
    /// the `printing -> failed` edge taken on its behalf.
    pub async fn expire_stale_claims(&self, timeout: Duration, limit: u32) -> Result<Vec<PrintJob>> {
        let now_ms = self.now().timestamp_millis();
        let cutoff_ms = now_ms.saturating_sub(duration_millis(timeout));
        let policy = self.retry_policy.clone();

        let expired = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;

                let stale: Vec<(String, i64)> = {
                    let mut stmt = tx.prepare(
                        r#"
                        SELECT id, claimed_at FROM print_jobs
                        WHERE status = ?1 AND claimed_at IS NOT NULL AND claimed_at < ?2
                        ORDER BY claimed_at ASC
                        LIMIT ?3
                        "#,
                    )?;
                    let rows = stmt.query_map(params![JobStatus::Printing, cutoff_ms, limit], |row| {
                        Ok((row.get(0)?, row.get(1)?))
                    })?;
                    let stale = rows.collect::<rusqlite::Result<Vec<_>>>()?;
                    stale
                };

                let mut expired = Vec::with_capacity(stale.len());
                for (id, claimed_at) in stale {
                    if let Some(job) = fail_printing_job(
                        &tx,
                        &id,
                        now_ms,
                        CLAIM_EXPIRED_MESSAGE,
                        policy.as_ref(),
                        Some(claimed_at),
                    )? {
                        expired.push(job);
                    }
                }

                tx.commit()?;
                Ok(expired)
            })
            .await?;

        for job in &expired {
            warn!(
                "Print job {} on device {} expired in printing state",
                job.id, job.device_id
            );
            self.publish(Some(JobStatus::Printing), job);
        }

        Ok(expired)
    }

    pub async fn get_job(&self, job_id: &str) -> Result<PrintJob> {
        let id = job_id.to_string();

        let job = self
            .conn
            .call(move |conn| {
                let sql = format!("SELECT {JOB_COLUMNS} FROM print_jobs WHERE id = ?1");
                let job = conn
                    .prepare(&sql)?
                    .query_row([&id], job_from_row)
                    .optional()?;
                Ok(job)
            })
            .await?;

        job.ok_or_else(|| QueueError::JobNotFound(job_id.to_string()))
    }

    /// Jobs matching `filter`, most recently updated first.
    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<PrintJob>> {
        let mut clauses = Vec::new();
        let mut values: Vec<rusqlite::types::Value> = Vec::new();

        if let Some(device_id) = filter.device_id.as_deref().map(str::trim).filter(|d| !d.is_empty()) {
            values.push(rusqlite::types::Value::Text(device_id.to_string()));
            clauses.push(format!("device_id = ?{}", values.len()));
        }
        if let Some(status) = filter.status {
            values.push(rusqlite::types::Value::Text(status.as_str().to_string()));
            clauses.push(format!("status = ?{}", values.len()));
        }
        values.push(rusqlite::types::Value::Integer(i64::from(filter.effective_limit())));
        let limit_param = values.len();

        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };

        let jobs = self
            .conn
            .call(move |conn| {
                let sql = format!(
                    "SELECT {JOB_COLUMNS} FROM print_jobs {where_clause} \
                     ORDER BY updated_at DESC, rowid DESC LIMIT ?{limit_param}"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params_from_iter(values), job_from_row)?;

                let mut jobs = Vec::new();
                for job_result in rows {
                    jobs.push(job_result?);
                }
                Ok(jobs)
            })
            .await?;

        Ok(jobs)
    }

    /// Get queue statistics
    pub async fn get_stats(&self) -> Result<QueueStats> {
        let stats = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    r#"
                    SELECT status, COUNT(*) as count
                    FROM print_jobs
                    GROUP BY status
                    "#,
                )?;

                let rows = stmt.query_map([], |row| {
                    Ok((row.get::<_, JobStatus>(0)?, row.get::<_, u64>(1)?))
                })?;

                let mut stats = QueueStats::default();
                for row_result in rows {
                    let (status, count) = row_result?;
                    match status {
                        JobStatus::Pending => stats.pending = count,
                        JobStatus::Printing => stats.printing = count,
                        JobStatus::Completed => stats.completed = count,
                        JobStatus::Failed => stats.failed = count,
                    }
                }
                Ok(stats)
            })
            .await?;

        Ok(stats)
    }

    pub async fn retry_settings(&self) -> Result<RetrySettings> {
        let raw = self
            .conn
            .call(|conn| {
                let value = conn
                    .query_row(
                        "SELECT value FROM queue_settings WHERE key = ?1",
                        [SETTINGS_KEY_RETRY],
                        |row| row.get::<_, String>(0),
                    )
                    .optional()?;
                Ok(value)
            })
            .await?;

        match raw {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(RetrySettings::default()),
        }
    }

    pub async fn update_retry_settings(&self, settings: RetrySettings) -> Result<RetrySettings> {
        settings.validate()?;
        let json = serde_json::to_string(&settings)?;

        self.conn
            .call(move |conn| {
                conn.execute(
                    r#"
                    INSERT INTO queue_settings (key, value) VALUES (?1, ?2)
                    ON CONFLICT(key) DO UPDATE SET value = excluded.value
                    "#,
                    params![SETTINGS_KEY_RETRY, json],
                )?;
                Ok(())
            })
            .await?;

        info!(
            "Retry settings updated: enabled={}, default_max_retries={}, batch_size={}",
            settings.enabled, settings.default_max_retries, settings.batch_size
        );

        Ok(settings)
    }

    /// Merge `patch` over the stored settings in one transaction.
    pub async fn patch_retry_settings(&self, patch: RetrySettingsPatch) -> Result<RetrySettings> {
        let outcome = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let stored = tx
                    .query_row(
                        "SELECT value FROM queue_settings WHERE key = ?1",
                        [SETTINGS_KEY_RETRY],
                        |row| row.get::<_, String>(0),
                    )
                    .optional()?;

                let (settings, json) = match merge_settings(stored.as_deref(), patch) {
                    Ok(merged) => merged,
                    Err(e) => return Ok(Err(e)),
                };

                tx.execute(
                    r#"
                    INSERT INTO queue_settings (key, value) VALUES (?1, ?2)
                    ON CONFLICT(key) DO UPDATE SET value = excluded.value
                    "#,
                    params![SETTINGS_KEY_RETRY, json],
                )?;
                tx.commit()?;
                Ok(Ok(settings))
            })
            .await?;

        let settings = outcome?;
        info!(
            "Retry settings updated: enabled={}, default_max_retries={}, batch_size={}",
            settings.enabled, settings.default_max_retries, settings.batch_size
        );

        Ok(settings)
    }

    /// Run a conditional update for a single job and classify a miss as
    /// either an unknown id or a job sitting in some other state.
    async fn transition<F>(&self, job_id: &str, expected: JobStatus, update: F) -> Result<PrintJob>
    where
        F: FnOnce(&rusqlite::Transaction<'_>, &str) -> rusqlite::Result<Option<PrintJob>>
            + Send
            + 'static,
    {
        let id = job_id.to_string();

        let outcome = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;

                let outcome = match update(&tx, &id)? {
                    Some(job) => Transition::Applied(job),
                    None => tx
                        .query_row("SELECT status FROM print_jobs WHERE id = ?1", [&id], |row| {
                            row.get::<_, JobStatus>(0)
                        })
                        .optional()?
                        .map_or(Transition::NotFound, Transition::WrongState),
                };

                tx.commit()?;
                Ok(outcome)
            })
            .await?;

        match outcome {
            Transition::Applied(job) => {
                self.publish(Some(expected), &job);
                Ok(job)
            }
            Transition::NotFound => Err(QueueError::JobNotFound(job_id.to_string())),
            Transition::WrongState(current) => Err(QueueError::InvalidState {
                job_id: job_id.to_string(),
                current,
                expected,
            }),
        }
    }
}

/// `printing -> failed` inside an open transaction. When `claimed_at` is
/// given the update only applies if the claim is still the one observed.
fn fail_printing_job(
    tx: &rusqlite::Transaction<'_>,
    id: &str,
    now_ms: i64,
    message: &str,
    policy: &dyn RetryPolicy,
    claimed_at: Option<i64>,
) -> rusqlite::Result<Option<PrintJob>> {
    let retry_count: Option<u32> = tx
        .query_row(
            "SELECT retry_count FROM print_jobs WHERE id = ?1 AND status = ?2",
            params![id, JobStatus::Printing],
            |row| row.get(0),
        )
        .optional()?;

    let Some(retry_count) = retry_count else {
        return Ok(None);
    };

    let next_retry_ms = now_ms.saturating_add(duration_millis(policy.delay_for(retry_count)));

    let sql = format!(
        r#"
        UPDATE print_jobs
        SET status = ?3, error_message = ?4, next_retry_at = ?5, updated_at = ?2
        WHERE id = ?1 AND status = ?6 AND (?7 IS NULL OR claimed_at = ?7)
        RETURNING {JOB_COLUMNS}
        "#
    );
    tx.prepare(&sql)?
        .query_row(
            params![
                id,
                now_ms,
                JobStatus::Failed,
                message,
                next_retry_ms,
                JobStatus::Printing,
                claimed_at,
            ],
            job_from_row,
        )
        .optional()
}

fn merge_settings(
    stored: Option<&str>,
    patch: RetrySettingsPatch,
) -> Result<(RetrySettings, String)> {
    let current = match stored {
        Some(json) => serde_json::from_str(json)?,
        None => RetrySettings::default(),
    };
    let merged = patch.apply(current);
    merged.validate()?;
    let json = serde_json::to_string(&merged)?;
    Ok((merged, json))
}

fn job_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PrintJob> {
    let payload_json: String = row.get(2)?;
    let payload = serde_json::from_str(&payload_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(PrintJob {
        id: row.get(0)?,
        device_id: row.get(1)?,
        payload,
        status: row.get(3)?,
        created_at: from_millis(row.get(4)?),
        updated_at: from_millis(row.get(5)?),
        claimed_at: row.get::<_, Option<i64>>(6)?.map(from_millis),
        printed_at: row.get::<_, Option<i64>>(7)?.map(from_millis),
        error_message: row.get(8)?,
        retry_count: row.get(9)?,
        max_retries: row.get(10)?,
        next_retry_at: row.get::<_, Option<i64>>(11)?.map(from_millis),
    })
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn duration_millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// `null`, `""`, `{}` and `[]` carry nothing to print.
pub fn is_empty_payload(payload: &serde_json::Value) -> bool {
    match payload {
        serde_json::Value::Null => true,
        serde_json::Value::String(s) => s.trim().is_empty(),
        serde_json::Value::Object(map) => map.is_empty(),
        serde_json::Value::Array(items) => items.is_empty(),
        _ => false,
    }
}
