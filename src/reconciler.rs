use crate::errors::Result;
use crate::queue::QueueManager;
use crate::telemetry::{TelemetryCollector, TelemetryEvent};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Outcome of one reconciler pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReconcileSummary {
    /// Jobs moved `failed -> pending`.
    pub retried: usize,
    /// Due jobs left `failed` because they reached their retry ceiling.
    pub skipped: Vec<String>,
    /// Entries of `skipped` that were not at the ceiling on the previous run.
    pub newly_exhausted: usize,
    /// Due jobs that another actor requeued between selection and update.
    pub lost_races: usize,
    /// `printing` jobs failed for exceeding the claim timeout.
    pub expired_claims: usize,
    /// Retry was switched off in the runtime settings.
    pub disabled: bool,
}

/// Periodically resurrects failed jobs whose retry time has come.
///
/// Each requeue is its own conditional update, so a run that dies halfway
/// leaves requeued jobs `pending` and the rest `failed`; nothing to undo.
pub struct Reconciler {
    queue: Arc<QueueManager>,
    telemetry: Option<Arc<TelemetryCollector>>,
    /// Ceiling jobs reported by the previous run.
    exhausted: Mutex<HashSet<String>>,
}

impl Reconciler {
    pub fn new(queue: Arc<QueueManager>) -> Self {
        Self {
            queue,
            telemetry: None,
            exhausted: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_telemetry(mut self, telemetry: Arc<TelemetryCollector>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// One pass. Settings are re-read every time so an operator toggle is
    /// honoured on the very next run.
    pub async fn run_once(&self) -> Result<ReconcileSummary> {
        let settings = self.queue.retry_settings().await?;
        let mut summary = ReconcileSummary::default();

        if let Some(timeout_secs) = settings.claim_timeout_secs {
            let expired = self
                .queue
                .expire_stale_claims(Duration::from_secs(timeout_secs), settings.batch_size)
                .await?;
            summary.expired_claims = expired.len();
        }

        if !settings.enabled {
            debug!("Retry disabled, reconciler skipping requeue pass");
            summary.disabled = true;
            self.record(&summary).await;
            return Ok(summary);
        }

        for job in self.queue.due_for_retry(settings.batch_size).await? {
            match self.queue.requeue_failed(&job.id).await? {
                Some(requeued) => {
                    summary.retried += 1;
                    debug!(
                        "Requeued job {} for device {} (attempt {}/{})",
                        requeued.id, requeued.device_id, requeued.retry_count, requeued.max_retries
                    );
                }
                None => summary.lost_races += 1,
            }
        }

        summary.skipped = self
            .queue
            .exhausted_due(settings.batch_size)
            .await?
            .into_iter()
            .map(|job| job.id)
            .collect();

        summary.newly_exhausted = self.track_exhausted(&summary.skipped);
        if summary.newly_exhausted > 0 {
            warn!(
                "{} failed jobs reached their retry ceiling and need operator attention ({} waiting in total)",
                summary.newly_exhausted,
                summary.skipped.len()
            );
        } else if !summary.skipped.is_empty() {
            debug!("{} failed jobs still waiting at their retry ceiling", summary.skipped.len());
        }

        self.record(&summary).await;
        Ok(summary)
    }

    /// Remember this run's ceiling jobs and count the ones not seen last run.
    fn track_exhausted(&self, skipped: &[String]) -> usize {
        let current: HashSet<String> = skipped.iter().cloned().collect();
        let mut previous = self.exhausted.lock().unwrap_or_else(|e| e.into_inner());
        let newly = current.difference(&previous).count();
        *previous = current;
        newly
    }

    async fn record(&self, summary: &ReconcileSummary) {
        if let Some(telemetry) = &self.telemetry {
            telemetry.record_event(TelemetryEvent::from(summary)).await;
        }
    }

    /// Run forever on a fixed interval. Errors are logged and the next tick
    /// tries again. Abort the returned handle to stop.
    pub fn start(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!("Retry reconciler started (every {:?})", interval);

            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                match self.run_once().await {
                    Ok(summary) if summary.retried > 0 || summary.expired_claims > 0 => {
                        info!(
                            "Reconciler run: retried={}, skipped={}, expired_claims={}",
                            summary.retried,
                            summary.skipped.len(),
                            summary.expired_claims
                        );
                    }
                    Ok(summary) => debug!("Reconciler run: {:?}", summary),
                    Err(e) => error!("Reconciler run failed: {}", e),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::FixedPolicy;
    use crate::clock::MockClock;
    use crate::queue::RetrySettings;
    use crate::status::JobStatus;
    use chrono::{DateTime, TimeZone, Utc};
    use serde_json::json;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicI64, Ordering};

    struct Harness {
        queue: Arc<QueueManager>,
        reconciler: Reconciler,
        now_ms: Arc<AtomicI64>,
    }

    impl Harness {
        async fn new(settings: RetrySettings) -> Self {
            let start: DateTime<Utc> = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
            let now_ms = Arc::new(AtomicI64::new(start.timestamp_millis()));

            let mut clock = MockClock::new();
            let source = now_ms.clone();
            clock.expect_now().returning(move || {
                DateTime::from_timestamp_millis(source.load(Ordering::SeqCst)).unwrap()
            });

            let queue = Arc::new(
                QueueManager::new(PathBuf::from(":memory:"), settings)
                    .await
                    .unwrap()
                    .with_clock(Arc::new(clock))
                    .with_retry_policy(Arc::new(FixedPolicy(Duration::from_secs(30)))),
            );

            Self {
                reconciler: Reconciler::new(queue.clone()),
                queue,
                now_ms,
            }
        }

        fn advance_secs(&self, secs: i64) {
            self.now_ms.fetch_add(secs * 1000, Ordering::SeqCst);
        }

        async fn failed_job(&self, max_retries: u32) -> String {
            let job = self
                .queue
                .submit("D1", json!({"receipt": "x"}), Some(max_retries))
                .await
                .unwrap();
            self.queue.claim_next("D1").await.unwrap();
            self.queue.mark_failed(&job.id, Some("paper jam")).await.unwrap();
            job.id
        }
    }

    #[tokio::test]
    async fn test_nothing_due_is_not_an_error() {
        let h = Harness::new(RetrySettings::default()).await;
        let summary = h.reconciler.run_once().await.unwrap();
        assert_eq!(summary, ReconcileSummary::default());
    }

    #[tokio::test]
    async fn test_requeues_once_retry_time_elapses() {
        let h = Harness::new(RetrySettings::default()).await;
        let id = h.failed_job(3).await;

        let early = h.reconciler.run_once().await.unwrap();
        assert_eq!(early.retried, 0);

        h.advance_secs(30);
        let summary = h.reconciler.run_once().await.unwrap();
        assert_eq!(summary.retried, 1);

        let job = h.queue.get_job(&id).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, 1);
        assert!(job.error_message.is_none());
        assert!(job.next_retry_at.is_none());
    }

    #[tokio::test]
    async fn test_back_to_back_runs_requeue_exactly_once() {
        let h = Harness::new(RetrySettings::default()).await;
        let a = h.failed_job(3).await;
        let b = h.failed_job(3).await;
        h.advance_secs(60);

        let first = h.reconciler.run_once().await.unwrap();
        let second = h.reconciler.run_once().await.unwrap();

        assert_eq!(first.retried, 2);
        assert_eq!(second.retried, 0);
        for id in [a, b] {
            assert_eq!(h.queue.get_job(&id).await.unwrap().retry_count, 1);
        }
    }

    #[tokio::test]
    async fn test_ceiling_jobs_are_skipped_and_reported() {
        let h = Harness::new(RetrySettings::default()).await;
        let id = h.failed_job(0).await;
        h.advance_secs(60);

        let summary = h.reconciler.run_once().await.unwrap();

        assert_eq!(summary.retried, 0);
        assert_eq!(summary.skipped, vec![id.clone()]);
        assert_eq!(h.queue.get_job(&id).await.unwrap().status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_ceiling_job_is_new_only_on_first_report() {
        let h = Harness::new(RetrySettings::default()).await;
        let id = h.failed_job(0).await;
        h.advance_secs(60);

        let first = h.reconciler.run_once().await.unwrap();
        assert_eq!(first.skipped, vec![id.clone()]);
        assert_eq!(first.newly_exhausted, 1);

        let second = h.reconciler.run_once().await.unwrap();
        assert_eq!(second.skipped, vec![id.clone()]);
        assert_eq!(second.newly_exhausted, 0);

        // Operator retries, the printer fails it again: it is new once more
        h.queue.retry_job(&id).await.unwrap();
        let third = h.reconciler.run_once().await.unwrap();
        assert!(third.skipped.is_empty());

        h.queue.claim_next("D1").await.unwrap();
        h.queue.mark_failed(&id, Some("paper jam")).await.unwrap();
        h.advance_secs(30);
        let fourth = h.reconciler.run_once().await.unwrap();
        assert_eq!(fourth.skipped, vec![id]);
        assert_eq!(fourth.newly_exhausted, 1);
    }

    #[tokio::test]
    async fn test_disabled_setting_read_fresh_each_run() {
        let h = Harness::new(RetrySettings::default()).await;
        let id = h.failed_job(3).await;
        h.advance_secs(60);

        h.queue
            .update_retry_settings(RetrySettings { enabled: false, ..RetrySettings::default() })
            .await
            .unwrap();
        let summary = h.reconciler.run_once().await.unwrap();
        assert!(summary.disabled);
        assert_eq!(summary.retried, 0);
        assert_eq!(h.queue.get_job(&id).await.unwrap().status, JobStatus::Failed);

        h.queue.update_retry_settings(RetrySettings::default()).await.unwrap();
        let summary = h.reconciler.run_once().await.unwrap();
        assert_eq!(summary.retried, 1);
    }

    #[tokio::test]
    async fn test_batch_size_bounds_a_run() {
        let h = Harness::new(RetrySettings { batch_size: 2, ..RetrySettings::default() }).await;
        for _ in 0..5 {
            h.failed_job(3).await;
        }
        h.advance_secs(60);

        assert_eq!(h.reconciler.run_once().await.unwrap().retried, 2);
        assert_eq!(h.reconciler.run_once().await.unwrap().retried, 2);
        assert_eq!(h.reconciler.run_once().await.unwrap().retried, 1);
    }

    #[tokio::test]
    async fn test_stale_claims_expire_into_failed() {
        let h = Harness::new(RetrySettings {
            claim_timeout_secs: Some(120),
            ..RetrySettings::default()
        })
        .await;
        let job = h.queue.submit("D1", json!({"receipt": "x"}), None).await.unwrap();
        h.queue.claim_next("D1").await.unwrap();

        h.advance_secs(121);
        let summary = h.reconciler.run_once().await.unwrap();
        assert_eq!(summary.expired_claims, 1);
        assert_eq!(summary.retried, 0);
        assert_eq!(h.queue.get_job(&job.id).await.unwrap().status, JobStatus::Failed);

        h.advance_secs(30);
        let summary = h.reconciler.run_once().await.unwrap();
        assert_eq!(summary.retried, 1);
    }

    #[tokio::test]
    async fn test_run_feeds_telemetry() {
        let h = Harness::new(RetrySettings::default()).await;
        let telemetry = Arc::new(TelemetryCollector::new());
        let reconciler = Reconciler::new(h.queue.clone()).with_telemetry(telemetry.clone());

        reconciler.run_once().await.unwrap();

        assert_eq!(telemetry.get_metrics().await.reconcile_runs, 1);
    }
}
