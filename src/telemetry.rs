use crate::history::JobEvent;
use crate::queue::{QueueManager, QueueStats};
use crate::reconciler::ReconcileSummary;
use crate::status::JobStatus;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

const MAX_EVENT_HISTORY: usize = 1000;
const MAX_TURNAROUND_SAMPLES: usize = 1000;

/// Telemetry event types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TelemetryEvent {
    JobSubmitted {
        job_id: String,
        device_id: String,
    },
    JobClaimed {
        job_id: String,
        device_id: String,
        retry_count: u32,
    },
    JobCompleted {
        job_id: String,
        device_id: String,
        /// Claim to success callback
        turnaround_ms: Option<u64>,
        retry_count: u32,
    },
    JobFailed {
        job_id: String,
        device_id: String,
        error: String,
        retry_count: u32,
        exhausted: bool,
    },
    JobRequeued {
        job_id: String,
        device_id: String,
        retry_count: u32,
    },
    ReconcileRun {
        retried: usize,
        skipped: usize,
        expired_claims: usize,
        disabled: bool,
    },
    QueueSnapshot {
        pending: u64,
        printing: u64,
        completed: u64,
        failed: u64,
    },
}

impl TelemetryEvent {
    pub fn from_job_event(event: &JobEvent) -> Self {
        let job_id = event.job_id.clone();
        let device_id = event.device_id.clone();

        match (event.from, event.to) {
            (None, _) => TelemetryEvent::JobSubmitted { job_id, device_id },
            (_, JobStatus::Printing) => TelemetryEvent::JobClaimed {
                job_id,
                device_id,
                retry_count: event.retry_count,
            },
            (_, JobStatus::Completed) => TelemetryEvent::JobCompleted {
                job_id,
                device_id,
                turnaround_ms: event
                    .claimed_at
                    .and_then(|claimed| (event.at - claimed).to_std().ok())
                    .map(|d| d.as_millis() as u64),
                retry_count: event.retry_count,
            },
            (_, JobStatus::Failed) => TelemetryEvent::JobFailed {
                job_id,
                device_id,
                error: event.error_message.clone().unwrap_or_default(),
                retry_count: event.retry_count,
                exhausted: event.retry_count >= event.max_retries,
            },
            (Some(_), JobStatus::Pending) => TelemetryEvent::JobRequeued {
                job_id,
                device_id,
                retry_count: event.retry_count,
            },
        }
    }
}

impl From<&ReconcileSummary> for TelemetryEvent {
    fn from(summary: &ReconcileSummary) -> Self {
        TelemetryEvent::ReconcileRun {
            retried: summary.retried,
            skipped: summary.skipped.len(),
            expired_claims: summary.expired_claims,
            disabled: summary.disabled,
        }
    }
}

/// Telemetry metrics for reporting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryMetrics {
    pub total_jobs_submitted: u64,
    pub total_jobs_claimed: u64,
    pub total_jobs_completed: u64,
    pub total_jobs_failed: u64,
    pub total_jobs_requeued: u64,
    /// Failures that left the job at its retry ceiling
    pub total_jobs_exhausted: u64,
    pub reconcile_runs: u64,
    /// Average claim-to-completion time (milliseconds)
    pub avg_turnaround_ms: u64,
    /// Completed / (completed + failed), 0.0 - 1.0
    pub success_rate: f64,
    /// pending + printing, from the last queue snapshot
    pub queue_depth: u64,
    pub last_update_ts: u64,
}

impl Default for TelemetryMetrics {
    fn default() -> Self {
        Self {
            total_jobs_submitted: 0,
            total_jobs_claimed: 0,
            total_jobs_completed: 0,
            total_jobs_failed: 0,
            total_jobs_requeued: 0,
            total_jobs_exhausted: 0,
            reconcile_runs: 0,
            avg_turnaround_ms: 0,
            success_rate: 1.0,
            queue_depth: 0,
            last_update_ts: unix_now(),
        }
    }
}

/// Telemetry collector for aggregating metrics
pub struct TelemetryCollector {
    metrics: Arc<RwLock<TelemetryMetrics>>,
    /// Last 1000 events
    event_history: Arc<RwLock<Vec<(u64, TelemetryEvent)>>>,
    /// Turnaround samples (for averaging, max 1000)
    turnarounds: Arc<RwLock<Vec<u64>>>,
}

impl TelemetryCollector {
    pub fn new() -> Self {
        info!("Initializing telemetry collector");
        Self {
            metrics: Arc::new(RwLock::new(TelemetryMetrics::default())),
            event_history: Arc::new(RwLock::new(Vec::new())),
            turnarounds: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Record telemetry event
    pub async fn record_event(&self, event: TelemetryEvent) {
        let timestamp = unix_now();
        let mut metrics = self.metrics.write().await;

        match &event {
            TelemetryEvent::JobSubmitted { .. } => metrics.total_jobs_submitted += 1,
            TelemetryEvent::JobClaimed { .. } => metrics.total_jobs_claimed += 1,
            TelemetryEvent::JobCompleted { turnaround_ms, .. } => {
                metrics.total_jobs_completed += 1;

                if let Some(ms) = turnaround_ms {
                    let mut samples = self.turnarounds.write().await;
                    samples.push(*ms);
                    if samples.len() > MAX_TURNAROUND_SAMPLES {
                        samples.remove(0);
                    }
                    let sum: u64 = samples.iter().sum();
                    metrics.avg_turnaround_ms = sum / samples.len() as u64;
                }

                update_success_rate(&mut metrics);
            }
            TelemetryEvent::JobFailed { exhausted, .. } => {
                metrics.total_jobs_failed += 1;
                if *exhausted {
                    metrics.total_jobs_exhausted += 1;
                }
                update_success_rate(&mut metrics);

                debug!(
                    "Print job failed - Total failed: {}, Success rate: {:.2}%",
                    metrics.total_jobs_failed,
                    metrics.success_rate * 100.0
                );
            }
            TelemetryEvent::JobRequeued { .. } => metrics.total_jobs_requeued += 1,
            TelemetryEvent::ReconcileRun { .. } => metrics.reconcile_runs += 1,
            TelemetryEvent::QueueSnapshot { pending, printing, .. } => {
                metrics.queue_depth = pending + printing;
            }
        }

        metrics.last_update_ts = timestamp;
        drop(metrics);

        let mut history = self.event_history.write().await;
        history.push((timestamp, event));
        if history.len() > MAX_EVENT_HISTORY {
            history.remove(0);
        }
    }

    /// Consume the queue's transition feed until the queue is dropped.
    pub fn attach(self: Arc<Self>, mut events: broadcast::Receiver<JobEvent>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        self.record_event(TelemetryEvent::from_job_event(&event)).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("Telemetry fell behind the job event feed, {} events dropped", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Job event feed closed, telemetry detached");
                        break;
                    }
                }
            }
        })
    }

    pub async fn record_queue_stats(&self, stats: QueueStats) {
        self.record_event(TelemetryEvent::QueueSnapshot {
            pending: stats.pending,
            printing: stats.printing,
            completed: stats.completed,
            failed: stats.failed,
        })
        .await;
    }

    pub async fn get_metrics(&self) -> TelemetryMetrics {
        self.metrics.read().await.clone()
    }

    /// Get event history (last N events)
    pub async fn get_event_history(&self, limit: usize) -> Vec<(u64, TelemetryEvent)> {
        let history = self.event_history.read().await;
        let start = history.len().saturating_sub(limit);
        history[start..].to_vec()
    }

    pub async fn get_metrics_json(&self) -> serde_json::Value {
        let metrics = self.get_metrics().await;
        serde_json::to_value(&metrics).unwrap_or_default()
    }

    /// Export metrics for external monitoring (Prometheus format)
    pub async fn export_prometheus(&self) -> String {
        let metrics = self.get_metrics().await;

        format!(
            "# HELP print_jobs_submitted_total Total number of submitted print jobs\n\
             # TYPE print_jobs_submitted_total counter\n\
             print_jobs_submitted_total {}\n\
             \n\
             # HELP print_jobs_claimed_total Total number of jobs claimed by printer polls\n\
             # TYPE print_jobs_claimed_total counter\n\
             print_jobs_claimed_total {}\n\
             \n\
             # HELP print_jobs_completed_total Total number of completed print jobs\n\
             # TYPE print_jobs_completed_total counter\n\
             print_jobs_completed_total {}\n\
             \n\
             # HELP print_jobs_failed_total Total number of failure callbacks\n\
             # TYPE print_jobs_failed_total counter\n\
             print_jobs_failed_total {}\n\
             \n\
             # HELP print_jobs_requeued_total Total number of failed -> pending requeues\n\
             # TYPE print_jobs_requeued_total counter\n\
             print_jobs_requeued_total {}\n\
             \n\
             # HELP print_jobs_exhausted_total Failures at the retry ceiling\n\
             # TYPE print_jobs_exhausted_total counter\n\
             print_jobs_exhausted_total {}\n\
             \n\
             # HELP print_reconcile_runs_total Reconciler runs\n\
             # TYPE print_reconcile_runs_total counter\n\
             print_reconcile_runs_total {}\n\
             \n\
             # HELP print_avg_turnaround_ms Average claim-to-completion time in milliseconds\n\
             # TYPE print_avg_turnaround_ms gauge\n\
             print_avg_turnaround_ms {}\n\
             \n\
             # HELP print_success_rate Print job success rate (0.0 - 1.0)\n\
             # TYPE print_success_rate gauge\n\
             print_success_rate {:.4}\n\
             \n\
             # HELP print_queue_depth Current queue depth (pending + printing)\n\
             # TYPE print_queue_depth gauge\n\
             print_queue_depth {}\n",
            metrics.total_jobs_submitted,
            metrics.total_jobs_claimed,
            metrics.total_jobs_completed,
            metrics.total_jobs_failed,
            metrics.total_jobs_requeued,
            metrics.total_jobs_exhausted,
            metrics.reconcile_runs,
            metrics.avg_turnaround_ms,
            metrics.success_rate,
            metrics.queue_depth,
        )
    }
}

impl Default for TelemetryCollector {
    fn default() -> Self {
        Self::new()
    }
}

fn update_success_rate(metrics: &mut TelemetryMetrics) {
    let total = metrics.total_jobs_completed + metrics.total_jobs_failed;
    if total > 0 {
        metrics.success_rate = metrics.total_jobs_completed as f64 / total as f64;
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Periodic telemetry reporter: snapshots the queue and logs a summary line.
pub struct TelemetryReporter {
    collector: Arc<TelemetryCollector>,
    queue: Arc<QueueManager>,
}

impl TelemetryReporter {
    pub fn new(collector: Arc<TelemetryCollector>, queue: Arc<QueueManager>) -> Self {
        Self { collector, queue }
    }

    pub fn start_reporting(self, interval_secs: u64) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));

            loop {
                interval.tick().await;

                match self.queue.get_stats().await {
                    Ok(stats) => self.collector.record_queue_stats(stats).await,
                    Err(e) => warn!("Telemetry queue snapshot failed: {}", e),
                }

                let metrics = self.collector.get_metrics().await;

                info!(
                    "Telemetry Report - Jobs: {} submitted, {} completed, {} failed, {} requeued | Success: {:.1}% | Avg turnaround: {}ms | Queue depth: {}",
                    metrics.total_jobs_submitted,
                    metrics.total_jobs_completed,
                    metrics.total_jobs_failed,
                    metrics.total_jobs_requeued,
                    metrics.success_rate * 100.0,
                    metrics.avg_turnaround_ms,
                    metrics.queue_depth,
                );
            }
        })
    }
}
