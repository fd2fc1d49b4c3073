//! Operator-facing projection of the print queue: job listings, per-status
//! counts, manual retry and a live feed of status transitions.

use crate::errors::Result;
use crate::queue::{PrintJob, QueueManager, QueueStats};
use crate::status::JobStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

pub const DEFAULT_HISTORY_LIMIT: u32 = 100;
pub const MAX_HISTORY_LIMIT: u32 = 500;

/// One status transition of one job. `from` is `None` for creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobEvent {
    pub job_id: String,
    pub device_id: String,
    pub from: Option<JobStatus>,
    pub to: JobStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub error_message: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub at: DateTime<Utc>,
}

impl JobEvent {
    pub fn from_transition(from: Option<JobStatus>, job: &PrintJob) -> Self {
        Self {
            job_id: job.id.clone(),
            device_id: job.device_id.clone(),
            from,
            to: job.status,
            retry_count: job.retry_count,
            max_retries: job.max_retries,
            error_message: job.error_message.clone(),
            claimed_at: job.claimed_at,
            at: job.updated_at,
        }
    }

    /// A `failed -> pending` move.
    pub fn is_requeue(&self) -> bool {
        self.from == Some(JobStatus::Failed) && self.to == JobStatus::Pending
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobFilter {
    pub device_id: Option<String>,
    pub status: Option<JobStatus>,
    pub limit: Option<u32>,
}

impl JobFilter {
    pub fn effective_limit(&self) -> u32 {
        self.limit
            .unwrap_or(DEFAULT_HISTORY_LIMIT)
            .clamp(1, MAX_HISTORY_LIMIT)
    }
}

#[derive(Clone)]
pub struct HistoryView {
    queue: Arc<QueueManager>,
}

impl HistoryView {
    pub fn new(queue: Arc<QueueManager>) -> Self {
        Self { queue }
    }

    pub async fn list(&self, filter: &JobFilter) -> Result<Vec<PrintJob>> {
        self.queue.list_jobs(filter).await
    }

    pub async fn get(&self, job_id: &str) -> Result<PrintJob> {
        self.queue.get_job(job_id).await
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        self.queue.get_stats().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.queue.subscribe()
    }

    /// Force a `failed` job back to `pending`, bypassing the retry ceiling.
    pub async fn retry(&self, job_id: &str) -> Result<PrintJob> {
        let job = self.queue.retry_job(job_id).await?;

        info!(
            "Manual retry: job {} requeued for device {} (attempt {}, ceiling {})",
            job.id, job.device_id, job.retry_count, job.max_retries
        );

        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::QueueError;
    use crate::queue::RetrySettings;
    use serde_json::json;
    use std::path::PathBuf;

    async fn create_test_view() -> (HistoryView, Arc<QueueManager>) {
        let queue = Arc::new(
            QueueManager::new(PathBuf::from(":memory:"), RetrySettings::default())
                .await
                .unwrap(),
        );
        (HistoryView::new(queue.clone()), queue)
    }

    #[test]
    fn test_limit_is_clamped() {
        assert_eq!(JobFilter::default().effective_limit(), DEFAULT_HISTORY_LIMIT);
        let zero = JobFilter { limit: Some(0), ..Default::default() };
        assert_eq!(zero.effective_limit(), 1);
        let huge = JobFilter { limit: Some(10_000), ..Default::default() };
        assert_eq!(huge.effective_limit(), MAX_HISTORY_LIMIT);
    }

    #[tokio::test]
    async fn test_list_filters_by_device_and_status() {
        let (view, queue) = create_test_view().await;
        queue.submit("bar", json!({"n": 1}), None).await.unwrap();
        queue.submit("bar", json!({"n": 2}), None).await.unwrap();
        queue.submit("kitchen", json!({"n": 3}), None).await.unwrap();
        queue.claim_next("bar").await.unwrap();

        let bar = view
            .list(&JobFilter { device_id: Some("bar".into()), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(bar.len(), 2);
        assert!(bar.iter().all(|j| j.device_id == "bar"));

        let printing = view
            .list(&JobFilter { status: Some(JobStatus::Printing), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(printing.len(), 1);
        assert_eq!(printing[0].device_id, "bar");

        let limited = view
            .list(&JobFilter { limit: Some(1), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_job_stays_visible_with_error() {
        let (view, queue) = create_test_view().await;
        let job = queue.submit("bar", json!({"n": 1}), Some(0)).await.unwrap();
        queue.claim_next("bar").await.unwrap();
        queue.mark_failed(&job.id, Some("cutter error")).await.unwrap();

        let shown = view.get(&job.id).await.unwrap();
        assert_eq!(shown.status, JobStatus::Failed);
        assert!(shown.retries_exhausted());
        assert_eq!(shown.error_message.as_deref(), Some("cutter error"));
    }

    #[tokio::test]
    async fn test_retry_unknown_job() {
        let (view, _) = create_test_view().await;
        let err = view.retry("missing").await.unwrap_err();
        assert!(matches!(err, QueueError::JobNotFound(_)));
    }

    #[tokio::test]
    async fn test_subscriber_sees_manual_retry() {
        let (view, queue) = create_test_view().await;
        let job = queue.submit("bar", json!({"n": 1}), None).await.unwrap();
        queue.claim_next("bar").await.unwrap();
        queue.mark_failed(&job.id, None).await.unwrap();

        let mut events = view.subscribe();
        view.retry(&job.id).await.unwrap();

        let event = events.recv().await.unwrap();
        assert!(event.is_requeue());
        assert_eq!(event.job_id, job.id);
        assert_eq!(event.retry_count, 1);
    }
}
