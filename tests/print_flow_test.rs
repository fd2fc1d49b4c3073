// Integration tests for end-to-end print flow over HTTP

mod common;

use axum::http::StatusCode;
use commissary_print_queue::reconciler::Reconciler;
use common::{TestHarnessBuilder, RETRY_DELAY_SECS};
use pretty_assertions::assert_eq;
use serde_json::json;

#[tokio::test]
async fn test_paper_jam_then_retry_prints() {
    let h = TestHarnessBuilder::new().build().await;
    let reconciler = Reconciler::new(h.queue.clone());
    let job_id = h.submit("D1", None).await;

    let envelope = h.poll("D1").await;
    assert_eq!(envelope["jobReady"], true);
    assert_eq!(envelope["jobToken"], job_id);
    assert_eq!(envelope["request"]["order_number"], "R001-20260301-0042");

    let (status, body) = h.report(&job_id, "failed", Some("paper jam")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "success": true }));

    // Failed jobs are invisible to polls until requeued
    assert_eq!(h.poll("D1").await, json!({ "jobReady": false }));

    let (_, job) = h.send("GET", &format!("/print-jobs/history/{job_id}"), None).await;
    assert_eq!(job["status"], "failed");
    assert_eq!(job["error_message"], "paper jam");

    // Not yet due
    assert_eq!(reconciler.run_once().await.unwrap().retried, 0);

    h.advance_secs(RETRY_DELAY_SECS);
    assert_eq!(reconciler.run_once().await.unwrap().retried, 1);

    let envelope = h.poll("D1").await;
    assert_eq!(envelope["jobToken"], job_id);

    let (status, _) = h.report(&job_id, "completed", None).await;
    assert_eq!(status, StatusCode::OK);

    let (_, job) = h.send("GET", &format!("/print-jobs/history/{job_id}"), None).await;
    assert_eq!(job["status"], "completed");
    assert_eq!(job["retry_count"], 1);
    assert!(job["printed_at"].is_string());
    assert!(job["error_message"].is_null());
}

#[tokio::test]
async fn test_ceiling_then_manual_retry() {
    let h = TestHarnessBuilder::new().build().await;
    let reconciler = Reconciler::new(h.queue.clone());
    let job_id = h.submit("D1", Some(1)).await;

    h.poll("D1").await;
    h.report(&job_id, "failed", Some("cover open")).await;
    h.advance_secs(RETRY_DELAY_SECS);
    assert_eq!(reconciler.run_once().await.unwrap().retried, 1);

    h.poll("D1").await;
    h.report(&job_id, "failed", Some("cover open")).await;
    h.advance_secs(RETRY_DELAY_SECS);

    let summary = reconciler.run_once().await.unwrap();
    assert_eq!(summary.retried, 0);
    assert_eq!(summary.skipped, vec![job_id.clone()]);
    assert_eq!(h.poll("D1").await, json!({ "jobReady": false }));

    let (status, job) = h
        .send("POST", &format!("/print-jobs/history/{job_id}/retry"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(job["status"], "pending");
    assert_eq!(job["retry_count"], 2);
    assert_eq!(job["max_retries"], 1);

    assert_eq!(h.poll("D1").await["jobToken"], job_id);
}

#[tokio::test]
async fn test_manual_retry_rejects_non_failed_job() {
    let h = TestHarnessBuilder::new().build().await;
    let job_id = h.submit("D1", None).await;

    let (status, body) = h
        .send("POST", &format!("/print-jobs/history/{job_id}/retry"), None)
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "invalid_state");

    let (status, _) = h.send("POST", "/print-jobs/history/ghost/retry", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_devices_only_see_their_own_jobs() {
    let h = TestHarnessBuilder::new().build().await;
    let bar = h.submit("bar-printer", None).await;
    let kitchen = h.submit("kitchen-printer", None).await;

    assert_eq!(h.poll("kitchen-printer").await["jobToken"], kitchen);
    assert_eq!(h.poll("kitchen-printer").await, json!({ "jobReady": false }));
    assert_eq!(h.poll("bar-printer").await["jobToken"], bar);
}

#[tokio::test]
async fn test_jobs_are_handed_out_oldest_first() {
    let h = TestHarnessBuilder::new().build().await;
    let mut submitted = Vec::new();
    for _ in 0..3 {
        submitted.push(h.submit("D1", None).await);
        h.advance_secs(1);
    }

    let mut claimed = Vec::new();
    for _ in 0..3 {
        claimed.push(h.poll("D1").await["jobToken"].as_str().unwrap().to_string());
    }

    assert_eq!(claimed, submitted);
}

#[tokio::test]
async fn test_history_filters_by_status_and_device() {
    let h = TestHarnessBuilder::new().build().await;
    let done = h.submit("D1", None).await;
    h.submit("D1", None).await;
    h.submit("D2", None).await;

    h.poll("D1").await;
    h.report(&done, "completed", None).await;

    let (_, jobs) = h.send("GET", "/print-jobs/history?device_id=D1", None).await;
    assert_eq!(jobs.as_array().unwrap().len(), 2);

    let (_, jobs) = h
        .send("GET", "/print-jobs/history?status=completed", None)
        .await;
    let jobs = jobs.as_array().unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0]["id"], done);

    let (_, jobs) = h.send("GET", "/print-jobs/history?limit=1", None).await;
    assert_eq!(jobs.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_completion_before_claim_is_rejected() {
    let h = TestHarnessBuilder::new().build().await;
    let job_id = h.submit("D1", None).await;

    let (status, body) = h.report(&job_id, "completed", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "invalid_state");

    let (_, stats) = h.send("GET", "/api/queue/stats", None).await;
    assert_eq!(stats["pending"], 1);
}
