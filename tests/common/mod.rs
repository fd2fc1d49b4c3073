// Common test utilities and fixtures

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::{TimeZone, Utc};
use commissary_print_queue::api::{create_router, ApiState};
use commissary_print_queue::backoff::FixedPolicy;
use commissary_print_queue::clock::ManualClock;
use commissary_print_queue::queue::{QueueManager, RetrySettings};
use commissary_print_queue::telemetry::TelemetryCollector;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

/// Retry delay used by every harness queue
pub const RETRY_DELAY_SECS: i64 = 60;

/// Test harness builder
pub struct TestHarnessBuilder {
    settings: RetrySettings,
    temp_dir: Option<TempDir>,
}

#[allow(dead_code)]
impl TestHarnessBuilder {
    pub fn new() -> Self {
        Self {
            settings: RetrySettings::default(),
            temp_dir: None,
        }
    }

    pub fn with_settings(mut self, settings: RetrySettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_temp_dir(mut self, dir: TempDir) -> Self {
        self.temp_dir = Some(dir);
        self
    }

    pub async fn build(self) -> TestHarness {
        let db_path = match &self.temp_dir {
            Some(dir) => dir.path().join("test-queue.db"),
            None => PathBuf::from(":memory:"),
        };

        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
        ));
        let queue = Arc::new(
            QueueManager::new(db_path, self.settings)
                .await
                .expect("Failed to open test queue")
                .with_clock(clock.clone())
                .with_retry_policy(Arc::new(FixedPolicy(Duration::from_secs(
                    RETRY_DELAY_SECS as u64,
                )))),
        );
        let telemetry = Arc::new(TelemetryCollector::new());
        let router = create_router(ApiState::new(queue.clone(), telemetry.clone()));

        TestHarness {
            queue,
            clock,
            telemetry,
            router,
            _temp_dir: self.temp_dir,
        }
    }
}

pub struct TestHarness {
    pub queue: Arc<QueueManager>,
    pub clock: Arc<ManualClock>,
    pub telemetry: Arc<TelemetryCollector>,
    pub router: Router,
    _temp_dir: Option<TempDir>,
}

#[allow(dead_code)]
impl TestHarness {
    pub fn advance_secs(&self, secs: i64) {
        self.clock.advance(chrono::Duration::seconds(secs));
    }

    /// Send one request through the router and decode the JSON body.
    pub async fn send(
        &self,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        let request = match body {
            Some(json) => builder.body(Body::from(json.to_string())),
            None => builder.body(Body::empty()),
        }
        .unwrap();

        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    pub async fn submit(&self, device_id: &str, max_retries: Option<u32>) -> String {
        let mut body = serde_json::json!({
            "device_id": device_id,
            "job_data": create_test_receipt("R001-20260301-0042"),
        });
        if let Some(n) = max_retries {
            body["max_retries"] = n.into();
        }
        let (status, json) = self.send("POST", "/print-jobs", Some(body)).await;
        assert_eq!(status, StatusCode::OK, "submit failed: {json}");
        json["job_id"].as_str().unwrap().to_string()
    }

    pub async fn poll(&self, device_id: &str) -> serde_json::Value {
        let (status, json) = self
            .send("GET", &format!("/print-jobs?device_id={device_id}"), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        json
    }

    pub async fn report(
        &self,
        job_token: &str,
        status: &str,
        error: Option<&str>,
    ) -> (StatusCode, serde_json::Value) {
        self.send(
            "PUT",
            "/print-jobs",
            Some(serde_json::json!({ "jobToken": job_token, "status": status, "error": error })),
        )
        .await
    }
}

/// Create test receipt payload
pub fn create_test_receipt(order_number: &str) -> serde_json::Value {
    serde_json::json!({
        "order_number": order_number,
        "table_number": "T-05",
        "lines": [
            { "name": "Flat white", "quantity": 2, "price": 3.80 },
            { "name": "Croissant", "quantity": 1, "price": 2.60 }
        ],
        "total": 10.20
    })
}
