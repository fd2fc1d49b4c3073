use crate::status::JobStatus;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Missing device_id")]
    MissingDeviceId,

    #[error("Invalid status: {0} (expected 'completed' or 'failed')")]
    InvalidStatus(String),

    #[error("Print job not found: {0}")]
    JobNotFound(String),

    #[error("Print job {job_id} is {current}, expected {expected}")]
    InvalidState {
        job_id: String,
        current: JobStatus,
        expected: JobStatus,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(#[from] tokio_rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl QueueError {
    /// Backend failures that the caller may retry on its own cadence.
    pub fn is_storage_failure(&self) -> bool {
        matches!(self, QueueError::Storage(_) | QueueError::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;
