/// Print job status strings as stored in the database.
/// Must match the CHECK constraint on `print_jobs.status`:
/// ('pending', 'printing', 'completed', 'failed')
pub const PENDING: &str = "pending";
pub const PRINTING: &str = "printing";
pub const COMPLETED: &str = "completed";
pub const FAILED: &str = "failed";

use crate::errors::QueueError;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of a print job.
///
/// ```text
/// pending  --poll claims-->         printing
/// printing --callback: success-->   completed   (terminal)
/// printing --callback: failure-->   failed
/// failed   --reconciler / manual--> pending     (retry_count += 1)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Printing,
    Completed,
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Pending,
        JobStatus::Printing,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => PENDING,
            JobStatus::Printing => PRINTING,
            JobStatus::Completed => COMPLETED,
            JobStatus::Failed => FAILED,
        }
    }

    /// Whether `self -> next` is an edge of the job state machine.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Printing)
                | (JobStatus::Printing, JobStatus::Completed)
                | (JobStatus::Printing, JobStatus::Failed)
                | (JobStatus::Failed, JobStatus::Pending)
        )
    }

    /// Statuses a printer may report through the status callback.
    pub fn is_reportable(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn is_terminal(self) -> bool {
        self == JobStatus::Completed
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            PENDING => Ok(JobStatus::Pending),
            PRINTING => Ok(JobStatus::Printing),
            COMPLETED => Ok(JobStatus::Completed),
            FAILED => Ok(JobStatus::Failed),
            _ => Err(QueueError::InvalidStatus(s.to_string())),
        }
    }
}

impl ToSql for JobStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for JobStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: QueueError| FromSqlError::Other(Box::new(e)))
    }
}
