//! Receipt print job queue: printers poll for work over HTTP, claim it
//! atomically, and report the outcome; failed jobs are retried with backoff.

pub mod api;
pub mod backoff;
pub mod clock;
pub mod config;
pub mod errors;
pub mod history;
pub mod queue;
pub mod reconciler;
pub mod sentry_init;
pub mod status;
pub mod telemetry;
