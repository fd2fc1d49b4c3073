use once_cell::sync::Lazy;
use regex::Regex;
use sentry::{ClientInitGuard, ClientOptions};
use std::env;
use std::sync::Arc;
use tracing::info;

// Receipt payloads and printer error text can carry customer details
static EMAIL_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b")
        .expect("Invalid email regex pattern")
});
static PHONE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\+?[1-9]\d{6,14}").expect("Invalid phone regex pattern")
});
static UUID_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}")
        .expect("Invalid UUID regex pattern")
});
static BEARER_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)bearer\s+[A-Za-z0-9._~+/=-]+").expect("Invalid bearer regex pattern")
});

/// Initialize Sentry crash reporting
///
/// # Environment Variables
/// - `SENTRY_DSN`: Sentry Data Source Name (reporting is off without it)
/// - `SENTRY_ENVIRONMENT`: Environment name (default: "development")
/// - `SENTRY_RELEASE`: Release version (default: from Cargo.toml)
/// - `SENTRY_TRACES_SAMPLE_RATE`: Performance monitoring sample rate (default: 0.1)
///
/// The returned guard must be kept alive for the lifetime of the process.
pub fn init() -> Option<ClientInitGuard> {
    let dsn = match env::var("SENTRY_DSN").ok() {
        Some(d) if !d.is_empty() => d,
        _ => {
            info!("Sentry DSN not configured - crash reporting disabled");
            return None;
        }
    };

    let environment = env::var("SENTRY_ENVIRONMENT").unwrap_or_else(|_| "development".to_string());
    let release = env::var("SENTRY_RELEASE").unwrap_or_else(|_| {
        format!("{}@{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
    });
    let traces_sample_rate = env::var("SENTRY_TRACES_SAMPLE_RATE")
        .ok()
        .and_then(|s| s.parse::<f32>().ok())
        .unwrap_or(0.1);

    let guard = sentry::init((
        dsn,
        ClientOptions {
            release: Some(release.into()),
            environment: Some(environment.into()),
            traces_sample_rate,
            attach_stacktrace: true,
            send_default_pii: false,
            before_send: Some(Arc::new(before_send_filter)),
            ..Default::default()
        },
    ));

    info!(
        "Sentry crash reporting initialized (environment: {})",
        guard.options().environment.as_deref().unwrap_or("unknown")
    );

    Some(guard)
}

fn before_send_filter(
    mut event: sentry::protocol::Event<'static>,
) -> Option<sentry::protocol::Event<'static>> {
    if let Some(message) = event.message.as_mut() {
        *message = scrub(message);
    }

    for exception in &mut event.exception.values {
        if let Some(value) = exception.value.as_mut() {
            *value = scrub(value);
        }
    }

    for breadcrumb in &mut event.breadcrumbs.values {
        if let Some(message) = breadcrumb.message.as_mut() {
            *message = scrub(message);
        }
    }

    event.tags.insert("service_version".into(), env!("CARGO_PKG_VERSION").into());
    event.tags.insert("platform".into(), std::env::consts::OS.into());

    Some(event)
}

/// Redact personal data and credentials from free text.
pub fn scrub(message: &str) -> String {
    let mut cleaned = EMAIL_REGEX.replace_all(message, "[EMAIL_REDACTED]").to_string();

    // UUIDs before phone numbers; the phone pattern would eat their digit runs
    cleaned = UUID_REGEX.replace_all(&cleaned, "[UUID_REDACTED]").to_string();
    cleaned = BEARER_REGEX.replace_all(&cleaned, "[TOKEN_REDACTED]").to_string();
    cleaned = PHONE_REGEX.replace_all(&cleaned, "[PHONE_REDACTED]").to_string();

    cleaned
}

fn anonymize(id: &str) -> String {
    format!("{:x}", md5::compute(id))
}

/// Report a printer-side failure. Job and device ids are hashed.
pub fn capture_print_job_failure(job_id: &str, device_id: &str, error: &str, retry_count: u32) {
    sentry::with_scope(
        |scope| {
            scope.set_tag("event_type", "print_job_failure");
            scope.set_tag("device_id_hash", anonymize(device_id));
            scope.set_tag("retry_count", retry_count.to_string());
            scope.set_context(
                "print_job",
                sentry::protocol::Context::Other(sentry::protocol::Map::from_iter(vec![(
                    "job_id_hash".to_string(),
                    anonymize(job_id).into(),
                )])),
            );
        },
        || {
            sentry::capture_message(
                &format!("Print job failed: {}", scrub(error)),
                sentry::Level::Warning,
            );
        },
    );
}
