use crate::backoff::ExponentialPolicy;
use crate::errors::{QueueError, Result};
use crate::queue::RetrySettings;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

pub const CONFIG_PATH_ENV: &str = "PRINT_QUEUE_CONFIG";
pub const BIND_ADDR_ENV: &str = "PRINT_QUEUE_BIND_ADDR";
pub const DATABASE_ENV: &str = "PRINT_QUEUE_DATABASE";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub bind_addr: String,
    /// Falls back to the platform data directory when unset.
    pub database_path: Option<PathBuf>,
    /// Advertised to printers in every job-ready poll response.
    pub media_types: Vec<String>,
    pub callback_mode: CallbackMode,
    pub reconcile_interval_secs: u64,
    pub telemetry_report_interval_secs: u64,
    /// Daily rolling log files are written here when set.
    pub log_dir: Option<PathBuf>,
    /// Extra browser origins allowed by CORS besides localhost.
    pub cors_origins: Vec<String>,
    pub retry: RetryConfig,
}

/// How the status callback treats a `jobToken` that matches no job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallbackMode {
    /// Answer `404 job_not_found`.
    #[default]
    Strict,
    /// Answer with the success shape and log a warning.
    Lenient,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub enabled: bool,
    pub max_retries: u32,
    pub batch_size: u32,
    pub claim_timeout_secs: Option<u64>,
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
    pub factor: f32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 3,
            batch_size: 100,
            claim_timeout_secs: Some(300),
            base_delay_secs: 2,
            max_delay_secs: 300,
            factor: 2.0,
        }
    }
}

impl RetryConfig {
    /// Settings written to a fresh database. Later changes go through the
    /// settings API and live in the database, not in this file.
    pub fn initial_settings(&self) -> RetrySettings {
        RetrySettings {
            enabled: self.enabled,
            default_max_retries: self.max_retries,
            batch_size: self.batch_size,
            claim_timeout_secs: self.claim_timeout_secs,
        }
    }

    pub fn policy(&self) -> ExponentialPolicy {
        ExponentialPolicy::new(
            Duration::from_secs(self.base_delay_secs),
            Duration::from_secs(self.max_delay_secs),
            self.factor,
        )
    }
}

impl AppConfig {
    /// Load from `$PRINT_QUEUE_CONFIG` (if set), then apply env overrides.
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var_os(CONFIG_PATH_ENV) {
            Some(path) => Self::from_path(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!("Config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&raw)
            .map_err(|e| QueueError::Config(format!("{}: {}", path.display(), e)))?;

        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var(BIND_ADDR_ENV) {
            if !addr.trim().is_empty() {
                self.bind_addr = addr;
            }
        }
        if let Some(db) = std::env::var_os(DATABASE_ENV) {
            if !db.is_empty() {
                self.database_path = Some(PathBuf::from(db));
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.bind_addr.trim().is_empty() {
            return Err(QueueError::Config("bind_addr must not be empty".to_string()));
        }
        if self.media_types.is_empty() {
            return Err(QueueError::Config("media_types must list at least one type".to_string()));
        }
        if self.reconcile_interval_secs == 0 || self.telemetry_report_interval_secs == 0 {
            return Err(QueueError::Config(
                "reconcile_interval_secs and telemetry_report_interval_secs must be positive"
                    .to_string(),
            ));
        }
        self.retry
            .initial_settings()
            .validate()
            .map_err(|e| QueueError::Config(e.to_string()))
    }

    pub fn database_path(&self) -> PathBuf {
        if let Some(path) = &self.database_path {
            return path.clone();
        }

        let data_dir = if cfg!(target_os = "macos") {
            dirs::home_dir()
                .map(|p| p.join("Library/Application Support/commissary-print-queue"))
                .unwrap_or_else(|| PathBuf::from("."))
        } else {
            dirs::data_dir()
                .map(|p| p.join("commissary-print-queue"))
                .unwrap_or_else(|| PathBuf::from("."))
        };

        data_dir.join("print-queue.db")
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8043".to_string(),
            database_path: None,
            media_types: vec!["application/vnd.star.starprnt".to_string()],
            callback_mode: CallbackMode::Strict,
            reconcile_interval_secs: 30,
            telemetry_report_interval_secs: 300,
            log_dir: None,
            cors_origins: Vec::new(),
            retry: RetryConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::RetryPolicy;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        config.validate().unwrap();
        assert_eq!(config.callback_mode, CallbackMode::Strict);
        assert_eq!(config.retry.initial_settings(), RetrySettings::default());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{ "callback_mode": "lenient", "retry": { "max_retries": 5 } }"#,
        )
        .unwrap();

        let config = AppConfig::from_path(&path).unwrap();
        assert_eq!(config.callback_mode, CallbackMode::Lenient);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.base_delay_secs, 2);
        assert_eq!(config.bind_addr, "127.0.0.1:8043");
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let config = AppConfig::from_path(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config.reconcile_interval_secs, 30);
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = AppConfig::from_path(&path).unwrap_err();
        assert!(matches!(err, QueueError::Config(_)));
    }

    #[test]
    fn test_validation_rejects_zero_batch() {
        let mut config = AppConfig::default();
        config.retry.batch_size = 0;
        assert!(matches!(config.validate(), Err(QueueError::Config(_))));
    }

    #[test]
    fn test_policy_uses_configured_delays() {
        let retry = RetryConfig {
            base_delay_secs: 5,
            max_delay_secs: 20,
            ..RetryConfig::default()
        };
        let policy = retry.policy();
        assert_eq!(policy.delay_for(0), Duration::from_secs(5));
        assert_eq!(policy.delay_for(5), Duration::from_secs(20));
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("queue.db");
        std::env::remove_var(CONFIG_PATH_ENV);
        std::env::set_var(BIND_ADDR_ENV, "0.0.0.0:9100");
        std::env::set_var(DATABASE_ENV, &db);

        let config = AppConfig::load().unwrap();

        std::env::remove_var(BIND_ADDR_ENV);
        std::env::remove_var(DATABASE_ENV);

        assert_eq!(config.bind_addr, "0.0.0.0:9100");
        assert_eq!(config.database_path(), db);
    }

    #[test]
    #[serial]
    fn test_load_reads_config_path_env() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "reconcile_interval_secs": 5 }"#).unwrap();
        std::env::set_var(CONFIG_PATH_ENV, &path);

        let config = AppConfig::load();

        std::env::remove_var(CONFIG_PATH_ENV);
        assert_eq!(config.unwrap().reconcile_interval_secs, 5);
    }
}
