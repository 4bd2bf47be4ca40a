//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::workflow::model::StepStatus;

/// Hard ceiling on iterations of one progression pass.
pub const DEFAULT_MAX_STEPS_PER_PASS: usize = 10;

/// Progression engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum iterations of one pass, so a misconfigured catalog still terminates.
    pub max_steps_per_pass: usize,
    /// Maximum number of instances progressing at the same time.
    pub max_concurrent_passes: usize,
    /// Upper bound on one step executor call.
    pub executor_timeout: Duration,
    /// How many times a pass is re-run after losing an optimistic-version race.
    pub conflict_retries: u32,
    /// What the gateway reports when an executor fails or times out.
    pub failure_policy: FailurePolicy,
    /// Interval of the pending inbound event sweep.
    pub event_process_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps_per_pass: DEFAULT_MAX_STEPS_PER_PASS,
            max_concurrent_passes: 8,
            executor_timeout: Duration::from_secs(120),
            conflict_retries: 3,
            failure_policy: FailurePolicy::default(),
            event_process_interval: Duration::from_secs(15),
        }
    }
}

impl EngineConfig {
    /// Build config from `HIRE_FLOW_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let failure_policy = FailurePolicy {
            on_error: status_from_env("HIRE_FLOW_EXECUTOR_ERROR_STATUS")?
                .unwrap_or(defaults.failure_policy.on_error),
            on_timeout: status_from_env("HIRE_FLOW_EXECUTOR_TIMEOUT_STATUS")?
                .unwrap_or(defaults.failure_policy.on_timeout),
        };

        let max_steps_per_pass = env_or("HIRE_FLOW_MAX_STEPS", defaults.max_steps_per_pass);
        if max_steps_per_pass == 0 {
            return Err(ConfigError::InvalidValue {
                key: "HIRE_FLOW_MAX_STEPS".into(),
                message: "must be at least 1".into(),
            });
        }

        Ok(Self {
            max_steps_per_pass,
            max_concurrent_passes: env_or(
                "HIRE_FLOW_MAX_CONCURRENT_PASSES",
                defaults.max_concurrent_passes,
            )
            .max(1),
            executor_timeout: Duration::from_secs(env_or(
                "HIRE_FLOW_EXECUTOR_TIMEOUT_SECS",
                defaults.executor_timeout.as_secs(),
            )),
            conflict_retries: env_or("HIRE_FLOW_CONFLICT_RETRIES", defaults.conflict_retries),
            failure_policy,
            event_process_interval: Duration::from_secs(env_or(
                "HIRE_FLOW_EVENT_INTERVAL_SECS",
                defaults.event_process_interval.as_secs(),
            )),
        })
    }
}

/// Status substituted for an executor result the gateway could not obtain.
///
/// Errors default to `approved` so informational steps do not stall the
/// pipeline; timeouts default to `error`, which parks the instance for an operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailurePolicy {
    pub on_error: StepStatus,
    pub on_timeout: StepStatus,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self {
            on_error: StepStatus::Approved,
            on_timeout: StepStatus::Error,
        }
    }
}

/// HTTP server and process-level settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub db_path: PathBuf,
    /// Optional JSON catalog seed loaded at startup.
    pub catalog_path: Option<PathBuf>,
    /// Directory for rolling log files; stderr only when unset.
    pub log_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            db_path: PathBuf::from("./data/hire-flow.db"),
            catalog_path: None,
            log_dir: None,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: env_or("HIRE_FLOW_PORT", defaults.port),
            db_path: std::env::var("HIRE_FLOW_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            catalog_path: std::env::var("HIRE_FLOW_CATALOG_PATH").ok().map(PathBuf::from),
            log_dir: std::env::var("HIRE_FLOW_LOG_DIR").ok().map(PathBuf::from),
        }
    }
}

/// Read and parse an env var, or return `default` when unset or unparsable.
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn status_from_env(key: &str) -> Result<Option<StepStatus>, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "approved" => Ok(Some(StepStatus::Approved)),
            "rejected" => Ok(Some(StepStatus::Rejected)),
            "error" => Ok(Some(StepStatus::Error)),
            other => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("expected approved, rejected or error, got '{other}'"),
            }),
        },
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_steps_per_pass, 10);
        assert_eq!(config.failure_policy.on_error, StepStatus::Approved);
        assert_eq!(config.failure_policy.on_timeout, StepStatus::Error);
    }

    #[test]
    fn env_or_falls_back_on_garbage() {
        // SAFETY: only this test touches this variable.
        unsafe { std::env::set_var("HIRE_FLOW_TEST_GARBAGE", "not-a-number") };
        assert_eq!(env_or("HIRE_FLOW_TEST_GARBAGE", 7_u32), 7);
        unsafe { std::env::remove_var("HIRE_FLOW_TEST_GARBAGE") };
    }

    #[test]
    fn status_from_env_rejects_unknown() {
        // SAFETY: only this test touches this variable.
        unsafe { std::env::set_var("HIRE_FLOW_TEST_STATUS", "maybe") };
        assert!(status_from_env("HIRE_FLOW_TEST_STATUS").is_err());
        unsafe { std::env::set_var("HIRE_FLOW_TEST_STATUS", "Rejected") };
        assert_eq!(
            status_from_env("HIRE_FLOW_TEST_STATUS").unwrap(),
            Some(StepStatus::Rejected)
        );
        unsafe { std::env::remove_var("HIRE_FLOW_TEST_STATUS") };
    }
}
