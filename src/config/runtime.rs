//! # Runtime Configuration
//!
//! Manager-level settings loaded from environment variables.

use std::time::Duration;

/// Manager-level configuration
///
/// All settings have defaults from [`crate::constants`] and can be overridden
/// via environment variables.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Base delay of each controller's reconcile rate limiter (milliseconds)
    /// Used when a controller does not call `with_backoff`
    pub base_backoff_ms: u64,
    /// Cap of each controller's reconcile rate limiter (milliseconds)
    pub max_backoff_ms: u64,
    /// Defer queue heartbeat (milliseconds)
    pub defer_queue_heartbeat_ms: u64,
    /// Minimum pipeline lifetime before an exit is treated as a normal stop (milliseconds)
    pub flap_threshold_ms: u64,
    /// Supervisor crash-loop backoff floor (milliseconds)
    pub supervisor_min_backoff_ms: u64,
    /// Supervisor crash-loop backoff cap (milliseconds)
    pub supervisor_max_backoff_ms: u64,
    /// Supervisor backoff jitter (percent either side)
    pub supervisor_jitter_percent: u64,
    /// Forced reconcile period for controllers that do not set one (seconds, 0 disables)
    pub force_reconcile_every_secs: u64,
    /// Global log filter (ERROR, WARN, INFO, DEBUG, TRACE or an EnvFilter directive)
    pub log_level: String,
    /// Log format (json, text)
    pub log_format: String,
    /// Port of the metrics and probe server
    pub metrics_port: u16,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        use crate::constants::*;
        Self {
            base_backoff_ms: DEFAULT_BASE_BACKOFF_MS,
            max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
            defer_queue_heartbeat_ms: DEFAULT_DEFER_QUEUE_HEARTBEAT_MS,
            flap_threshold_ms: DEFAULT_FLAP_THRESHOLD_MS,
            supervisor_min_backoff_ms: DEFAULT_SUPERVISOR_MIN_BACKOFF_MS,
            supervisor_max_backoff_ms: DEFAULT_SUPERVISOR_MAX_BACKOFF_MS,
            supervisor_jitter_percent: DEFAULT_SUPERVISOR_JITTER_PERCENT,
            force_reconcile_every_secs: DEFAULT_FORCE_RECONCILE_EVERY_SECS,
            log_level: "INFO".to_string(),
            log_format: "json".to_string(),
            metrics_port: DEFAULT_METRICS_PORT,
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        use crate::constants::*;
        Self {
            base_backoff_ms: env_var_or_default("CONTROLLER_BASE_BACKOFF_MS", DEFAULT_BASE_BACKOFF_MS),
            max_backoff_ms: env_var_or_default("CONTROLLER_MAX_BACKOFF_MS", DEFAULT_MAX_BACKOFF_MS),
            defer_queue_heartbeat_ms: env_var_or_default(
                "DEFER_QUEUE_HEARTBEAT_MS",
                DEFAULT_DEFER_QUEUE_HEARTBEAT_MS,
            ),
            flap_threshold_ms: env_var_or_default(
                "SUPERVISOR_FLAP_THRESHOLD_MS",
                DEFAULT_FLAP_THRESHOLD_MS,
            ),
            supervisor_min_backoff_ms: env_var_or_default(
                "SUPERVISOR_MIN_BACKOFF_MS",
                DEFAULT_SUPERVISOR_MIN_BACKOFF_MS,
            ),
            supervisor_max_backoff_ms: env_var_or_default(
                "SUPERVISOR_MAX_BACKOFF_MS",
                DEFAULT_SUPERVISOR_MAX_BACKOFF_MS,
            ),
            supervisor_jitter_percent: env_var_or_default(
                "SUPERVISOR_BACKOFF_JITTER_PERCENT",
                DEFAULT_SUPERVISOR_JITTER_PERCENT,
            ),
            force_reconcile_every_secs: env_var_or_default(
                "FORCE_RECONCILE_EVERY_SECS",
                DEFAULT_FORCE_RECONCILE_EVERY_SECS,
            ),
            log_level: env_var_or_default_str("LOG_LEVEL", "INFO"),
            log_format: env_var_or_default_str("LOG_FORMAT", "json"),
            metrics_port: env_var_or_default("METRICS_PORT", DEFAULT_METRICS_PORT),
        }
    }

    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn defer_queue_heartbeat(&self) -> Duration {
        Duration::from_millis(self.defer_queue_heartbeat_ms)
    }

    pub fn flap_threshold(&self) -> Duration {
        Duration::from_millis(self.flap_threshold_ms)
    }

    pub fn supervisor_min_backoff(&self) -> Duration {
        Duration::from_millis(self.supervisor_min_backoff_ms)
    }

    pub fn supervisor_max_backoff(&self) -> Duration {
        Duration::from_millis(self.supervisor_max_backoff_ms)
    }

    /// Forced reconcile period; `Duration::ZERO` when disabled
    pub fn force_reconcile_every(&self) -> Duration {
        Duration::from_secs(self.force_reconcile_every_secs)
    }
}

/// Read environment variable or return default value
fn env_var_or_default<T: std::str::FromStr>(key: &str, default: T) -> T
where
    <T as std::str::FromStr>::Err: std::fmt::Debug,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Read environment variable as string or return default
fn env_var_or_default_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}
