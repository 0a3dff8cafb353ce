//! # Constants
//!
//! Shared defaults for the controller runtime.
//!
//! Most of these can be overridden through [`RuntimeConfig`](crate::config::RuntimeConfig)
//! environment variables.

/// Default HTTP server port for metrics and health probes
pub const DEFAULT_METRICS_PORT: u16 = 5000;

/// Default base delay of a controller's reconcile rate limiter (milliseconds)
pub const DEFAULT_BASE_BACKOFF_MS: u64 = 5;

/// Default cap of a controller's reconcile rate limiter (milliseconds)
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 1_000_000;

/// Default defer queue heartbeat (milliseconds)
/// Wakes the deferral loop even when no timer is due
pub const DEFAULT_DEFER_QUEUE_HEARTBEAT_MS: u64 = 10_000;

/// Minimum pipeline lifetime before an exit counts as a normal stop (milliseconds)
pub const DEFAULT_FLAP_THRESHOLD_MS: u64 = 2_000;

/// Supervisor crash-loop backoff floor (milliseconds)
pub const DEFAULT_SUPERVISOR_MIN_BACKOFF_MS: u64 = 500;

/// Supervisor crash-loop backoff cap (milliseconds)
pub const DEFAULT_SUPERVISOR_MAX_BACKOFF_MS: u64 = 60_000;

/// Jitter applied to supervisor backoff, as a percentage either side
pub const DEFAULT_SUPERVISOR_JITTER_PERCENT: u64 = 25;

/// Default forced reconcile period (seconds); 0 disables it
pub const DEFAULT_FORCE_RECONCILE_EVERY_SECS: u64 = 8 * 60 * 60;

/// Maximum share of the forced reconcile period removed as jitter
pub const FORCE_RECONCILE_JITTER_PERCENT: u64 = 20;

/// Capacity of the channel behind a custom event [`Source`](crate::controller::Source)
pub const DEFAULT_SOURCE_CAPACITY: usize = 64;
