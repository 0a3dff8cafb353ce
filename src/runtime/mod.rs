//! # Runtime
//!
//! Lease-gated supervision of controller pipelines.
//!
//! - `backoff`: Crash-loop restart delays
//! - `error_policy`: Pipeline errors and reconcile retry decisions
//! - `lease`: Leadership and the leases derived from it
//! - `runner`: One pipeline run for one controller
//! - `supervisor`: Restarts a pipeline while its lease is held

pub mod backoff;
pub mod error_policy;
pub mod lease;
pub mod runner;
pub mod supervisor;

pub use backoff::RestartBackoff;
pub use error_policy::{RetryAction, RunnerError};
pub use lease::{EternalLease, LeaderLease, Lease, LeadershipSource, RaftLeadership};
pub use runner::{ControllerRunner, RunnerSettings};
pub use supervisor::{Supervisor, Task};
