//! # Controller Runtime
//!
//! Runtime for controllers that converge typed, tenant-scoped, versioned
//! resources toward their desired state.
//!
//! A [`Controller`](controller::Controller) declares the type it manages,
//! the types it watches and its reconciler. The [`Manager`](controller::Manager)
//! supervises one pipeline per controller: a fresh indexed cache primed from
//! watch snapshots, dependency mappers feeding a de-duplicating, rate-limited
//! work queue, and a reconcile loop. Pipelines run only while their lease is
//! held and are restarted from scratch with crash-loop backoff when they fail.
//!
//! ## Modules
//!
//! - `cache`: Indexed per-controller resource cache and named queries
//! - `config`: Environment-driven runtime configuration
//! - `constants`: Shared defaults
//! - `controller`: Controller builder, reconciler seams and the manager
//! - `observability`: Logging and Prometheus metrics
//! - `queue`: Work queue, defer queue and rate limiters
//! - `resource`: Resource model, service contract and in-memory service
//! - `runtime`: Leases, supervisor and the controller pipeline runner
//! - `server`: Metrics and probe endpoints

pub mod cache;
pub mod config;
pub mod constants;
pub mod controller;
pub mod observability;
pub mod prelude;
pub mod queue;
pub mod resource;
pub mod runtime;
pub mod server;
