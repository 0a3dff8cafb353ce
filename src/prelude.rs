//! # Prelude
//!
//! Re-exports the types most controllers need.
//!
//! ```rust
//! use controller_runtime::prelude::*;
//! ```
//!
//! This brings into scope:
//! - Resource types and the resource service contract
//! - The controller builder, reconciler traits and the manager
//! - Cache indexes and the read-only cache view
//! - Runtime configuration

pub use crate::cache::{CacheError, Index, ReadOnlyCache};
pub use crate::config::RuntimeConfig;
pub use crate::controller::dependency::{map_owner, map_owner_filtered, replace_type};
pub use crate::controller::{
    requeue_after, Controller, CustomDependencyMapper, DependencyMapper, Event, EventObject,
    Initializer, Manager, Placement, Reconciler, Request, RequeueAfter, Runtime, Source,
};
pub use crate::resource::memory::InMemoryResourceService;
pub use crate::resource::{
    Condition, ConditionState, Id, Resource, ResourceError, ResourceService,
    SharedResourceService, Status, Tenancy, Type, WatchEvent,
};
pub use crate::runtime::{LeadershipSource, RaftLeadership, RunnerError};
