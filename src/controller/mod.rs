//! # Controller
//!
//! Controller declaration and management.
//!
//! - `builder`: The [`Controller`] builder and its [`Placement`]
//! - `dependency`: Ready-made dependency mappers
//! - `manager`: Registers controllers and supervises their pipelines
//! - `reconciler`: Traits implemented by controller authors and the [`Runtime`]
//! - `request`: Requests, custom events and requeue errors

pub mod builder;
pub mod dependency;
pub mod manager;
pub mod reconciler;
pub mod request;

pub use builder::{Controller, Hook, Placement};
pub use manager::Manager;
pub use reconciler::{CustomDependencyMapper, DependencyMapper, Initializer, Reconciler, Runtime};
pub use request::{requeue_after, Event, EventObject, MapperRequest, Request, RequeueAfter, Source};
