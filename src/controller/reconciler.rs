//! # Reconciler Seams
//!
//! Traits implemented by controller authors and the [`Runtime`] handed to
//! them on every call.
//!
//! Closures implement [`DependencyMapper`], [`CustomDependencyMapper`] and
//! [`Initializer`] directly, so simple mappers need no named type:
//!
//! ```rust
//! use controller_runtime::controller::{DependencyMapper, Request, Runtime};
//! use controller_runtime::resource::Resource;
//!
//! fn owner_of_album() -> impl DependencyMapper {
//!     |_rt: Runtime, res: Resource| async move {
//!         anyhow::Ok(res.owner.map(Request::new).into_iter().collect::<Vec<_>>())
//!     }
//! }
//! ```

use super::request::{Event, Request};
use crate::cache::ReadOnlyCache;
use crate::resource::{Resource, SharedResourceService};
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Everything a reconciler or mapper may touch.
///
/// `cache` is the controller's own read-only, cloning view; `client` talks to
/// the resource service and returns owned resources.
#[derive(Clone)]
pub struct Runtime {
    pub client: SharedResourceService,
    pub logger: tracing::Span,
    pub cache: Arc<dyn ReadOnlyCache>,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("logger", &self.logger)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Reconciler: Send + Sync {
    /// Converge the resource identified by `request`.
    ///
    /// Return [`RequeueAfter`](super::RequeueAfter) to retry after a fixed
    /// delay; any other error is retried with rate-limited backoff.
    async fn reconcile(&self, rt: &Runtime, request: Request) -> anyhow::Result<()>;
}

/// Runs once per pipeline start, before any watch is opened.
#[async_trait]
pub trait Initializer: Send + Sync {
    async fn initialize(&self, rt: &Runtime) -> anyhow::Result<()>;
}

/// Translates a change in a watched resource into requests for the managed type.
#[async_trait]
pub trait DependencyMapper: Send + Sync {
    async fn map(&self, rt: &Runtime, resource: Resource) -> anyhow::Result<Vec<Request>>;
}

/// Translates a custom [`Event`] into requests for the managed type.
#[async_trait]
pub trait CustomDependencyMapper: Send + Sync {
    async fn map(&self, rt: &Runtime, event: Event) -> anyhow::Result<Vec<Request>>;
}

#[async_trait]
impl<F, Fut> DependencyMapper for F
where
    F: Fn(Runtime, Resource) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Vec<Request>>> + Send + 'static,
{
    async fn map(&self, rt: &Runtime, resource: Resource) -> anyhow::Result<Vec<Request>> {
        self(rt.clone(), resource).await
    }
}

#[async_trait]
impl<F, Fut> CustomDependencyMapper for F
where
    F: Fn(Runtime, Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Vec<Request>>> + Send + 'static,
{
    async fn map(&self, rt: &Runtime, event: Event) -> anyhow::Result<Vec<Request>> {
        self(rt.clone(), event).await
    }
}

#[async_trait]
impl<F, Fut> Initializer for F
where
    F: Fn(Runtime) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn initialize(&self, rt: &Runtime) -> anyhow::Result<()> {
        self(rt.clone()).await
    }
}
