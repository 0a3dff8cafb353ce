//! # Controller Builder
//!
//! Declares what a controller manages, what it watches and how it
//! reconciles. A `Controller` is inert until registered with a
//! [`Manager`](super::Manager).

use super::reconciler::{CustomDependencyMapper, DependencyMapper, Initializer, Reconciler, Runtime};
use super::request::Source;
use crate::cache::{Index, QueryFn, ReadOnlyCache};
use crate::resource::{Resource, Type};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Hook run with the pipeline's runtime on start or stop.
pub type Hook = Arc<dyn Fn(&Runtime) + Send + Sync>;

/// Where a controller runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Placement {
    /// Only on the current leader.
    #[default]
    Singleton,
    /// On every server, regardless of leadership.
    EachServer,
}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Singleton => f.write_str("singleton"),
            Self::EachServer => f.write_str("each-server"),
        }
    }
}

/// Watch on a dependent type.
#[derive(Clone)]
pub(crate) struct Watch {
    pub(crate) r#type: Type,
    pub(crate) mapper: Arc<dyn DependencyMapper>,
    pub(crate) indexes: Vec<Index>,
}

/// Watch on an application-defined event channel.
#[derive(Clone)]
pub(crate) struct CustomWatch {
    pub(crate) source: Source,
    pub(crate) mapper: Arc<dyn CustomDependencyMapper>,
}

#[derive(Clone)]
pub struct Controller {
    name: String,
    managed_type: Type,
    managed_indexes: Vec<Index>,
    watches: Vec<Watch>,
    custom_watches: Vec<CustomWatch>,
    queries: Vec<(String, QueryFn)>,
    reconciler: Option<Arc<dyn Reconciler>>,
    initializer: Option<Arc<dyn Initializer>>,
    backoff: Option<(Duration, Duration)>,
    force_reconcile_every: Option<Duration>,
    placement: Placement,
    notify_start: Option<Hook>,
    notify_stop: Option<Hook>,
}

impl Controller {
    /// New controller for `managed_type`, with extra cache indexes on it.
    pub fn new(
        name: impl Into<String>,
        managed_type: Type,
        indexes: impl IntoIterator<Item = Index>,
    ) -> Self {
        Self {
            name: name.into(),
            managed_type,
            managed_indexes: indexes.into_iter().collect(),
            watches: Vec::new(),
            custom_watches: Vec::new(),
            queries: Vec::new(),
            reconciler: None,
            initializer: None,
            backoff: None,
            force_reconcile_every: None,
            placement: Placement::default(),
            notify_start: None,
            notify_stop: None,
        }
    }

    /// Watch `watched_type`; each change goes through `mapper`. Watching a
    /// type again replaces the earlier watch.
    #[must_use]
    pub fn with_watch(
        mut self,
        watched_type: Type,
        mapper: impl DependencyMapper + 'static,
        indexes: impl IntoIterator<Item = Index>,
    ) -> Self {
        let watch = Watch {
            r#type: watched_type,
            mapper: Arc::new(mapper),
            indexes: indexes.into_iter().collect(),
        };
        match self.watches.iter_mut().find(|w| w.r#type == watch.r#type) {
            Some(existing) => *existing = watch,
            None => self.watches.push(watch),
        }
        self
    }

    #[must_use]
    pub fn with_custom_watch(
        mut self,
        source: Source,
        mapper: impl CustomDependencyMapper + 'static,
    ) -> Self {
        self.custom_watches.push(CustomWatch {
            source,
            mapper: Arc::new(mapper),
        });
        self
    }

    /// Register a named query callable through `Runtime::cache`.
    #[must_use]
    pub fn with_query<F>(mut self, name: impl Into<String>, query: F) -> Self
    where
        F: Fn(&dyn ReadOnlyCache, &[&str]) -> anyhow::Result<Vec<Resource>> + Send + Sync + 'static,
    {
        self.queries.push((name.into(), Arc::new(query)));
        self
    }

    #[must_use]
    pub fn with_reconciler(mut self, reconciler: impl Reconciler + 'static) -> Self {
        self.reconciler = Some(Arc::new(reconciler));
        self
    }

    #[must_use]
    pub fn with_initializer(mut self, initializer: impl Initializer + 'static) -> Self {
        self.initializer = Some(Arc::new(initializer));
        self
    }

    /// Rate limiter bounds for failed reconciles.
    #[must_use]
    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff = Some((base, max));
        self
    }

    /// Re-reconcile every resource this often after a successful reconcile.
    /// `Duration::ZERO` disables it.
    #[must_use]
    pub fn with_force_reconcile_every(mut self, every: Duration) -> Self {
        self.force_reconcile_every = Some(every);
        self
    }

    #[must_use]
    pub fn with_placement(mut self, placement: Placement) -> Self {
        self.placement = placement;
        self
    }

    #[must_use]
    pub fn with_notify_start<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Runtime) + Send + Sync + 'static,
    {
        self.notify_start = Some(Arc::new(hook));
        self
    }

    #[must_use]
    pub fn with_notify_stop<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Runtime) + Send + Sync + 'static,
    {
        self.notify_stop = Some(Arc::new(hook));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn managed_type(&self) -> &Type {
        &self.managed_type
    }

    pub fn watched_types(&self) -> impl Iterator<Item = &Type> {
        self.watches.iter().map(|w| &w.r#type)
    }

    pub fn placement(&self) -> Placement {
        self.placement
    }

    /// Configured backoff, if `with_backoff` was called.
    pub fn backoff(&self) -> Option<(Duration, Duration)> {
        self.backoff
    }

    pub fn force_reconcile_every(&self) -> Option<Duration> {
        self.force_reconcile_every
    }

    pub fn has_reconciler(&self) -> bool {
        self.reconciler.is_some()
    }

    pub(crate) fn managed_indexes(&self) -> &[Index] {
        &self.managed_indexes
    }

    pub(crate) fn watches(&self) -> &[Watch] {
        &self.watches
    }

    pub(crate) fn custom_watches(&self) -> &[CustomWatch] {
        &self.custom_watches
    }

    pub(crate) fn queries(&self) -> &[(String, QueryFn)] {
        &self.queries
    }

    pub(crate) fn reconciler(&self) -> Option<&Arc<dyn Reconciler>> {
        self.reconciler.as_ref()
    }

    pub(crate) fn initializer(&self) -> Option<&Arc<dyn Initializer>> {
        self.initializer.as_ref()
    }

    pub(crate) fn notify_start(&self) -> Option<&Hook> {
        self.notify_start.as_ref()
    }

    pub(crate) fn notify_stop(&self) -> Option<&Hook> {
        self.notify_stop.as_ref()
    }
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("name", &self.name)
            .field("managed_type", &self.managed_type.to_string())
            .field(
                "watched_types",
                &self.watched_types().map(ToString::to_string).collect::<Vec<_>>(),
            )
            .field("custom_watches", &self.custom_watches.len())
            .field("placement", &self.placement)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let watched = self
            .watched_types()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        let (base, max) = self.backoff.unwrap_or((
            Duration::from_millis(crate::constants::DEFAULT_BASE_BACKOFF_MS),
            Duration::from_millis(crate::constants::DEFAULT_MAX_BACKOFF_MS),
        ));
        write!(
            f,
            "<Controller managed_type={}, watched_types=[{}], backoff=<base={:?}, max={:?}>, placement={}>",
            self.managed_type, watched, base, max, self.placement
        )
    }
}
