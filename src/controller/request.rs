//! Work items flowing through controller queues.

use crate::constants::DEFAULT_SOURCE_CAPACITY;
use crate::queue::QueueItem;
use crate::resource::{Id, Resource};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

/// Ask the controller to reconcile the resource with this id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Request {
    pub id: Id,
}

impl Request {
    pub fn new(id: Id) -> Self {
        Self { id }
    }
}

impl QueueItem for Request {
    fn key(&self) -> String {
        self.id.key()
    }
}

/// Returned (via `anyhow`) from a reconciler to retry after exactly this
/// delay instead of the rate limiter's escalating backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("requeue after {0:?}")]
pub struct RequeueAfter(pub Duration);

/// Shorthand for `Err(RequeueAfter(delay).into())`.
pub fn requeue_after(delay: Duration) -> anyhow::Error {
    RequeueAfter(delay).into()
}

/// A changed watched resource waiting for its dependency mapper.
#[derive(Debug, Clone, PartialEq)]
pub struct MapperRequest {
    pub resource: Resource,
}

impl QueueItem for MapperRequest {
    fn key(&self) -> String {
        self.resource.id.key()
    }
}

/// Application-defined object delivered through a custom [`Source`].
pub trait EventObject: Any + Send + Sync {
    /// De-duplication key for events carrying this object.
    fn key(&self) -> String;
}

#[derive(Clone)]
pub struct Event {
    key: String,
    obj: Arc<dyn Any + Send + Sync>,
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event").field("key", &self.key).finish_non_exhaustive()
    }
}

impl Event {
    pub fn new<T: EventObject>(obj: T) -> Self {
        Self {
            key: obj.key(),
            obj: Arc::new(obj),
        }
    }

    pub fn downcast_ref<T: EventObject>(&self) -> Option<&T> {
        self.obj.downcast_ref::<T>()
    }
}

impl QueueItem for Event {
    fn key(&self) -> String {
        self.key.clone()
    }
}

/// Receiving end of a custom event channel.
///
/// Cloning shares the same receiver; only one pipeline drains it at a time.
#[derive(Clone)]
pub struct Source {
    pub(crate) rx: Arc<Mutex<mpsc::Receiver<Event>>>,
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Source").finish_non_exhaustive()
    }
}

impl Source {
    pub fn new(rx: mpsc::Receiver<Event>) -> Self {
        Self {
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    /// A sender and the source it feeds.
    pub fn channel() -> (mpsc::Sender<Event>, Self) {
        Self::with_capacity(DEFAULT_SOURCE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> (mpsc::Sender<Event>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self::new(rx))
    }
}
