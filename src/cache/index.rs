//! Index definitions for the resource cache.

use crate::resource::Resource;
use std::fmt;
use std::sync::Arc;

/// Name of the index every cached type carries implicitly.
pub const ID_INDEX: &str = "id";

type IndexerFn = Arc<dyn Fn(&Resource) -> Vec<String> + Send + Sync>;

/// A named secondary index: maps a resource to zero or more index values.
#[derive(Clone)]
pub struct Index {
    name: String,
    indexer: IndexerFn,
}

impl fmt::Debug for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Index").field("name", &self.name).finish()
    }
}

impl Index {
    pub fn new<F>(name: impl Into<String>, indexer: F) -> Self
    where
        F: Fn(&Resource) -> Vec<String> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            indexer: Arc::new(indexer),
        }
    }

    /// The implicit identity index, keyed by reference key (uid ignored).
    pub fn id() -> Self {
        Self::new(ID_INDEX, |res: &Resource| vec![res.id.reference_key()])
    }

    /// Index resources by the reference key of their owner, if any.
    pub fn owner(name: impl Into<String>) -> Self {
        Self::new(name, |res: &Resource| {
            res.owner
                .as_ref()
                .map(|owner| vec![owner.reference_key()])
                .unwrap_or_default()
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn values(&self, resource: &Resource) -> Vec<String> {
        (self.indexer)(resource)
    }
}
