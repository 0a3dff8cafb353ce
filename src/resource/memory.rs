//! # In-Memory Resource Service
//!
//! Ephemeral `ResourceService` backed by a map, with snapshot-then-live
//! watch streams fed from a broadcast channel. Data does not survive the
//! process. Used by the integration tests and the demo binary.

use super::service::{ResourceError, ResourceService, WatchEvent, WatchStream};
use super::{Id, Resource, Status, Tenancy, Type, DEFAULT_PARTITION};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

const WATCH_BUFFER: usize = 1024;

#[derive(Debug, Clone)]
enum Change {
    Upsert(Resource),
    Delete(Resource),
}

impl Change {
    fn resource(&self) -> &Resource {
        match self {
            Change::Upsert(res) | Change::Delete(res) => res,
        }
    }
}

#[derive(Debug, Default)]
struct State {
    types: HashSet<Type>,
    /// Keyed by `Id::reference_key`.
    resources: BTreeMap<String, Resource>,
    next_version: u64,
}

impl State {
    fn bump(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }

    fn check_type(&self, r#type: &Type) -> Result<(), ResourceError> {
        if self.types.contains(r#type) {
            Ok(())
        } else {
            Err(ResourceError::InvalidArgument(format!(
                "resource type {type} is not registered"
            )))
        }
    }
}

/// In-memory resource store with watch support.
///
/// Thread-safe and cheap to clone; clones share the same store.
#[derive(Clone, Debug)]
pub struct InMemoryResourceService {
    state: Arc<RwLock<State>>,
    changes: broadcast::Sender<Change>,
}

impl Default for InMemoryResourceService {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryResourceService {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(WATCH_BUFFER);
        Self {
            state: Arc::new(RwLock::new(State::default())),
            changes,
        }
    }

    /// Service with the given types registered.
    pub fn with_types(types: impl IntoIterator<Item = Type>) -> Self {
        let (changes, _) = broadcast::channel(WATCH_BUFFER);
        let state = State {
            types: types.into_iter().collect(),
            ..State::default()
        };
        Self {
            state: Arc::new(RwLock::new(state)),
            changes,
        }
    }

    pub async fn register_type(&self, r#type: Type) {
        self.state.write().await.types.insert(r#type);
    }

    /// Number of stored resources, across all types.
    pub async fn len(&self) -> usize {
        self.state.read().await.resources.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn normalize_tenancy(tenancy: &mut Tenancy) {
    if tenancy.partition.is_empty() {
        tenancy.partition = DEFAULT_PARTITION.to_string();
    }
}

#[async_trait]
impl ResourceService for InMemoryResourceService {
    async fn read(&self, id: &Id) -> Result<Resource, ResourceError> {
        let mut lookup = id.clone();
        normalize_tenancy(&mut lookup.tenancy);

        let state = self.state.read().await;
        state.check_type(&lookup.r#type)?;
        match state.resources.get(&lookup.reference_key()) {
            Some(res) if id.uid.is_empty() || res.id.uid == id.uid => Ok(res.clone()),
            _ => Err(ResourceError::NotFound(id.to_string())),
        }
    }

    async fn write(&self, mut resource: Resource) -> Result<Resource, ResourceError> {
        normalize_tenancy(&mut resource.id.tenancy);
        if let Some(owner) = resource.owner.as_mut() {
            normalize_tenancy(&mut owner.tenancy);
        }

        let mut state = self.state.write().await;
        state.check_type(&resource.id.r#type)?;
        if resource.id.name.is_empty() {
            return Err(ResourceError::InvalidArgument(
                "resource name is required".to_string(),
            ));
        }

        let key = resource.id.reference_key();
        let existing = state.resources.get(&key).map(|existing| {
            (
                existing.version.clone(),
                existing.id.uid.clone(),
                existing.status.clone(),
                existing.generation.clone(),
                existing.data == resource.data,
            )
        });
        match existing {
            Some((version, uid, status, generation, same_data)) => {
                if !resource.version.is_empty() && resource.version != version {
                    return Err(ResourceError::VersionMismatch {
                        id: resource.id.to_string(),
                        expected: resource.version,
                        actual: version,
                    });
                }
                if !resource.id.uid.is_empty() && resource.id.uid != uid {
                    return Err(ResourceError::NotFound(resource.id.to_string()));
                }
                resource.id.uid = uid;
                // Status is only ever changed through write_status.
                resource.status = status;
                resource.generation = if same_data { generation } else { state.bump() };
            }
            None => {
                if !resource.version.is_empty() {
                    return Err(ResourceError::NotFound(resource.id.to_string()));
                }
                if resource.id.uid.is_empty() {
                    resource.id.uid = uuid::Uuid::new_v4().simple().to_string();
                }
                resource.status.clear();
                resource.generation = state.bump();
            }
        }
        resource.version = state.bump();

        state.resources.insert(key, resource.clone());
        debug!(resource.id = %resource.id, resource.version = %resource.version, "resource.write");
        // No receivers is not an error: nobody is watching yet.
        let _ = self.changes.send(Change::Upsert(resource.clone()));
        Ok(resource)
    }

    async fn write_status(
        &self,
        id: &Id,
        key: &str,
        status: Status,
    ) -> Result<Resource, ResourceError> {
        let mut lookup = id.clone();
        normalize_tenancy(&mut lookup.tenancy);

        let mut state = self.state.write().await;
        state.check_type(&lookup.r#type)?;
        let reference_key = lookup.reference_key();
        if !state
            .resources
            .get(&reference_key)
            .is_some_and(|res| id.uid.is_empty() || res.id.uid == id.uid)
        {
            return Err(ResourceError::NotFound(id.to_string()));
        }
        let version = state.bump();
        let Some(res) = state.resources.get_mut(&reference_key) else {
            return Err(ResourceError::NotFound(id.to_string()));
        };
        res.status.insert(key.to_string(), status);
        res.version = version;
        let updated = res.clone();

        let _ = self.changes.send(Change::Upsert(updated.clone()));
        Ok(updated)
    }

    async fn delete(&self, id: &Id, version: &str) -> Result<(), ResourceError> {
        let mut lookup = id.clone();
        normalize_tenancy(&mut lookup.tenancy);

        let mut state = self.state.write().await;
        state.check_type(&lookup.r#type)?;
        let key = lookup.reference_key();
        let Some(existing) = state.resources.get(&key) else {
            return Ok(());
        };
        if !id.uid.is_empty() && existing.id.uid != id.uid {
            return Ok(());
        }
        if !version.is_empty() && existing.version != version {
            return Err(ResourceError::VersionMismatch {
                id: id.to_string(),
                expected: version.to_string(),
                actual: existing.version.clone(),
            });
        }

        if let Some(removed) = state.resources.remove(&key) {
            debug!(resource.id = %removed.id, "resource.delete");
            let _ = self.changes.send(Change::Delete(removed));
        }
        Ok(())
    }

    async fn watch_list(
        &self,
        r#type: &Type,
        tenancy: &Tenancy,
    ) -> Result<WatchStream, ResourceError> {
        if tenancy.partition.is_empty() {
            return Err(ResourceError::InvalidArgument(
                "watch tenancy must name a partition or use a wildcard".to_string(),
            ));
        }

        // Subscribe while holding the read lock so that no write can land
        // between the snapshot and the live feed.
        let state = self.state.read().await;
        state.check_type(r#type)?;
        let live = self.changes.subscribe();
        let snapshot: Vec<Resource> = state
            .resources
            .values()
            .filter(|res| res.id.r#type == *r#type && tenancy.matches(&res.id.tenancy))
            .cloned()
            .collect();
        drop(state);

        let initial = stream::iter(
            snapshot
                .into_iter()
                .map(|res| Ok(WatchEvent::Upsert(res)))
                .chain(std::iter::once(Ok(WatchEvent::EndOfSnapshot))),
        );

        let filter_type = r#type.clone();
        let filter_tenancy = tenancy.clone();
        let changes = stream::unfold(live, move |mut live| {
            let filter_type = filter_type.clone();
            let filter_tenancy = filter_tenancy.clone();
            async move {
                loop {
                    match live.recv().await {
                        Ok(change) => {
                            let res = change.resource();
                            if res.id.r#type != filter_type
                                || !filter_tenancy.matches(&res.id.tenancy)
                            {
                                continue;
                            }
                            let event = match change {
                                Change::Upsert(res) => WatchEvent::Upsert(res),
                                Change::Delete(res) => WatchEvent::Delete(res),
                            };
                            return Some((Ok(event), live));
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            return Some((
                                Err(ResourceError::Unavailable(format!(
                                    "watch fell behind by {missed} events"
                                ))),
                                live,
                            ));
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });

        Ok(initial.chain(changes).boxed())
    }
}
