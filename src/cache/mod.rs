//! # Cache
//!
//! Per-controller, indexed, in-memory cache of resources.
//!
//! Every cached type has an implicit `id` index keyed by
//! [`Id::reference_key`](crate::resource::Id::reference_key); controllers
//! add further indexes (e.g. by owner) when declaring managed and watched
//! types. The cache owns its entries outright: every read returns an owned
//! clone, so reconcilers never hold a reference into cache memory.
//!
//! Writes (`insert`/`delete`) are only performed by the runner's watch
//! ingestion tasks; reconcilers and mappers see the cache through
//! [`ReadOnlyCache`].

mod index;

pub use index::{Index, ID_INDEX};

use crate::resource::{Resource, Type};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("resource type {0} is not cached")]
    TypeNotFound(String),
    #[error("index {index} does not exist for type {resource_type}")]
    IndexNotFound {
        resource_type: String,
        index: String,
    },
    #[error("index {index} is already registered for type {resource_type}")]
    DuplicateIndex {
        resource_type: String,
        index: String,
    },
    #[error("query {0} is not registered")]
    QueryNotFound(String),
    #[error("query {0} is already registered")]
    DuplicateQuery(String),
    #[error("query {name} failed: {source}")]
    QueryFailed {
        name: String,
        #[source]
        source: anyhow::Error,
    },
}

pub type ResourceIterator = std::vec::IntoIter<Resource>;

/// Named query over the cache, registered via `Controller::with_query`.
pub type QueryFn =
    Arc<dyn Fn(&dyn ReadOnlyCache, &[&str]) -> anyhow::Result<Vec<Resource>> + Send + Sync>;

/// Read-only view handed to reconcilers and dependency mappers.
pub trait ReadOnlyCache: Send + Sync {
    /// Exact match on a single index value.
    fn get(
        &self,
        r#type: &Type,
        index: &str,
        value: &str,
    ) -> Result<Option<Resource>, CacheError>;

    /// Every resource whose index value starts with `prefix`.
    fn list(&self, r#type: &Type, index: &str, prefix: &str) -> Result<Vec<Resource>, CacheError> {
        self.list_iterator(r#type, index, prefix).map(Iterator::collect)
    }

    fn list_iterator(
        &self,
        r#type: &Type,
        index: &str,
        prefix: &str,
    ) -> Result<ResourceIterator, CacheError>;

    /// Every resource whose index value is a prefix of `value`.
    fn parents_iterator(
        &self,
        r#type: &Type,
        index: &str,
        value: &str,
    ) -> Result<ResourceIterator, CacheError>;

    fn query(&self, name: &str, args: &[&str]) -> Result<ResourceIterator, CacheError>;
}

struct IndexState {
    index: Index,
    /// Index value -> set of resource keys.
    entries: BTreeMap<String, BTreeSet<String>>,
}

impl IndexState {
    fn insert(&mut self, value: String, key: &str) {
        self.entries.entry(value).or_default().insert(key.to_string());
    }

    fn remove(&mut self, value: &str, key: &str) {
        if let Some(keys) = self.entries.get_mut(value) {
            keys.remove(key);
            if keys.is_empty() {
                self.entries.remove(value);
            }
        }
    }
}

#[derive(Default)]
struct TypeCache {
    /// Keyed by `Id::reference_key`.
    resources: HashMap<String, Resource>,
    indexes: BTreeMap<String, IndexState>,
}

impl TypeCache {
    fn index(&self, r#type: &Type, name: &str) -> Result<&IndexState, CacheError> {
        self.indexes.get(name).ok_or_else(|| CacheError::IndexNotFound {
            resource_type: r#type.to_string(),
            index: name.to_string(),
        })
    }

    fn resolve<'a>(&self, keys: impl Iterator<Item = &'a String>) -> Vec<Resource> {
        let mut seen = BTreeSet::new();
        keys.filter(|key| seen.insert(*key))
            .filter_map(|key| self.resources.get(key).cloned())
            .collect()
    }
}

/// Indexed resource cache.
///
/// Safe for concurrent writers and readers.
pub struct Cache {
    types: RwLock<HashMap<Type, TypeCache>>,
    queries: RwLock<HashMap<String, QueryFn>>,
}

impl fmt::Debug for Cache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let types = self.types.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("Cache")
            .field("types", &types.keys().map(ToString::to_string).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

impl Cache {
    pub fn new() -> Self {
        Self {
            types: RwLock::new(HashMap::new()),
            queries: RwLock::new(HashMap::new()),
        }
    }

    /// Start caching a type. Adding a type twice is a no-op.
    pub fn add_type(&self, r#type: &Type) {
        let mut types = self.types.write().unwrap_or_else(PoisonError::into_inner);
        types.entry(r#type.clone()).or_insert_with(|| {
            let mut cache = TypeCache::default();
            let id = Index::id();
            cache.indexes.insert(
                id.name().to_string(),
                IndexState {
                    index: id,
                    entries: BTreeMap::new(),
                },
            );
            cache
        });
    }

    /// Add an index to a type, caching the type if needed.
    ///
    /// Resources already in the cache are indexed immediately.
    pub fn add_index(&self, r#type: &Type, index: Index) -> Result<(), CacheError> {
        self.add_type(r#type);
        let mut types = self.types.write().unwrap_or_else(PoisonError::into_inner);
        let cache = types
            .get_mut(r#type)
            .ok_or_else(|| CacheError::TypeNotFound(r#type.to_string()))?;
        if cache.indexes.contains_key(index.name()) {
            return Err(CacheError::DuplicateIndex {
                resource_type: r#type.to_string(),
                index: index.name().to_string(),
            });
        }

        let mut state = IndexState {
            index,
            entries: BTreeMap::new(),
        };
        for (key, res) in &cache.resources {
            for value in state.index.values(res) {
                state.insert(value, key);
            }
        }
        cache
            .indexes
            .insert(state.index.name().to_string(), state);
        Ok(())
    }

    pub fn add_query(&self, name: &str, query: QueryFn) -> Result<(), CacheError> {
        let mut queries = self.queries.write().unwrap_or_else(PoisonError::into_inner);
        if queries.contains_key(name) {
            return Err(CacheError::DuplicateQuery(name.to_string()));
        }
        queries.insert(name.to_string(), query);
        Ok(())
    }

    /// Insert or replace a resource, updating every index.
    pub fn insert(&self, resource: Resource) -> Result<(), CacheError> {
        let mut types = self.types.write().unwrap_or_else(PoisonError::into_inner);
        let cache = types
            .get_mut(&resource.id.r#type)
            .ok_or_else(|| CacheError::TypeNotFound(resource.id.r#type.to_string()))?;

        let key = resource.id.reference_key();
        if let Some(previous) = cache.resources.remove(&key) {
            for state in cache.indexes.values_mut() {
                for value in state.index.values(&previous) {
                    state.remove(&value, &key);
                }
            }
        }
        for state in cache.indexes.values_mut() {
            for value in state.index.values(&resource) {
                state.insert(value, &key);
            }
        }
        cache.resources.insert(key, resource);
        Ok(())
    }

    /// Remove a resource. Removing an absent resource is a no-op.
    pub fn delete(&self, resource: &Resource) -> Result<(), CacheError> {
        let mut types = self.types.write().unwrap_or_else(PoisonError::into_inner);
        let cache = types
            .get_mut(&resource.id.r#type)
            .ok_or_else(|| CacheError::TypeNotFound(resource.id.r#type.to_string()))?;

        let key = resource.id.reference_key();
        if let Some(previous) = cache.resources.remove(&key) {
            for state in cache.indexes.values_mut() {
                for value in state.index.values(&previous) {
                    state.remove(&value, &key);
                }
            }
        }
        Ok(())
    }

    /// Number of cached resources of a type.
    pub fn len(&self, r#type: &Type) -> usize {
        let types = self.types.read().unwrap_or_else(PoisonError::into_inner);
        types.get(r#type).map_or(0, |cache| cache.resources.len())
    }

    fn with_type<R>(
        &self,
        r#type: &Type,
        f: impl FnOnce(&TypeCache) -> Result<R, CacheError>,
    ) -> Result<R, CacheError> {
        let types = self.types.read().unwrap_or_else(PoisonError::into_inner);
        let cache = types
            .get(r#type)
            .ok_or_else(|| CacheError::TypeNotFound(r#type.to_string()))?;
        f(cache)
    }
}

impl ReadOnlyCache for Cache {
    fn get(
        &self,
        r#type: &Type,
        index: &str,
        value: &str,
    ) -> Result<Option<Resource>, CacheError> {
        self.with_type(r#type, |cache| {
            let state = cache.index(r#type, index)?;
            Ok(state
                .entries
                .get(value)
                .and_then(|keys| keys.iter().next())
                .and_then(|key| cache.resources.get(key).cloned()))
        })
    }

    fn list_iterator(
        &self,
        r#type: &Type,
        index: &str,
        prefix: &str,
    ) -> Result<ResourceIterator, CacheError> {
        self.with_type(r#type, |cache| {
            let state = cache.index(r#type, index)?;
            let keys = state
                .entries
                .range(prefix.to_string()..)
                .take_while(|(value, _)| value.starts_with(prefix))
                .flat_map(|(_, keys)| keys.iter());
            Ok(cache.resolve(keys).into_iter())
        })
    }

    fn parents_iterator(
        &self,
        r#type: &Type,
        index: &str,
        value: &str,
    ) -> Result<ResourceIterator, CacheError> {
        self.with_type(r#type, |cache| {
            let state = cache.index(r#type, index)?;
            let keys = state
                .entries
                .iter()
                .filter(|(indexed, _)| value.starts_with(indexed.as_str()))
                .flat_map(|(_, keys)| keys.iter());
            Ok(cache.resolve(keys).into_iter())
        })
    }

    fn query(&self, name: &str, args: &[&str]) -> Result<ResourceIterator, CacheError> {
        let query = {
            let queries = self.queries.read().unwrap_or_else(PoisonError::into_inner);
            queries
                .get(name)
                .cloned()
                .ok_or_else(|| CacheError::QueryNotFound(name.to_string()))?
        };
        query(self, args)
            .map(IntoIterator::into_iter)
            .map_err(|source| CacheError::QueryFailed {
                name: name.to_string(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{Id, Tenancy};
    use serde_json::json;

    fn artist_type() -> Type {
        Type::new("demo", "v2", "Artist")
    }

    fn album_type() -> Type {
        Type::new("demo", "v2", "Album")
    }

    fn artist(name: &str, genre: &str) -> Resource {
        let mut id = Id::new(artist_type(), Tenancy::namespaced(), name);
        id.uid = format!("uid-{name}");
        Resource::new(id).with_data(json!({ "genre": genre }))
    }

    fn album(name: &str, owner: &Resource) -> Resource {
        Resource::new(Id::new(album_type(), Tenancy::namespaced(), name))
            .with_owner(owner.id.clone())
    }

    fn genre_index() -> Index {
        Index::new("genre", |res: &Resource| {
            res.data
                .get("genre")
                .and_then(|g| g.as_str())
                .map(|g| vec![g.to_string()])
                .unwrap_or_default()
        })
    }

    #[test]
    fn test_get_by_id() {
        let cache = Cache::new();
        cache.add_type(&artist_type());
        let queen = artist("queen", "rock");
        cache.insert(queen.clone()).unwrap();

        let found = cache
            .get(&artist_type(), ID_INDEX, &queen.id.reference_key())
            .unwrap();
        assert_eq!(found, Some(queen));
    }

    #[test]
    fn test_insert_unknown_type_fails() {
        let cache = Cache::new();
        let err = cache.insert(artist("queen", "rock")).unwrap_err();
        assert!(matches!(err, CacheError::TypeNotFound(_)));
    }

    #[test]
    fn test_custom_index_tracks_updates() {
        let cache = Cache::new();
        cache.add_index(&artist_type(), genre_index()).unwrap();
        cache.insert(artist("queen", "rock")).unwrap();
        cache.insert(artist("abba", "pop")).unwrap();

        assert_eq!(cache.list(&artist_type(), "genre", "rock").unwrap().len(), 1);

        cache.insert(artist("abba", "rock")).unwrap();
        assert_eq!(cache.list(&artist_type(), "genre", "rock").unwrap().len(), 2);
        assert!(cache.list(&artist_type(), "genre", "pop").unwrap().is_empty());
    }

    #[test]
    fn test_owner_index_and_delete() {
        let cache = Cache::new();
        cache.add_type(&artist_type());
        cache.add_index(&album_type(), Index::owner("owner")).unwrap();

        let queen = artist("queen", "rock");
        let jazz = album("jazz", &queen);
        let innuendo = album("innuendo", &queen);
        cache.insert(jazz.clone()).unwrap();
        cache.insert(innuendo).unwrap();

        let owned = cache
            .list(&album_type(), "owner", &queen.id.reference_key())
            .unwrap();
        assert_eq!(owned.len(), 2);

        cache.delete(&jazz).unwrap();
        let owned = cache
            .list(&album_type(), "owner", &queen.id.reference_key())
            .unwrap();
        assert_eq!(owned.len(), 1);
        assert_eq!(cache.len(&album_type()), 1);
    }

    #[test]
    fn test_parents_iterator_matches_prefixes() {
        let cache = Cache::new();
        cache
            .add_index(
                &artist_type(),
                Index::new("path", |res: &Resource| {
                    vec![res.data["path"].as_str().unwrap_or_default().to_string()]
                }),
            )
            .unwrap();
        cache
            .insert(artist("root", "rock").with_data(json!({"path": "/a"})))
            .unwrap();
        cache
            .insert(artist("child", "rock").with_data(json!({"path": "/a/b"})))
            .unwrap();
        cache
            .insert(artist("other", "rock").with_data(json!({"path": "/c"})))
            .unwrap();

        let parents: Vec<_> = cache
            .parents_iterator(&artist_type(), "path", "/a/b/c")
            .unwrap()
            .map(|res| res.id.name)
            .collect();
        assert_eq!(parents.len(), 2);
        assert!(parents.contains(&"root".to_string()));
        assert!(parents.contains(&"child".to_string()));
    }

    #[test]
    fn test_missing_index_is_an_error() {
        let cache = Cache::new();
        cache.add_type(&artist_type());
        let err = cache.list(&artist_type(), "nope", "").unwrap_err();
        assert!(matches!(err, CacheError::IndexNotFound { .. }));
    }

    #[test]
    fn test_duplicate_index_is_an_error() {
        let cache = Cache::new();
        cache.add_index(&artist_type(), genre_index()).unwrap();
        let err = cache.add_index(&artist_type(), genre_index()).unwrap_err();
        assert!(matches!(err, CacheError::DuplicateIndex { .. }));
    }

    #[test]
    fn test_query_errors_are_wrapped() {
        let cache = Cache::new();
        cache
            .add_query(
                "some-query",
                Arc::new(|_: &dyn ReadOnlyCache, _: &[&str]| {
                    Err(anyhow::anyhow!("injected error"))
                }),
            )
            .unwrap();

        let err = cache.query("some-query", &["irrelevant"]).unwrap_err();
        assert!(matches!(err, CacheError::QueryFailed { .. }));
        assert!(err.to_string().contains("injected error"));
    }

    #[test]
    fn test_query_reads_through_cache() {
        let cache = Cache::new();
        cache.add_index(&artist_type(), genre_index()).unwrap();
        cache.insert(artist("queen", "rock")).unwrap();
        let artist_type = artist_type();
        cache
            .add_query(
                "by-genre",
                Arc::new(move |cache: &dyn ReadOnlyCache, args: &[&str]| {
                    Ok(cache.list(&artist_type, "genre", args[0])?)
                }),
            )
            .unwrap();

        assert_eq!(cache.query("by-genre", &["rock"]).unwrap().count(), 1);
    }

    #[test]
    fn test_reads_return_owned_copies() {
        let cache = Cache::new();
        cache.add_type(&artist_type());
        let queen = artist("queen", "rock");
        cache.insert(queen.clone()).unwrap();

        let mut copy = cache
            .get(&artist_type(), ID_INDEX, &queen.id.reference_key())
            .unwrap()
            .unwrap();
        copy.data = json!({"genre": "mutated"});

        let again = cache
            .get(&artist_type(), ID_INDEX, &queen.id.reference_key())
            .unwrap()
            .unwrap();
        assert_eq!(again.data, json!({"genre": "rock"}));
    }
}
