//! # Resources
//!
//! Typed, tenant-scoped, versioned resources and the service contract the
//! runtime consumes to read, write and watch them.
//!
//! - `service`: the `ResourceService` trait, watch events and errors
//! - `memory`: an in-memory `ResourceService` used by tests and the demo binary

pub mod memory;
pub mod service;

pub use service::{ResourceError, ResourceService, SharedResourceService, WatchEvent, WatchStream};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Tenancy wildcard: matches every partition or namespace in a watch.
pub const WILDCARD: &str = "*";

/// Default partition assigned to tenancies that do not name one.
pub const DEFAULT_PARTITION: &str = "default";

/// Default namespace for namespace-scoped resources.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Resource type, rendered as `group.version.kind` (e.g. `demo.v2.Artist`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Type {
    pub group: String,
    pub group_version: String,
    pub kind: String,
}

impl Type {
    pub fn new(
        group: impl Into<String>,
        group_version: impl Into<String>,
        kind: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            group_version: group_version.into(),
            kind: kind.into(),
        }
    }

    /// A type is well formed when group, version and kind are all non-empty.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.group.is_empty() && !self.group_version.is_empty() && !self.kind.is_empty()
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.group, self.group_version, self.kind)
    }
}

/// Partition/namespace scope of a resource.
///
/// Cluster-scoped resources leave `namespace` empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tenancy {
    pub partition: String,
    pub namespace: String,
}

impl Tenancy {
    pub fn new(partition: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            partition: partition.into(),
            namespace: namespace.into(),
        }
    }

    /// `partition=*, namespace=*`: the scope controllers watch with.
    #[must_use]
    pub fn wildcard() -> Self {
        Self::new(WILDCARD, WILDCARD)
    }

    /// Default partition and namespace.
    #[must_use]
    pub fn namespaced() -> Self {
        Self::new(DEFAULT_PARTITION, DEFAULT_NAMESPACE)
    }

    /// Default partition, no namespace.
    #[must_use]
    pub fn partitioned() -> Self {
        Self::new(DEFAULT_PARTITION, "")
    }

    /// Whether `other` falls within this (possibly wildcarded) scope.
    #[must_use]
    pub fn matches(&self, other: &Tenancy) -> bool {
        let partition_ok = self.partition == WILDCARD || self.partition == other.partition;
        let namespace_ok = self.namespace == WILDCARD || self.namespace == other.namespace;
        partition_ok && namespace_ok
    }
}

/// Identity of a resource.
///
/// `uid` distinguishes incarnations of the same name; it is empty until the
/// resource service assigns one on first write.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Id {
    pub r#type: Type,
    pub tenancy: Tenancy,
    pub name: String,
    #[serde(default)]
    pub uid: String,
}

impl Id {
    pub fn new(r#type: Type, tenancy: Tenancy, name: impl Into<String>) -> Self {
        Self {
            r#type,
            tenancy,
            name: name.into(),
            uid: String::new(),
        }
    }

    /// Stable de-duplication key covering type, tenancy, name and uid.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}:{}", self.reference_key(), self.uid)
    }

    /// Key that ignores the uid, so every incarnation of a name collides.
    ///
    /// This is the value the cache's `id` index and owner indexes are keyed by.
    #[must_use]
    pub fn reference_key(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.r#type, self.tenancy.partition, self.tenancy.namespace, self.name
        )
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}.{}/{}",
            self.r#type, self.tenancy.partition, self.tenancy.namespace, self.name
        )?;
        if !self.uid.is_empty() {
            write!(f, " (uid={})", self.uid)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConditionState {
    Unknown,
    True,
    False,
}

/// Single status condition written by a controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub r#type: String,
    pub state: ConditionState,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

/// Status written under a controller-specific key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    pub observed_generation: String,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// A typed, tenant-scoped, versioned resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub id: Id,
    #[serde(default)]
    pub owner: Option<Id>,
    /// Opaque version used for optimistic concurrency; empty on first write.
    #[serde(default)]
    pub version: String,
    /// Changes whenever the data (not the status) changes.
    #[serde(default)]
    pub generation: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub status: BTreeMap<String, Status>,
}

impl Resource {
    pub fn new(id: Id) -> Self {
        Self {
            id,
            owner: None,
            version: String::new(),
            generation: String::new(),
            metadata: BTreeMap::new(),
            data: serde_json::Value::Null,
            status: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_owner(mut self, owner: Id) -> Self {
        self.owner = Some(owner);
        self
    }

    #[must_use]
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}
