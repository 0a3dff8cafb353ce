//! # Resource Service
//!
//! Contract of the resource storage service the runtime talks to: CRUD on
//! typed resources plus a watch stream per type and tenancy scope.

use super::{Id, Resource, Status, Tenancy, Type};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResourceError {
    #[error("resource not found: {0}")]
    NotFound(String),
    /// Malformed request (unknown type, bad tenancy). Never worth retrying.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("version mismatch for {id}: expected {expected}, found {actual}")]
    VersionMismatch {
        id: String,
        expected: String,
        actual: String,
    },
    #[error("resource service unavailable: {0}")]
    Unavailable(String),
}

/// Event delivered on a watch stream.
///
/// A stream first replays every existing resource as `Upsert`, then sends a
/// single `EndOfSnapshot`, then live changes.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Upsert(Resource),
    Delete(Resource),
    EndOfSnapshot,
}

pub type WatchStream = BoxStream<'static, Result<WatchEvent, ResourceError>>;

/// Storage service consumed by the runtime and handed to reconcilers.
///
/// Every method takes and returns owned resources, so nothing a caller
/// mutates can alias storage or cache state.
#[async_trait]
pub trait ResourceService: Send + Sync {
    async fn read(&self, id: &Id) -> Result<Resource, ResourceError>;

    /// Create or update. A non-empty `version` is a compare-and-swap guard.
    async fn write(&self, resource: Resource) -> Result<Resource, ResourceError>;

    async fn write_status(
        &self,
        id: &Id,
        key: &str,
        status: Status,
    ) -> Result<Resource, ResourceError>;

    /// Delete; an empty `version` deletes unconditionally. Deleting a missing
    /// resource succeeds.
    async fn delete(&self, id: &Id, version: &str) -> Result<(), ResourceError>;

    async fn watch_list(
        &self,
        r#type: &Type,
        tenancy: &Tenancy,
    ) -> Result<WatchStream, ResourceError>;
}

pub type SharedResourceService = Arc<dyn ResourceService>;
