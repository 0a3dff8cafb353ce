//! # Dependency Mappers
//!
//! Ready-made [`DependencyMapper`]s for the common watch shapes.

use super::reconciler::{DependencyMapper, Runtime};
use super::request::Request;
use crate::resource::{Id, Resource, Type};

/// Reconcile the owner of the changed resource, if it has one.
pub fn map_owner() -> impl DependencyMapper {
    |_rt: Runtime, res: Resource| async move {
        anyhow::Ok(res.owner.map(Request::new).into_iter().collect::<Vec<_>>())
    }
}

/// Like [`map_owner`], but only for owners of `owner_type`.
pub fn map_owner_filtered(owner_type: Type) -> impl DependencyMapper {
    move |_rt: Runtime, res: Resource| {
        let owner = res.owner.filter(|owner| owner.r#type == owner_type);
        async move { anyhow::Ok(owner.map(Request::new).into_iter().collect::<Vec<_>>()) }
    }
}

/// Reconcile the resource of `desired` type with the same tenancy and name
/// as the changed resource.
pub fn replace_type(desired: Type) -> impl DependencyMapper {
    move |_rt: Runtime, res: Resource| {
        let id = Id::new(desired.clone(), res.id.tenancy, res.id.name);
        async move { anyhow::Ok(vec![Request::new(id)]) }
    }
}
