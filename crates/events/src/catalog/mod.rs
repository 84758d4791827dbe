//! Events the application publishes through its outboxes.
//!
//! - [`domain`]: identity and access events written to the domain outbox in the
//!   same transaction as the change that produced them.
//! - [`integration`]: painting-inventory events meant for external consumers.
//!
//! [`registry`] is the startup registration of every type below; a dispatcher
//! built with it can publish anything the application enqueues.

pub mod domain;
pub mod integration;

use crate::registry::{EventTypeRegistry, RegistryError};

/// Registry containing every event type in the catalog.
pub fn registry() -> Result<EventTypeRegistry, RegistryError> {
    EventTypeRegistry::new()
        .with::<domain::TenantCreated>()?
        .with::<domain::UserRegistered>()?
        .with::<domain::RoleGranted>()?
        .with::<domain::ClaimAssigned>()?
        .with::<integration::MaterialCreated>()?
        .with::<integration::PaintBrandCreated>()?
        .with::<integration::PaintLineCreated>()?
        .with::<integration::PaintColorCreated>()?
        .with::<integration::PaintColorCreatedV2>()?
        .with::<integration::ModelCategoryCreated>()
}
