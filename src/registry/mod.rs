//! Resource registry.
//!
//! Maps each [`ResourceKind`] to its identifier prefix and validated schema,
//! and provides create, read and serialize operations over persisted
//! [`ResourceDescriptor`]s.

mod kind;
mod repository;
mod resources;
mod schema;

pub use kind::{ResourceKind, PREFIX_LEN};
pub use repository::{
    FileResourceRepository, InMemoryResourceRepository, ResourceDescriptor, ResourceRepository,
};
pub use resources::{ResourceRegistry, ResourceRegistryBuilder};
pub use schema::{
    normalize, ContainerAppAttributes, DnsCnameRecordAttributes, ResourceGroupAttributes,
    ResourceSchema, StorageAccountAttributes, StorageContainerAttributes, DEFAULT_LOCATION,
};
