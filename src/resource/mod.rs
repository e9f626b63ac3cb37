//! Resource identity graph
//!
//! Base types, resource configs and resource caches, plus the use edges
//! that keep them alive and the cleanup that removes them once unused.

pub mod base_type;
pub mod cache;
pub mod config;
pub mod hash;
pub mod lifecycle;
pub mod types;
pub mod user;

pub use base_type::UsedBaseResourceType;
pub use cache::{ResourceCacheDescriptor, ResourceCacheFactory, UsedResourceCache};
pub use config::{
    ConfigParent, ResourceConfigDescriptor, ResourceConfigFactory, UsedConfigParent,
    UsedResourceConfig,
};
pub use hash::{Params, Source, Version};
pub use lifecycle::ResourceCacheLifecycle;
pub use types::{ResourceType, ResourceTypes};
pub use user::ResourceUser;
