//! Containers: owners, lifecycle and repository

pub mod owner;
pub mod repository;
pub mod state;

pub use owner::{ContainerOwner, OwnerFilter};
pub use repository::ContainerRepository;
pub use state::{
    Container, ContainerInfo, ContainerMetadata, ContainerState, CreatedContainer,
    CreatingContainer, DestroyingContainer, FailedContainer,
};
