//! Volumes: payloads, lifecycle and repository

pub mod payload;
pub mod repository;
pub mod state;

pub use payload::VolumePayload;
pub use repository::VolumeRepository;
pub use state::{
    CreatedVolume, CreatingVolume, DestroyingVolume, FailedVolume, Volume, VolumeInfo,
    VolumeResourceType, VolumeState,
};
