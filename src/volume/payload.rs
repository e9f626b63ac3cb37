//! What a volume holds
//!
//! The payload is stored as a set of mutually exclusive nullable columns.
//! Readers derive the variant from whichever one is set.

use crate::error::{StoreError, StoreResult};
use crate::ids::{
    ContainerId, ResourceCacheId, VolumeId, WorkerBaseResourceTypeId, WorkerResourceCacheId,
    WorkerResourceCertsId, WorkerTaskCacheId,
};
use serde::Serialize;

/// Payload of a volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VolumePayload {
    /// Scratch space mounted into a container at `path`
    Container {
        container_id: ContainerId,
        container_handle: String,
        path: String,
    },
    /// Canonical copy of a resource cache on its worker
    ResourceCache {
        worker_resource_cache_id: WorkerResourceCacheId,
        resource_cache_id: ResourceCacheId,
    },
    /// Image of a base resource type
    BaseResourceType {
        worker_base_resource_type_id: WorkerBaseResourceTypeId,
    },
    /// Canonical copy of a task cache on its worker
    TaskCache {
        worker_task_cache_id: WorkerTaskCacheId,
    },
    /// CA certificates of the worker
    ResourceCerts {
        worker_resource_certs_id: WorkerResourceCertsId,
    },
    /// Nothing references the volume any more
    None,
}

impl VolumePayload {
    /// Short name of the variant
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Container { .. } => "container",
            Self::ResourceCache { .. } => "resource-cache",
            Self::BaseResourceType { .. } => "base-resource-type",
            Self::TaskCache { .. } => "task-cache",
            Self::ResourceCerts { .. } => "resource-certs",
            Self::None => "none",
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

/// Payload columns as read back from `volumes`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct StoredPayload {
    pub container_id: Option<ContainerId>,
    pub container_handle: Option<String>,
    pub path: Option<String>,
    pub worker_resource_cache_id: Option<WorkerResourceCacheId>,
    pub resource_cache_id: Option<ResourceCacheId>,
    pub worker_base_resource_type_id: Option<WorkerBaseResourceTypeId>,
    pub worker_task_cache_id: Option<WorkerTaskCacheId>,
    pub worker_resource_certs_id: Option<WorkerResourceCertsId>,
}

impl StoredPayload {
    /// Decode into a payload; more than one populated column is a corrupt row
    pub fn decode(&self, volume: VolumeId) -> StoreResult<VolumePayload> {
        let populated = [
            self.container_id.is_some(),
            self.worker_resource_cache_id.is_some(),
            self.worker_base_resource_type_id.is_some(),
            self.worker_task_cache_id.is_some(),
            self.worker_resource_certs_id.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count();

        if populated > 1 {
            return Err(StoreError::corrupt(
                "volumes",
                volume.get(),
                format!("{} payload columns populated", populated),
            ));
        }

        let corrupt = |reason: &str| StoreError::corrupt("volumes", volume.get(), reason);

        if let Some(container_id) = self.container_id {
            return Ok(VolumePayload::Container {
                container_id,
                container_handle: self
                    .container_handle
                    .clone()
                    .ok_or_else(|| corrupt("container row missing"))?,
                path: self.path.clone().unwrap_or_default(),
            });
        }
        if let Some(worker_resource_cache_id) = self.worker_resource_cache_id {
            return Ok(VolumePayload::ResourceCache {
                worker_resource_cache_id,
                resource_cache_id: self
                    .resource_cache_id
                    .ok_or_else(|| corrupt("worker resource cache row missing"))?,
            });
        }
        if let Some(worker_base_resource_type_id) = self.worker_base_resource_type_id {
            return Ok(VolumePayload::BaseResourceType {
                worker_base_resource_type_id,
            });
        }
        if let Some(worker_task_cache_id) = self.worker_task_cache_id {
            return Ok(VolumePayload::TaskCache {
                worker_task_cache_id,
            });
        }
        if let Some(worker_resource_certs_id) = self.worker_resource_certs_id {
            return Ok(VolumePayload::ResourceCerts {
                worker_resource_certs_id,
            });
        }
        Ok(VolumePayload::None)
    }
}
