//! CSI Controller service backed by the simulated cloud.
//!
//! Status codes follow the production driver: idempotent repeats succeed,
//! name collisions with different properties are `ALREADY_EXISTS`, a second
//! operation on a busy volume name is `ABORTED`, and delete or unpublish of
//! a malformed volume ID succeeds because such a volume cannot exist.

use std::collections::HashMap;

use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

use pd_e2e::client::{DISK_TYPE_PARAMETER, GIB, REPLICATION_PARAMETER, REPLICATION_REGIONAL};
use pd_e2e::config::DEFAULT_DISK_TYPE;
use pd_e2e::topology::ZONE_TOPOLOGY_KEY;

use crate::cloud::{Placement, SimCloud, SimCloudError};
use crate::csi;
use crate::csi::controller_server::Controller;

/// Publish-context key under which the device path reaches the node.
pub const DEVICE_PATH_KEY: &str = "devicePath";

/// Controller service implementation.
pub struct ControllerService {
    cloud: SimCloud,
    /// Zone used when a create request carries no accessibility requirement.
    default_zone: String,
}

impl ControllerService {
    pub fn new(cloud: SimCloud, default_zone: &str) -> Self {
        Self {
            cloud,
            default_zone: default_zone.to_string(),
        }
    }
}

// ============================================================================
// Volume IDs
// ============================================================================

/// Parsed form of a volume ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeId {
    Zonal {
        project: String,
        zone: String,
        name: String,
    },
    Regional {
        project: String,
        region: String,
        name: String,
    },
}

impl VolumeId {
    pub fn name(&self) -> &str {
        match self {
            VolumeId::Zonal { name, .. } | VolumeId::Regional { name, .. } => name,
        }
    }
}

pub fn zonal_volume_id(project: &str, zone: &str, name: &str) -> String {
    format!("projects/{project}/zones/{zone}/disks/{name}")
}

pub fn regional_volume_id(project: &str, region: &str, name: &str) -> String {
    format!("projects/{project}/regions/{region}/disks/{name}")
}

/// Parses `projects/{p}/zones/{z}/disks/{n}` or
/// `projects/{p}/regions/{r}/disks/{n}`. Anything else is `None`.
pub fn parse_volume_id(id: &str) -> Option<VolumeId> {
    let parts: Vec<&str> = id.split('/').collect();
    match parts.as_slice() {
        ["projects", project, "zones", zone, "disks", name]
            if !project.is_empty() && !zone.is_empty() && !name.is_empty() =>
        {
            Some(VolumeId::Zonal {
                project: project.to_string(),
                zone: zone.to_string(),
                name: name.to_string(),
            })
        }
        ["projects", project, "regions", region, "disks", name]
            if !project.is_empty() && !region.is_empty() && !name.is_empty() =>
        {
            Some(VolumeId::Regional {
                project: project.to_string(),
                region: region.to_string(),
                name: name.to_string(),
            })
        }
        _ => None,
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn bytes_to_gb(bytes: i64) -> i64 {
    // i64::div_ceil is unstable; equivalent for the positive divisor GIB.
    let (q, r) = (bytes / GIB, bytes % GIB);
    if r > 0 { q + 1 } else { q }
}

/// First zone named in the accessibility requirements, preferred entries
/// winning over requisite ones.
fn requested_zone(requirements: Option<&csi::TopologyRequirement>) -> Option<String> {
    let requirements = requirements?;
    requirements
        .preferred
        .iter()
        .chain(requirements.requisite.iter())
        .find_map(|topology| topology.segments.get(ZONE_TOPOLOGY_KEY).cloned())
}

fn zone_topology(zone: &str) -> csi::Topology {
    let mut segments = HashMap::new();
    segments.insert(ZONE_TOPOLOGY_KEY.to_string(), zone.to_string());
    csi::Topology { segments }
}

fn map_cloud_error(error: SimCloudError) -> Status {
    match &error {
        SimCloudError::DiskNotFound(_) | SimCloudError::UnknownInstance(_) => {
            Status::not_found(error.to_string())
        }
        SimCloudError::DiskConflict(_) => Status::already_exists(error.to_string()),
        SimCloudError::OperationPending(name) => Status::aborted(format!(
            "An operation with the given volume {name} already exists"
        )),
        SimCloudError::UnknownZone(_) | SimCloudError::NotEnoughZones(_) => {
            Status::invalid_argument(error.to_string())
        }
        SimCloudError::DiskInUse { .. } | SimCloudError::AlreadyAttached { .. } => {
            Status::failed_precondition(error.to_string())
        }
    }
}

#[tonic::async_trait]
impl Controller for ControllerService {
    async fn create_volume(
        &self,
        request: Request<csi::CreateVolumeRequest>,
    ) -> Result<Response<csi::CreateVolumeResponse>, Status> {
        let request = request.into_inner();
        debug!(name = %request.name, "CreateVolume called");

        if request.name.is_empty() {
            return Err(Status::invalid_argument("CreateVolume name is required"));
        }
        if request.volume_capabilities.is_empty() {
            return Err(Status::invalid_argument(
                "CreateVolume volume capabilities are required",
            ));
        }
        let required_bytes = request
            .capacity_range
            .as_ref()
            .map(|range| range.required_bytes)
            .unwrap_or(0);
        if required_bytes <= 0 {
            return Err(Status::invalid_argument(
                "CreateVolume capacity range with positive required bytes is required",
            ));
        }
        let size_gb = bytes_to_gb(required_bytes);

        let disk_type = request
            .parameters
            .get(DISK_TYPE_PARAMETER)
            .cloned()
            .unwrap_or_else(|| DEFAULT_DISK_TYPE.to_string());
        let replication = request
            .parameters
            .get(REPLICATION_PARAMETER)
            .map(String::as_str)
            .unwrap_or("none");

        let _guard = self
            .cloud
            .begin_operation(&request.name)
            .map_err(map_cloud_error)?;
        let hold = self.cloud.operation_hold();
        if !hold.is_zero() {
            tokio::time::sleep(hold).await;
        }

        let project = self.cloud.project().to_string();
        let (record, volume_id) = match replication {
            "none" => {
                let zone = requested_zone(request.accessibility_requirements.as_ref())
                    .unwrap_or_else(|| self.default_zone.clone());
                let record = self
                    .cloud
                    .create_zonal_disk(&zone, &request.name, &disk_type, size_gb)
                    .await
                    .map_err(map_cloud_error)?;
                let volume_id = zonal_volume_id(&project, &zone, &request.name);
                (record, volume_id)
            }
            REPLICATION_REGIONAL => {
                let record = self
                    .cloud
                    .create_regional_disk(&request.name, &disk_type, size_gb)
                    .await
                    .map_err(map_cloud_error)?;
                let region = match &record.placement {
                    Placement::Regional { region, .. } => region.clone(),
                    Placement::Zonal(_) => {
                        return Err(Status::internal("regional create produced a zonal disk"));
                    }
                };
                let volume_id = regional_volume_id(&project, &region, &request.name);
                (record, volume_id)
            }
            other => {
                return Err(Status::invalid_argument(format!(
                    "unknown replication-type '{other}'"
                )));
            }
        };

        let accessible_topology = match &record.placement {
            Placement::Zonal(zone) => vec![zone_topology(zone)],
            Placement::Regional { replica_zones, .. } => {
                replica_zones.iter().map(|z| zone_topology(z)).collect()
            }
        };

        info!(name = %request.name, volume_id = %volume_id, size_gb, "Created volume");
        Ok(Response::new(csi::CreateVolumeResponse {
            volume: Some(csi::Volume {
                capacity_bytes: record.size_gb * GIB,
                volume_id,
                volume_context: HashMap::new(),
                accessible_topology,
            }),
        }))
    }

    async fn delete_volume(
        &self,
        request: Request<csi::DeleteVolumeRequest>,
    ) -> Result<Response<csi::DeleteVolumeResponse>, Status> {
        let request = request.into_inner();
        debug!(volume_id = %request.volume_id, "DeleteVolume called");

        if request.volume_id.is_empty() {
            return Err(Status::invalid_argument("DeleteVolume volume ID is required"));
        }
        let Some(id) = parse_volume_id(&request.volume_id) else {
            // A volume with an unparseable ID cannot exist, so it is gone.
            warn!(volume_id = %request.volume_id, "DeleteVolume with malformed ID, treating as deleted");
            return Ok(Response::new(csi::DeleteVolumeResponse {}));
        };

        let _guard = self
            .cloud
            .begin_operation(id.name())
            .map_err(map_cloud_error)?;
        let hold = self.cloud.operation_hold();
        if !hold.is_zero() {
            tokio::time::sleep(hold).await;
        }

        let deleted = self
            .cloud
            .delete_disk(id.name())
            .await
            .map_err(map_cloud_error)?;
        if deleted {
            info!(volume_id = %request.volume_id, "Deleted volume");
        } else {
            debug!(volume_id = %request.volume_id, "Volume already gone");
        }
        Ok(Response::new(csi::DeleteVolumeResponse {}))
    }

    async fn controller_publish_volume(
        &self,
        request: Request<csi::ControllerPublishVolumeRequest>,
    ) -> Result<Response<csi::ControllerPublishVolumeResponse>, Status> {
        let request = request.into_inner();
        debug!(volume_id = %request.volume_id, node_id = %request.node_id, "ControllerPublishVolume called");

        if request.volume_id.is_empty() {
            return Err(Status::invalid_argument(
                "ControllerPublishVolume volume ID is required",
            ));
        }
        if request.node_id.is_empty() {
            return Err(Status::invalid_argument(
                "ControllerPublishVolume node ID is required",
            ));
        }
        if request.volume_capability.is_none() {
            return Err(Status::invalid_argument(
                "ControllerPublishVolume volume capability is required",
            ));
        }
        let id = parse_volume_id(&request.volume_id).ok_or_else(|| {
            Status::not_found(format!("volume ID '{}' is invalid", request.volume_id))
        })?;

        self.cloud
            .attach(&request.node_id, id.name())
            .await
            .map_err(map_cloud_error)?;

        let mut publish_context = HashMap::new();
        publish_context.insert(
            DEVICE_PATH_KEY.to_string(),
            format!("/dev/disk/by-id/google-{}", id.name()),
        );
        info!(volume_id = %request.volume_id, node_id = %request.node_id, "Attached volume");
        Ok(Response::new(csi::ControllerPublishVolumeResponse {
            publish_context,
        }))
    }

    async fn controller_unpublish_volume(
        &self,
        request: Request<csi::ControllerUnpublishVolumeRequest>,
    ) -> Result<Response<csi::ControllerUnpublishVolumeResponse>, Status> {
        let request = request.into_inner();
        debug!(volume_id = %request.volume_id, node_id = %request.node_id, "ControllerUnpublishVolume called");

        if request.volume_id.is_empty() {
            return Err(Status::invalid_argument(
                "ControllerUnpublishVolume volume ID is required",
            ));
        }
        if request.node_id.is_empty() {
            return Err(Status::invalid_argument(
                "ControllerUnpublishVolume node ID is required",
            ));
        }
        let Some(id) = parse_volume_id(&request.volume_id) else {
            warn!(volume_id = %request.volume_id, "ControllerUnpublishVolume with malformed ID, treating as detached");
            return Ok(Response::new(csi::ControllerUnpublishVolumeResponse {}));
        };

        self.cloud
            .detach(&request.node_id, id.name())
            .await
            .map_err(map_cloud_error)?;
        info!(volume_id = %request.volume_id, node_id = %request.node_id, "Detached volume");
        Ok(Response::new(csi::ControllerUnpublishVolumeResponse {}))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // ========================================================================
    // Volume ID parsing
    // ========================================================================

    #[test]
    fn parses_zonal_volume_ids() {
        let id = parse_volume_id("projects/p1/zones/us-central1-a/disks/disk-1").unwrap();
        assert_eq!(
            id,
            VolumeId::Zonal {
                project: "p1".to_string(),
                zone: "us-central1-a".to_string(),
                name: "disk-1".to_string(),
            }
        );
        assert_eq!(id.name(), "disk-1");
    }

    #[test]
    fn parses_regional_volume_ids() {
        let id = parse_volume_id("projects/p1/regions/us-central1/disks/disk-r").unwrap();
        assert_eq!(
            id,
            VolumeId::Regional {
                project: "p1".to_string(),
                region: "us-central1".to_string(),
                name: "disk-r".to_string(),
            }
        );
    }

    #[test]
    fn rejects_malformed_volume_ids() {
        for bad in [
            "",
            "disk-1",
            "projects/p1/zones/us-central1-a/disks",
            "projects/p1/zones//disks/disk-1",
            "projects/p1/volumes/us-central1-a/disks/disk-1",
            "projects/p1/zones/us-central1-a/disks/disk-1/extra",
        ] {
            assert_eq!(parse_volume_id(bad), None, "should reject {bad:?}");
        }
    }

    #[test]
    fn volume_id_round_trips() {
        let id = zonal_volume_id("p1", "us-central1-a", "disk-1");
        assert_eq!(id, "projects/p1/zones/us-central1-a/disks/disk-1");
        assert!(parse_volume_id(&id).is_some());

        let id = regional_volume_id("p1", "us-central1", "disk-r");
        assert_eq!(id, "projects/p1/regions/us-central1/disks/disk-r");
        assert!(parse_volume_id(&id).is_some());
    }

    // ========================================================================
    // Size conversion
    // ========================================================================

    #[test]
    fn capacity_rounds_up_to_whole_gigabytes() {
        assert_eq!(bytes_to_gb(GIB), 1);
        assert_eq!(bytes_to_gb(GIB + 1), 2);
        assert_eq!(bytes_to_gb(5 * GIB), 5);
    }

    // ========================================================================
    // Zone selection
    // ========================================================================

    #[test]
    fn requested_zone_prefers_preferred_entries() {
        let mut preferred = HashMap::new();
        preferred.insert(ZONE_TOPOLOGY_KEY.to_string(), "us-central1-b".to_string());
        let mut requisite = HashMap::new();
        requisite.insert(ZONE_TOPOLOGY_KEY.to_string(), "us-central1-a".to_string());
        let requirement = csi::TopologyRequirement {
            requisite: vec![csi::Topology {
                segments: requisite,
            }],
            preferred: vec![csi::Topology {
                segments: preferred,
            }],
        };

        assert_eq!(
            requested_zone(Some(&requirement)),
            Some("us-central1-b".to_string())
        );
        assert_eq!(requested_zone(None), None);
    }
}
