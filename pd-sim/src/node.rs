//! CSI Node service: staging and publishing volumes onto a directory tree.
//!
//! The node has no real block devices. Staging a volume creates the staging
//! directory under the instance root, publishing creates the target
//! directory, and the inverse calls remove them again. Precondition checks
//! are real: staging requires the cloud to show the disk attached to this
//! node, publishing requires a prior stage.

use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::sync::RwLock;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

use pd_e2e::topology::ZONE_TOPOLOGY_KEY;

use crate::cloud::SimCloud;
use crate::controller::{DEVICE_PATH_KEY, parse_volume_id};
use crate::csi;
use crate::csi::node_server::Node;

/// Volume attach limit reported by NodeGetInfo.
const MAX_VOLUMES_PER_NODE: i64 = 127;

#[derive(Default)]
struct MountTable {
    /// Volume name to staging path.
    staged: HashMap<String, String>,
    /// Volume name to published target paths.
    published: HashMap<String, HashSet<String>>,
}

/// Node service implementation for one instance.
pub struct NodeService {
    cloud: SimCloud,
    node_id: String,
    zone: String,
    /// Host directory standing in for the node's filesystem root.
    root: PathBuf,
    mounts: RwLock<MountTable>,
}

impl NodeService {
    pub fn new(cloud: SimCloud, zone: &str, node_id: &str, root: PathBuf) -> Self {
        Self {
            cloud,
            node_id: node_id.to_string(),
            zone: zone.to_string(),
            root,
            mounts: RwLock::new(MountTable::default()),
        }
    }

    /// Maps an absolute path on the simulated node to a host path under the
    /// instance root.
    fn host_path(&self, remote: &str) -> PathBuf {
        self.root.join(remote.trim_start_matches('/'))
    }
}

async fn create_dir(path: &Path) -> Result<(), Status> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| Status::internal(format!("create {}: {e}", path.display())))
}

async fn remove_dir_if_present(path: &Path) -> Result<(), Status> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Status::internal(format!("remove {}: {e}", path.display()))),
    }
}

#[tonic::async_trait]
impl Node for NodeService {
    async fn node_stage_volume(
        &self,
        request: Request<csi::NodeStageVolumeRequest>,
    ) -> Result<Response<csi::NodeStageVolumeResponse>, Status> {
        let request = request.into_inner();
        debug!(volume_id = %request.volume_id, path = %request.staging_target_path, "NodeStageVolume called");

        if request.volume_id.is_empty() {
            return Err(Status::invalid_argument(
                "NodeStageVolume volume ID is required",
            ));
        }
        if request.staging_target_path.is_empty() {
            return Err(Status::invalid_argument(
                "NodeStageVolume staging target path is required",
            ));
        }
        if request.volume_capability.is_none() {
            return Err(Status::invalid_argument(
                "NodeStageVolume volume capability is required",
            ));
        }
        if request
            .publish_context
            .get(DEVICE_PATH_KEY)
            .is_none_or(|path| path.is_empty())
        {
            return Err(Status::invalid_argument(format!(
                "NodeStageVolume publish context is missing {DEVICE_PATH_KEY}"
            )));
        }
        let id = parse_volume_id(&request.volume_id).ok_or_else(|| {
            Status::invalid_argument(format!("volume ID '{}' is invalid", request.volume_id))
        })?;

        if !self.cloud.is_attached(&self.node_id, id.name()).await {
            return Err(Status::failed_precondition(format!(
                "volume '{}' is not attached to node '{}'",
                request.volume_id, self.node_id
            )));
        }

        let mut mounts = self.mounts.write().await;
        match mounts.staged.get(id.name()) {
            Some(existing) if existing == &request.staging_target_path => {
                debug!(volume_id = %request.volume_id, "Volume already staged");
                return Ok(Response::new(csi::NodeStageVolumeResponse {}));
            }
            Some(existing) => {
                return Err(Status::failed_precondition(format!(
                    "volume '{}' is already staged at '{existing}'",
                    request.volume_id
                )));
            }
            None => {}
        }

        create_dir(&self.host_path(&request.staging_target_path)).await?;
        mounts
            .staged
            .insert(id.name().to_string(), request.staging_target_path.clone());
        info!(volume_id = %request.volume_id, path = %request.staging_target_path, "Staged volume");
        Ok(Response::new(csi::NodeStageVolumeResponse {}))
    }

    async fn node_unstage_volume(
        &self,
        request: Request<csi::NodeUnstageVolumeRequest>,
    ) -> Result<Response<csi::NodeUnstageVolumeResponse>, Status> {
        let request = request.into_inner();
        debug!(volume_id = %request.volume_id, path = %request.staging_target_path, "NodeUnstageVolume called");

        if request.volume_id.is_empty() {
            return Err(Status::invalid_argument(
                "NodeUnstageVolume volume ID is required",
            ));
        }
        if request.staging_target_path.is_empty() {
            return Err(Status::invalid_argument(
                "NodeUnstageVolume staging target path is required",
            ));
        }
        let Some(id) = parse_volume_id(&request.volume_id) else {
            warn!(volume_id = %request.volume_id, "NodeUnstageVolume with malformed ID, treating as unstaged");
            return Ok(Response::new(csi::NodeUnstageVolumeResponse {}));
        };

        let mut mounts = self.mounts.write().await;
        if mounts
            .published
            .get(id.name())
            .is_some_and(|targets| !targets.is_empty())
        {
            return Err(Status::failed_precondition(format!(
                "volume '{}' is still published",
                request.volume_id
            )));
        }
        if mounts.staged.get(id.name()) == Some(&request.staging_target_path) {
            mounts.staged.remove(id.name());
        }
        remove_dir_if_present(&self.host_path(&request.staging_target_path)).await?;
        info!(volume_id = %request.volume_id, "Unstaged volume");
        Ok(Response::new(csi::NodeUnstageVolumeResponse {}))
    }

    async fn node_publish_volume(
        &self,
        request: Request<csi::NodePublishVolumeRequest>,
    ) -> Result<Response<csi::NodePublishVolumeResponse>, Status> {
        let request = request.into_inner();
        debug!(volume_id = %request.volume_id, path = %request.target_path, "NodePublishVolume called");

        if request.volume_id.is_empty() {
            return Err(Status::invalid_argument(
                "NodePublishVolume volume ID is required",
            ));
        }
        if request.target_path.is_empty() {
            return Err(Status::invalid_argument(
                "NodePublishVolume target path is required",
            ));
        }
        if request.staging_target_path.is_empty() {
            return Err(Status::invalid_argument(
                "NodePublishVolume staging target path is required",
            ));
        }
        if request.volume_capability.is_none() {
            return Err(Status::invalid_argument(
                "NodePublishVolume volume capability is required",
            ));
        }
        let id = parse_volume_id(&request.volume_id).ok_or_else(|| {
            Status::invalid_argument(format!("volume ID '{}' is invalid", request.volume_id))
        })?;

        let mut mounts = self.mounts.write().await;
        if mounts.staged.get(id.name()) != Some(&request.staging_target_path) {
            return Err(Status::failed_precondition(format!(
                "volume '{}' is not staged at '{}'",
                request.volume_id, request.staging_target_path
            )));
        }
        let targets = mounts.published.entry(id.name().to_string()).or_default();
        if targets.contains(&request.target_path) {
            debug!(volume_id = %request.volume_id, "Volume already published");
            return Ok(Response::new(csi::NodePublishVolumeResponse {}));
        }

        create_dir(&self.host_path(&request.target_path)).await?;
        targets.insert(request.target_path.clone());
        info!(volume_id = %request.volume_id, path = %request.target_path, readonly = request.readonly, "Published volume");
        Ok(Response::new(csi::NodePublishVolumeResponse {}))
    }

    async fn node_unpublish_volume(
        &self,
        request: Request<csi::NodeUnpublishVolumeRequest>,
    ) -> Result<Response<csi::NodeUnpublishVolumeResponse>, Status> {
        let request = request.into_inner();
        debug!(volume_id = %request.volume_id, path = %request.target_path, "NodeUnpublishVolume called");

        if request.volume_id.is_empty() {
            return Err(Status::invalid_argument(
                "NodeUnpublishVolume volume ID is required",
            ));
        }
        if request.target_path.is_empty() {
            return Err(Status::invalid_argument(
                "NodeUnpublishVolume target path is required",
            ));
        }
        let Some(id) = parse_volume_id(&request.volume_id) else {
            warn!(volume_id = %request.volume_id, "NodeUnpublishVolume with malformed ID, treating as unpublished");
            return Ok(Response::new(csi::NodeUnpublishVolumeResponse {}));
        };

        let mut mounts = self.mounts.write().await;
        if let Some(targets) = mounts.published.get_mut(id.name()) {
            targets.remove(&request.target_path);
            if targets.is_empty() {
                mounts.published.remove(id.name());
            }
        }
        remove_dir_if_present(&self.host_path(&request.target_path)).await?;
        info!(volume_id = %request.volume_id, "Unpublished volume");
        Ok(Response::new(csi::NodeUnpublishVolumeResponse {}))
    }

    async fn node_get_info(
        &self,
        _request: Request<csi::NodeGetInfoRequest>,
    ) -> Result<Response<csi::NodeGetInfoResponse>, Status> {
        debug!("NodeGetInfo called");

        let mut segments = HashMap::new();
        segments.insert(ZONE_TOPOLOGY_KEY.to_string(), self.zone.clone());
        Ok(Response::new(csi::NodeGetInfoResponse {
            node_id: self.node_id.clone(),
            max_volumes_per_node: MAX_VOLUMES_PER_NODE,
            accessible_topology: Some(csi::Topology { segments }),
        }))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::zonal_volume_id;
    use tonic::Code;

    const ZONE: &str = "us-central1-a";
    const NODE: &str = "vm-1";
    const DISK: &str = "disk-1";

    async fn service() -> (NodeService, SimCloud, tempfile::TempDir) {
        let cloud = SimCloud::new("test-project", &[ZONE, "us-central1-b"]);
        cloud.register_instance(ZONE, NODE).await.unwrap();
        let root = tempfile::tempdir().unwrap();
        let node = NodeService::new(cloud.clone(), ZONE, NODE, root.path().to_path_buf());
        (node, cloud, root)
    }

    async fn attached_service() -> (NodeService, SimCloud, tempfile::TempDir) {
        let (node, cloud, root) = service().await;
        cloud
            .create_zonal_disk(ZONE, DISK, "pd-standard", 10)
            .await
            .unwrap();
        cloud.attach(NODE, DISK).await.unwrap();
        (node, cloud, root)
    }

    fn volume_id() -> String {
        zonal_volume_id("test-project", ZONE, DISK)
    }

    fn mount_capability() -> Option<csi::VolumeCapability> {
        Some(csi::VolumeCapability {
            access_type: Some(csi::volume_capability::AccessType::Mount(
                csi::volume_capability::MountVolume {
                    fs_type: String::new(),
                    mount_flags: Vec::new(),
                },
            )),
            access_mode: Some(csi::volume_capability::AccessMode {
                mode: csi::volume_capability::access_mode::Mode::SingleNodeWriter as i32,
            }),
        })
    }

    fn publish_context() -> HashMap<String, String> {
        let mut context = HashMap::new();
        context.insert(
            DEVICE_PATH_KEY.to_string(),
            format!("/dev/disk/by-id/google-{DISK}"),
        );
        context
    }

    fn stage_request(path: &str) -> Request<csi::NodeStageVolumeRequest> {
        Request::new(csi::NodeStageVolumeRequest {
            volume_id: volume_id(),
            publish_context: publish_context(),
            staging_target_path: path.to_string(),
            volume_capability: mount_capability(),
            secrets: HashMap::new(),
            volume_context: HashMap::new(),
        })
    }

    fn publish_request(staging: &str, target: &str) -> Request<csi::NodePublishVolumeRequest> {
        Request::new(csi::NodePublishVolumeRequest {
            volume_id: volume_id(),
            publish_context: publish_context(),
            staging_target_path: staging.to_string(),
            target_path: target.to_string(),
            volume_capability: mount_capability(),
            readonly: false,
            secrets: HashMap::new(),
            volume_context: HashMap::new(),
        })
    }

    // ========================================================================
    // Staging
    // ========================================================================

    #[tokio::test]
    async fn stage_requires_cloud_attachment() {
        let (node, cloud, _root) = service().await;
        cloud
            .create_zonal_disk(ZONE, DISK, "pd-standard", 10)
            .await
            .unwrap();

        let err = Node::node_stage_volume(&node, stage_request("/staging/disk-1"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::FailedPrecondition);
    }

    #[tokio::test]
    async fn stage_creates_directory_and_is_idempotent() {
        let (node, _cloud, root) = attached_service().await;

        Node::node_stage_volume(&node, stage_request("/staging/disk-1"))
            .await
            .unwrap();
        assert!(root.path().join("staging/disk-1").is_dir());

        // Same path again succeeds, a different path is refused.
        Node::node_stage_volume(&node, stage_request("/staging/disk-1"))
            .await
            .unwrap();
        let err = Node::node_stage_volume(&node, stage_request("/elsewhere/disk-1"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::FailedPrecondition);
    }

    #[tokio::test]
    async fn stage_requires_device_path_in_publish_context() {
        let (node, _cloud, _root) = attached_service().await;

        let mut request = csi::NodeStageVolumeRequest {
            volume_id: volume_id(),
            publish_context: HashMap::new(),
            staging_target_path: "/staging/disk-1".to_string(),
            volume_capability: mount_capability(),
            secrets: HashMap::new(),
            volume_context: HashMap::new(),
        };
        let err = Node::node_stage_volume(&node, Request::new(request.clone()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);

        request.publish_context.insert(DEVICE_PATH_KEY.to_string(), String::new());
        let err = Node::node_stage_volume(&node, Request::new(request))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    // ========================================================================
    // Publishing
    // ========================================================================

    #[tokio::test]
    async fn publish_requires_prior_stage() {
        let (node, _cloud, _root) = attached_service().await;

        let err = Node::node_publish_volume(&node, publish_request("/staging/disk-1", "/mount/disk-1"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::FailedPrecondition);
    }

    #[tokio::test]
    async fn full_stage_publish_unpublish_unstage_cycle() {
        let (node, _cloud, root) = attached_service().await;

        Node::node_stage_volume(&node, stage_request("/staging/disk-1"))
            .await
            .unwrap();
        Node::node_publish_volume(&node, publish_request("/staging/disk-1", "/mount/disk-1"))
            .await
            .unwrap();
        assert!(root.path().join("mount/disk-1").is_dir());

        // Unstaging while published is refused.
        let err = Node::node_unstage_volume(
            &node,
            Request::new(csi::NodeUnstageVolumeRequest {
                volume_id: volume_id(),
                staging_target_path: "/staging/disk-1".to_string(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), Code::FailedPrecondition);

        Node::node_unpublish_volume(
            &node,
            Request::new(csi::NodeUnpublishVolumeRequest {
                volume_id: volume_id(),
                target_path: "/mount/disk-1".to_string(),
            }),
        )
        .await
        .unwrap();
        assert!(!root.path().join("mount/disk-1").exists());

        Node::node_unstage_volume(
            &node,
            Request::new(csi::NodeUnstageVolumeRequest {
                volume_id: volume_id(),
                staging_target_path: "/staging/disk-1".to_string(),
            }),
        )
        .await
        .unwrap();
        assert!(!root.path().join("staging/disk-1").exists());

        // Both inverses are idempotent.
        Node::node_unpublish_volume(
            &node,
            Request::new(csi::NodeUnpublishVolumeRequest {
                volume_id: volume_id(),
                target_path: "/mount/disk-1".to_string(),
            }),
        )
        .await
        .unwrap();
        Node::node_unstage_volume(
            &node,
            Request::new(csi::NodeUnstageVolumeRequest {
                volume_id: volume_id(),
                staging_target_path: "/staging/disk-1".to_string(),
            }),
        )
        .await
        .unwrap();
    }

    // ========================================================================
    // Node info
    // ========================================================================

    #[tokio::test]
    async fn node_info_reports_zone_topology() {
        let (node, _cloud, _root) = service().await;

        let info = Node::node_get_info(&node, Request::new(csi::NodeGetInfoRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(info.node_id, NODE);
        let topology = info.accessible_topology.unwrap();
        assert_eq!(
            topology.segments.get(ZONE_TOPOLOGY_KEY),
            Some(&ZONE.to_string())
        );
    }
}
