//! Typed client over the CSI Identity, Controller, and Node services.
//!
//! Calls are issued exactly once: a flake is a finding, so nothing here
//! retries. Each method builds the proto request, dispatches it with the
//! channel's bounded timeouts, and maps the status into the harness error
//! taxonomy.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use tonic::transport::{Channel, Endpoint};
use tracing::debug;
use uuid::Uuid;

use crate::csi::{
    self, controller_client::ControllerClient, identity_client::IdentityClient,
    node_client::NodeClient,
};
use crate::error::{ProtocolError, SetupError};

pub const GIB: i64 = 1024 * 1024 * 1024;

/// Prefix on every volume this harness creates, so leaked disks are
/// attributable.
pub const VOLUME_NAME_PREFIX: &str = "pd-e2e";

/// `CreateVolume` parameter selecting the disk type.
pub const DISK_TYPE_PARAMETER: &str = "type";

/// `CreateVolume` parameter selecting the replication mode.
pub const REPLICATION_PARAMETER: &str = "replication-type";

/// Replication mode for a disk replicated across two zones of a region.
pub const REPLICATION_REGIONAL: &str = "regional-pd";

pub fn gib_bytes(size_gb: i64) -> i64 {
    size_gb * GIB
}

/// A fresh, attributable, collision-free volume name.
pub fn unique_volume_name() -> String {
    format!("{}-{}", VOLUME_NAME_PREFIX, Uuid::new_v4())
}

/// Opaque driver-issued volume identifier.
///
/// GCE PD drivers shape it like `projects/{p}/zones/{z}/disks/{name}`, but
/// the harness never parses it; the handle is threaded back verbatim into
/// every later call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VolumeHandle(String);

impl VolumeHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for VolumeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// What to ask the driver for.
#[derive(Debug, Clone)]
pub struct VolumeRequest {
    pub name: String,
    pub size_gb: i64,
    pub parameters: HashMap<String, String>,
    pub accessibility: Option<csi::TopologyRequirement>,
}

impl VolumeRequest {
    pub fn new(name: impl Into<String>, size_gb: i64) -> Self {
        Self {
            name: name.into(),
            size_gb,
            parameters: HashMap::new(),
            accessibility: None,
        }
    }

    pub fn parameter(mut self, key: &str, value: &str) -> Self {
        self.parameters.insert(key.to_string(), value.to_string());
        self
    }

    pub fn disk_type(self, disk_type: &str) -> Self {
        self.parameter(DISK_TYPE_PARAMETER, disk_type)
    }

    pub fn regional(self) -> Self {
        self.parameter(REPLICATION_PARAMETER, REPLICATION_REGIONAL)
    }

    pub fn topology(mut self, requirement: csi::TopologyRequirement) -> Self {
        self.accessibility = Some(requirement);
        self
    }
}

/// A volume as the driver reported it at creation.
#[derive(Debug, Clone)]
pub struct CreatedVolume {
    pub handle: VolumeHandle,
    pub capacity_bytes: i64,
    pub volume_context: HashMap<String, String>,
}

/// Node identity and placement reported by `NodeGetInfo`.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub node_id: String,
    pub zone: Option<String>,
}

/// Connection and readiness budgets. Every wire call inherits
/// `call_timeout`, so no protocol step can hang a scenario.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub connect_timeout: Duration,
    pub call_timeout: Duration,
    pub ready_timeout: Duration,
    pub probe_interval: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            call_timeout: Duration::from_secs(30),
            ready_timeout: Duration::from_secs(60),
            probe_interval: Duration::from_secs(1),
        }
    }
}

/// Client wrapper holding one channel shared by all three CSI services.
#[derive(Debug, Clone)]
pub struct DriverClient {
    endpoint: String,
    identity: IdentityClient<Channel>,
    controller: ControllerClient<Channel>,
    node: NodeClient<Channel>,
}

impl DriverClient {
    /// Connect to the driver endpoint with bounded timeouts and keepalives.
    pub async fn connect(endpoint: &str, options: &ConnectOptions) -> Result<Self, SetupError> {
        let connect_error = |source| SetupError::Connect {
            endpoint: endpoint.to_string(),
            source,
        };

        let channel = Endpoint::from_shared(endpoint.to_string())
            .map_err(connect_error)?
            .connect_timeout(options.connect_timeout)
            .timeout(options.call_timeout)
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .tcp_nodelay(true)
            .http2_keep_alive_interval(Duration::from_secs(30))
            .keep_alive_timeout(Duration::from_secs(10))
            .keep_alive_while_idle(true)
            .connect()
            .await
            .map_err(connect_error)?;

        Ok(Self {
            endpoint: endpoint.to_string(),
            identity: IdentityClient::new(channel.clone()),
            controller: ControllerClient::new(channel.clone()),
            node: NodeClient::new(channel),
        })
    }

    /// Builds a client whose channel connects on first use. Tests use this
    /// to exercise guards that must fire before any RPC.
    #[cfg(test)]
    pub(crate) fn connect_lazy(endpoint: &str) -> Self {
        let channel = Endpoint::from_shared(endpoint.to_string())
            .expect("static test endpoint")
            .connect_lazy();
        Self {
            endpoint: endpoint.to_string(),
            identity: IdentityClient::new(channel.clone()),
            controller: ControllerClient::new(channel.clone()),
            node: NodeClient::new(channel),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Polls `Probe` until the driver reports ready or the budget runs out.
    ///
    /// A missing `ready` field counts as ready, per protocol convention for
    /// plugins without readiness reporting. Probe transport failures keep
    /// polling; a driver that is still binding its socket answers later.
    pub async fn wait_ready(
        &mut self,
        ready_timeout: Duration,
        probe_interval: Duration,
    ) -> Result<(), SetupError> {
        let started = Instant::now();
        loop {
            match self.identity.probe(csi::ProbeRequest {}).await {
                Ok(response) => {
                    if response.into_inner().ready.unwrap_or(true) {
                        return Ok(());
                    }
                    debug!(endpoint = %self.endpoint, "Driver probed but not ready yet");
                }
                Err(status) => {
                    debug!(endpoint = %self.endpoint, code = ?status.code(), "Probe failed, driver still starting")
                }
            }
            if started.elapsed() >= ready_timeout {
                return Err(SetupError::NotReady {
                    endpoint: self.endpoint.clone(),
                    waited: started.elapsed(),
                });
            }
            tokio::time::sleep(probe_interval).await;
        }
    }

    /// Returns the driver's advertised name and vendor version.
    pub async fn plugin_info(&mut self) -> Result<(String, String), SetupError> {
        let response = self
            .identity
            .get_plugin_info(csi::GetPluginInfoRequest {})
            .await
            .map_err(|status| SetupError::Rpc {
                op: "GetPluginInfo",
                status: Box::new(status),
            })?
            .into_inner();
        Ok((response.name, response.vendor_version))
    }

    /// Returns the node identity the controller service expects in publish
    /// calls, plus the zone segment if the driver advertises one.
    pub async fn node_info(&mut self) -> Result<NodeInfo, SetupError> {
        let response = self
            .node
            .node_get_info(csi::NodeGetInfoRequest {})
            .await
            .map_err(|status| SetupError::Rpc {
                op: "NodeGetInfo",
                status: Box::new(status),
            })?
            .into_inner();

        let zone = response
            .accessible_topology
            .as_ref()
            .and_then(|topology| topology.segments.get(crate::topology::ZONE_TOPOLOGY_KEY))
            .cloned();
        Ok(NodeInfo {
            node_id: response.node_id,
            zone,
        })
    }

    pub async fn create_volume(
        &mut self,
        request: &VolumeRequest,
    ) -> Result<CreatedVolume, ProtocolError> {
        if request.size_gb <= 0 {
            return Err(ProtocolError::Invalid {
                op: "CreateVolume",
                detail: format!("requested size {} GiB is not positive", request.size_gb),
            });
        }

        let wire_request = csi::CreateVolumeRequest {
            name: request.name.clone(),
            capacity_range: Some(csi::CapacityRange {
                required_bytes: gib_bytes(request.size_gb),
                limit_bytes: 0,
            }),
            volume_capabilities: vec![default_capability(false)],
            parameters: request.parameters.clone(),
            secrets: HashMap::new(),
            accessibility_requirements: request.accessibility.clone(),
        };

        debug!(name = %request.name, size_gb = request.size_gb, "Creating volume");

        let volume = self
            .controller
            .create_volume(wire_request)
            .await
            .map_err(|status| ProtocolError::call("CreateVolume", status))?
            .into_inner()
            .volume
            .ok_or(ProtocolError::Malformed {
                op: "CreateVolume",
                detail: "driver returned no volume".to_string(),
            })?;

        if volume.volume_id.is_empty() {
            return Err(ProtocolError::Malformed {
                op: "CreateVolume",
                detail: "driver returned an empty volume id".to_string(),
            });
        }

        Ok(CreatedVolume {
            handle: VolumeHandle::new(volume.volume_id),
            capacity_bytes: volume.capacity_bytes,
            volume_context: volume.volume_context,
        })
    }

    /// Deletes a volume. NOT_FOUND counts as success so repeated deletes
    /// and delete-after-cleanup converge instead of failing.
    pub async fn delete_volume(&mut self, handle: &VolumeHandle) -> Result<(), ProtocolError> {
        let wire_request = csi::DeleteVolumeRequest {
            volume_id: handle.as_str().to_string(),
            secrets: HashMap::new(),
        };

        debug!(volume_id = %handle, "Deleting volume");

        let result = self.controller.delete_volume(wire_request).await.map(|_| ());
        match tolerate_not_found(result) {
            Ok(true) => {
                debug!(volume_id = %handle, "Volume already absent, delete is a no-op");
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(status) => Err(ProtocolError::call("DeleteVolume", status)),
        }
    }

    /// Attaches the volume to a node and returns the driver's publish
    /// context for the node calls that follow.
    pub async fn controller_publish(
        &mut self,
        handle: &VolumeHandle,
        node_id: &str,
        read_only: bool,
    ) -> Result<HashMap<String, String>, ProtocolError> {
        let wire_request = csi::ControllerPublishVolumeRequest {
            volume_id: handle.as_str().to_string(),
            node_id: node_id.to_string(),
            volume_capability: Some(default_capability(read_only)),
            readonly: read_only,
            secrets: HashMap::new(),
            volume_context: HashMap::new(),
        };

        debug!(volume_id = %handle, node_id, "Publishing volume to controller");

        let response = self
            .controller
            .controller_publish_volume(wire_request)
            .await
            .map_err(|status| ProtocolError::call("ControllerPublishVolume", status))?;
        Ok(response.into_inner().publish_context)
    }

    pub async fn controller_unpublish(
        &mut self,
        handle: &VolumeHandle,
        node_id: &str,
    ) -> Result<(), ProtocolError> {
        let wire_request = csi::ControllerUnpublishVolumeRequest {
            volume_id: handle.as_str().to_string(),
            node_id: node_id.to_string(),
            secrets: HashMap::new(),
        };

        debug!(volume_id = %handle, node_id, "Unpublishing volume from controller");

        self.controller
            .controller_unpublish_volume(wire_request)
            .await
            .map_err(|status| ProtocolError::call("ControllerUnpublishVolume", status))?;
        Ok(())
    }

    pub async fn node_stage(
        &mut self,
        handle: &VolumeHandle,
        staging_path: &str,
        publish_context: &HashMap<String, String>,
        volume_context: &HashMap<String, String>,
    ) -> Result<(), ProtocolError> {
        let wire_request = csi::NodeStageVolumeRequest {
            volume_id: handle.as_str().to_string(),
            publish_context: publish_context.clone(),
            staging_target_path: staging_path.to_string(),
            volume_capability: Some(default_capability(false)),
            secrets: HashMap::new(),
            volume_context: volume_context.clone(),
        };

        debug!(volume_id = %handle, staging_path, "Staging volume");

        self.node
            .node_stage_volume(wire_request)
            .await
            .map_err(|status| ProtocolError::call("NodeStageVolume", status))?;
        Ok(())
    }

    pub async fn node_unstage(
        &mut self,
        handle: &VolumeHandle,
        staging_path: &str,
    ) -> Result<(), ProtocolError> {
        let wire_request = csi::NodeUnstageVolumeRequest {
            volume_id: handle.as_str().to_string(),
            staging_target_path: staging_path.to_string(),
        };

        debug!(volume_id = %handle, staging_path, "Unstaging volume");

        self.node
            .node_unstage_volume(wire_request)
            .await
            .map_err(|status| ProtocolError::call("NodeUnstageVolume", status))?;
        Ok(())
    }

    pub async fn node_publish(
        &mut self,
        handle: &VolumeHandle,
        staging_path: &str,
        target_path: &str,
        read_only: bool,
        publish_context: &HashMap<String, String>,
        volume_context: &HashMap<String, String>,
    ) -> Result<(), ProtocolError> {
        let wire_request = csi::NodePublishVolumeRequest {
            volume_id: handle.as_str().to_string(),
            publish_context: publish_context.clone(),
            staging_target_path: staging_path.to_string(),
            target_path: target_path.to_string(),
            volume_capability: Some(default_capability(read_only)),
            readonly: read_only,
            secrets: HashMap::new(),
            volume_context: volume_context.clone(),
        };

        debug!(volume_id = %handle, target_path, read_only, "Publishing volume on node");

        self.node
            .node_publish_volume(wire_request)
            .await
            .map_err(|status| ProtocolError::call("NodePublishVolume", status))?;
        Ok(())
    }

    pub async fn node_unpublish(
        &mut self,
        handle: &VolumeHandle,
        target_path: &str,
    ) -> Result<(), ProtocolError> {
        let wire_request = csi::NodeUnpublishVolumeRequest {
            volume_id: handle.as_str().to_string(),
            target_path: target_path.to_string(),
        };

        debug!(volume_id = %handle, target_path, "Unpublishing volume on node");

        self.node
            .node_unpublish_volume(wire_request)
            .await
            .map_err(|status| ProtocolError::call("NodeUnpublishVolume", status))?;
        Ok(())
    }
}

/// Mount capability used for every volume the harness provisions. The
/// driver picks the filesystem; read-only runs downgrade the access mode.
fn default_capability(read_only: bool) -> csi::VolumeCapability {
    let mode = if read_only {
        csi::volume_capability::access_mode::Mode::SingleNodeReaderOnly
    } else {
        csi::volume_capability::access_mode::Mode::SingleNodeWriter
    };
    csi::VolumeCapability {
        access_type: Some(csi::volume_capability::AccessType::Mount(
            csi::volume_capability::MountVolume {
                fs_type: String::new(),
                mount_flags: Vec::new(),
            },
        )),
        access_mode: Some(csi::volume_capability::AccessMode { mode: mode as i32 }),
    }
}

/// Collapses NOT_FOUND into success, reporting whether it did.
fn tolerate_not_found(result: Result<(), tonic::Status>) -> Result<bool, tonic::Status> {
    match result {
        Ok(()) => Ok(false),
        Err(status) if status.code() == tonic::Code::NotFound => Ok(true),
        Err(status) => Err(status),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_names_carry_the_harness_prefix() {
        let first = unique_volume_name();
        let second = unique_volume_name();
        assert!(first.starts_with("pd-e2e-"));
        assert_ne!(first, second);
        // GCE resource names cap at 63 characters.
        assert!(first.len() <= 63);
    }

    #[test]
    fn request_builder_collects_parameters() {
        let request = VolumeRequest::new("pd-e2e-abc", 5)
            .disk_type("pd-ssd")
            .regional();
        assert_eq!(
            request.parameters.get(DISK_TYPE_PARAMETER),
            Some(&"pd-ssd".to_string())
        );
        assert_eq!(
            request.parameters.get(REPLICATION_PARAMETER),
            Some(&REPLICATION_REGIONAL.to_string())
        );
        assert!(request.accessibility.is_none());
    }

    #[test]
    fn not_found_collapses_to_success() {
        assert!(!tolerate_not_found(Ok(())).unwrap());
        assert!(tolerate_not_found(Err(tonic::Status::not_found("gone"))).unwrap());
        let err = tolerate_not_found(Err(tonic::Status::internal("boom"))).unwrap_err();
        assert_eq!(err.code(), tonic::Code::Internal);
    }

    #[test]
    fn capability_modes_follow_read_only() {
        let writable = default_capability(false);
        assert_eq!(
            writable.access_mode.unwrap().mode,
            csi::volume_capability::access_mode::Mode::SingleNodeWriter as i32
        );
        let read_only = default_capability(true);
        assert_eq!(
            read_only.access_mode.unwrap().mode,
            csi::volume_capability::access_mode::Mode::SingleNodeReaderOnly as i32
        );
    }

    #[test]
    fn gib_conversion() {
        assert_eq!(gib_bytes(5), 5 * 1024 * 1024 * 1024);
    }
}
