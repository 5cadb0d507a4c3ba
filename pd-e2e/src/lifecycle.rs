//! Volume lifecycle driver.
//!
//! [`ProvisionedVolume`] walks one volume through
//! create -> attach -> stage -> publish and back, enforcing the order
//! client-side: a step called out of sequence fails before any RPC is
//! issued. Every forward transition registers its inverse on the cleanup
//! stack the moment it succeeds, so however a scenario exits, the unwind
//! (unpublish, unstage, detach, delete) is already queued in the right
//! order. The inverse calls are idempotent per the protocol, which makes
//! the explicit detach path and the deferred safety net coexist.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use crate::cleanup::CleanupStack;
use crate::client::{DriverClient, VolumeHandle, VolumeRequest};
use crate::context::TestContext;
use crate::error::{ProtocolError, ScenarioError, TeardownFailure, VerifyError};
use crate::target::Instance;

/// Where volumes are staged on the target.
pub const STAGING_ROOT: &str = "/tmp/pd-e2e/staging";

/// Where volumes are mounted for I/O on the target.
pub const MOUNT_ROOT: &str = "/tmp/pd-e2e/mount";

/// Marker file written under the mount to prove the data path.
pub const MARKER_FILE: &str = "pd-e2e-marker";

/// A unique payload for one write-read check.
pub fn marker_payload() -> String {
    format!("pd-e2e marker {}", Uuid::new_v4())
}

/// How far along the attach path a volume currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttachState {
    Created,
    Attached,
    Staged,
    Published,
}

impl AttachState {
    fn name(self) -> &'static str {
        match self {
            AttachState::Created => "created",
            AttachState::Attached => "attached",
            AttachState::Staged => "staged",
            AttachState::Published => "published",
        }
    }
}

pub struct ProvisionedVolume {
    client: DriverClient,
    instance: Arc<dyn Instance>,
    node_id: String,
    name: String,
    handle: VolumeHandle,
    volume_context: HashMap<String, String>,
    publish_context: HashMap<String, String>,
    state: AttachState,
    read_only: bool,
}

impl ProvisionedVolume {
    /// Creates the volume and registers its deletion on `cleanup` in the
    /// same step.
    pub async fn create(
        context: &TestContext,
        cleanup: &mut CleanupStack,
        request: VolumeRequest,
    ) -> Result<Self, ProtocolError> {
        let mut client = context.client();
        let created = client.create_volume(&request).await?;
        info!(
            name = %request.name,
            volume_id = %created.handle,
            capacity_bytes = created.capacity_bytes,
            "Volume created"
        );

        let mut delete_client = client.clone();
        let delete_handle = created.handle.clone();
        let delete_name = request.name.clone();
        cleanup.defer(format!("delete-volume {}", request.name), async move {
            delete_client
                .delete_volume(&delete_handle)
                .await
                .map_err(|error| TeardownFailure::new("delete-volume", delete_name, error))
        });

        Ok(Self {
            client,
            instance: context.instance().clone(),
            node_id: context.node_id().to_string(),
            name: request.name,
            handle: created.handle,
            volume_context: created.volume_context,
            publish_context: HashMap::new(),
            state: AttachState::Created,
            read_only: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> &VolumeHandle {
        &self.handle
    }

    pub fn staging_path(&self) -> String {
        format!("{}/{}", STAGING_ROOT, self.name)
    }

    pub fn target_path(&self) -> String {
        format!("{}/{}", MOUNT_ROOT, self.name)
    }

    pub fn marker_path(&self) -> String {
        format!("{}/{}", self.target_path(), MARKER_FILE)
    }

    fn expect_state(&self, expected: AttachState, op: &'static str) -> Result<(), ProtocolError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(ProtocolError::OutOfOrder {
                op,
                volume: self.name.clone(),
                state: self.state.name(),
            })
        }
    }

    /// Attaches the volume to this context's node.
    pub async fn attach(&mut self, cleanup: &mut CleanupStack) -> Result<(), ProtocolError> {
        self.expect_state(AttachState::Created, "ControllerPublishVolume")?;
        let publish_context = self
            .client
            .controller_publish(&self.handle, &self.node_id, false)
            .await?;
        info!(volume = %self.name, node_id = %self.node_id, "Volume attached");
        self.publish_context = publish_context;
        self.state = AttachState::Attached;

        let mut client = self.client.clone();
        let handle = self.handle.clone();
        let node_id = self.node_id.clone();
        let name = self.name.clone();
        cleanup.defer(format!("controller-unpublish {}", self.name), async move {
            client
                .controller_unpublish(&handle, &node_id)
                .await
                .map_err(|error| TeardownFailure::new("controller-unpublish", name, error))
        });
        Ok(())
    }

    /// Stages the attached volume at its staging path.
    pub async fn stage(&mut self, cleanup: &mut CleanupStack) -> Result<(), ProtocolError> {
        self.expect_state(AttachState::Attached, "NodeStageVolume")?;
        let staging = self.staging_path();
        self.client
            .node_stage(&self.handle, &staging, &self.publish_context, &self.volume_context)
            .await?;
        info!(volume = %self.name, staging, "Volume staged");
        self.state = AttachState::Staged;

        let mut client = self.client.clone();
        let handle = self.handle.clone();
        let name = self.name.clone();
        cleanup.defer(format!("node-unstage {}", self.name), async move {
            client
                .node_unstage(&handle, &staging)
                .await
                .map_err(|error| TeardownFailure::new("node-unstage", name, error))
        });
        Ok(())
    }

    /// Publishes the staged volume at its mount path.
    pub async fn publish(
        &mut self,
        cleanup: &mut CleanupStack,
        read_only: bool,
    ) -> Result<(), ProtocolError> {
        self.expect_state(AttachState::Staged, "NodePublishVolume")?;
        let staging = self.staging_path();
        let target = self.target_path();
        self.client
            .node_publish(
                &self.handle,
                &staging,
                &target,
                read_only,
                &self.publish_context,
                &self.volume_context,
            )
            .await?;
        info!(volume = %self.name, path = %target, read_only, "Volume published");
        self.state = AttachState::Published;
        self.read_only = read_only;

        let mut client = self.client.clone();
        let handle = self.handle.clone();
        let name = self.name.clone();
        cleanup.defer(format!("node-unpublish {}", self.name), async move {
            client
                .node_unpublish(&handle, &target)
                .await
                .map_err(|error| TeardownFailure::new("node-unpublish", name, error))
        });
        Ok(())
    }

    /// Writes `payload` to the marker file through the target's own I/O
    /// path, not through the driver.
    pub async fn write_marker(&self, payload: &str) -> Result<(), ProtocolError> {
        self.expect_state(AttachState::Published, "write-marker")?;
        if self.read_only {
            return Err(ProtocolError::Invalid {
                op: "write-marker",
                detail: format!("volume '{}' is published read-only", self.name),
            });
        }
        self.instance
            .write_file(&self.marker_path(), payload.as_bytes())
            .await
            .map_err(|source| ProtocolError::Remote {
                op: "write-marker",
                source,
            })
    }

    pub async fn read_marker(&self) -> Result<String, ProtocolError> {
        self.expect_state(AttachState::Published, "read-marker")?;
        let bytes = self
            .instance
            .read_file(&self.marker_path())
            .await
            .map_err(|source| ProtocolError::Remote {
                op: "read-marker",
                source,
            })?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Reads the marker back and compares it byte for byte. A mismatch is
    /// a data-integrity finding, not a protocol failure.
    pub async fn verify_marker(&self, expected: &str) -> Result<(), ScenarioError> {
        let actual = self.read_marker().await?;
        if actual != expected {
            return Err(ScenarioError::Verify(VerifyError::MarkerMismatch {
                path: self.marker_path(),
                expected: expected.to_string(),
                actual,
            }));
        }
        info!(volume = %self.name, "Marker read back intact");
        Ok(())
    }

    /// Unwinds unpublish -> unstage -> detach in strict order, failing
    /// fast. Steps this path does not reach are still covered by the
    /// inverses queued on the cleanup stack.
    pub async fn detach(&mut self) -> Result<(), ProtocolError> {
        if self.state == AttachState::Published {
            let target = self.target_path();
            self.client.node_unpublish(&self.handle, &target).await?;
            info!(volume = %self.name, "Volume unpublished");
            self.state = AttachState::Staged;
        }
        if self.state == AttachState::Staged {
            let staging = self.staging_path();
            self.client.node_unstage(&self.handle, &staging).await?;
            info!(volume = %self.name, "Volume unstaged");
            self.state = AttachState::Attached;
        }
        if self.state == AttachState::Attached {
            self.client
                .controller_unpublish(&self.handle, &self.node_id)
                .await?;
            info!(volume = %self.name, "Volume detached");
            self.state = AttachState::Created;
        }
        Ok(())
    }

    /// Deletes the volume. Rejected client-side while the volume is still
    /// attached anywhere; repeated deletes succeed.
    pub async fn delete(&mut self) -> Result<(), ProtocolError> {
        self.expect_state(AttachState::Created, "DeleteVolume")?;
        self.client.delete_volume(&self.handle).await
    }

    /// The full data-path exercise: attach, stage, publish, prove a write
    /// survives the round trip, then unwind in order. Read-only runs only
    /// prove mountability.
    pub async fn attach_write_read_detach(
        &mut self,
        cleanup: &mut CleanupStack,
        read_only: bool,
    ) -> Result<(), ScenarioError> {
        self.attach(cleanup).await?;
        self.stage(cleanup).await?;
        self.publish(cleanup, read_only).await?;
        if !read_only {
            let payload = marker_payload();
            self.write_marker(&payload).await?;
            self.verify_marker(&payload).await?;
        }
        self.detach().await?;
        Ok(())
    }
}
