//! In-memory model of the cloud side: disks, attachments, instances.
//!
//! One [`SimCloud`] plays the role of a project. The Controller and Node
//! services mutate it through the methods here, and the harness observes it
//! through the [`ComputeBackend`] implementation at the bottom, exactly as
//! it would observe the real API.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

use pd_e2e::compute::{CloudDisk, ComputeBackend, ComputeError, READY_STATUS};
use pd_e2e::zones::region_from_zone;

/// Prefix for the resource URLs the simulated API hands back.
const API_ROOT: &str = "https://www.googleapis.com/compute/v1";

/// Status reported while a freshly created disk is still settling.
pub const CREATING_STATUS: &str = "CREATING";

#[derive(Error, Debug)]
pub enum SimCloudError {
    #[error("disk '{0}' not found")]
    DiskNotFound(String),

    #[error("disk '{0}' already exists with different properties")]
    DiskConflict(String),

    #[error("an operation on '{0}' is already in progress")]
    OperationPending(String),

    #[error("zone '{0}' is not part of this cloud")]
    UnknownZone(String),

    #[error("instance '{0}' not found")]
    UnknownInstance(String),

    #[error("disk '{disk}' is attached to instance '{instance}'")]
    DiskInUse { disk: String, instance: String },

    #[error("disk '{disk}' is already attached to instance '{instance}'")]
    AlreadyAttached { disk: String, instance: String },

    #[error("regional disks need at least two zones, cloud has {0}")]
    NotEnoughZones(usize),
}

/// Where a disk's data lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    Zonal(String),
    Regional {
        region: String,
        replica_zones: Vec<String>,
    },
}

/// One disk as the cloud tracks it.
#[derive(Debug, Clone)]
pub struct DiskRecord {
    pub name: String,
    /// Bare type token, e.g. `pd-standard`.
    pub disk_type: String,
    pub size_gb: i64,
    pub placement: Placement,
    pub attached_to: Option<String>,
    created_at: Instant,
}

#[derive(Default)]
struct CloudState {
    /// Disks by name. Names are unique across the project, matching the API.
    disks: HashMap<String, DiskRecord>,
    /// Instance name to zone.
    instances: HashMap<String, String>,
}

/// Shared, clonable handle to one simulated project.
#[derive(Clone)]
pub struct SimCloud {
    project: String,
    zones: Vec<String>,
    /// How long a new disk reports CREATING before turning READY.
    settle: Duration,
    /// How long mutating operations stay pending before taking effect.
    op_hold: Duration,
    state: Arc<RwLock<CloudState>>,
    pending: Arc<Mutex<HashSet<String>>>,
}

impl SimCloud {
    pub fn new(project: &str, zones: &[&str]) -> Self {
        Self {
            project: project.to_string(),
            zones: zones.iter().map(|z| z.to_string()).collect(),
            settle: Duration::ZERO,
            op_hold: Duration::ZERO,
            state: Arc::new(RwLock::new(CloudState::default())),
            pending: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    pub fn with_op_hold(mut self, op_hold: Duration) -> Self {
        self.op_hold = op_hold;
        self
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn zones(&self) -> &[String] {
        &self.zones
    }

    pub fn operation_hold(&self) -> Duration {
        self.op_hold
    }

    /// Marks `name` busy until the returned guard drops. A second call for
    /// the same name while the guard lives fails with `OperationPending`.
    pub fn begin_operation(&self, name: &str) -> Result<OperationGuard, SimCloudError> {
        let mut pending = lock(&self.pending);
        if !pending.insert(name.to_string()) {
            return Err(SimCloudError::OperationPending(name.to_string()));
        }
        Ok(OperationGuard {
            pending: Arc::clone(&self.pending),
            name: name.to_string(),
        })
    }

    /// Adds (or re-adds) an instance in `zone`. Registration is idempotent;
    /// relaunching a driver on the same instance must not fail.
    pub async fn register_instance(&self, zone: &str, name: &str) -> Result<(), SimCloudError> {
        if !self.zones.iter().any(|z| z == zone) {
            return Err(SimCloudError::UnknownZone(zone.to_string()));
        }
        let mut state = self.state.write().await;
        state.instances.insert(name.to_string(), zone.to_string());
        Ok(())
    }

    /// Creates a zonal disk. Re-creating an identical disk returns the
    /// existing record; a name collision with different properties is a
    /// conflict.
    pub async fn create_zonal_disk(
        &self,
        zone: &str,
        name: &str,
        disk_type: &str,
        size_gb: i64,
    ) -> Result<DiskRecord, SimCloudError> {
        if !self.zones.iter().any(|z| z == zone) {
            return Err(SimCloudError::UnknownZone(zone.to_string()));
        }
        let placement = Placement::Zonal(zone.to_string());
        self.create_disk(name, disk_type, size_gb, placement).await
    }

    /// Creates a regional disk replicated across the first two configured
    /// zones, with the same idempotency rules as zonal creation.
    pub async fn create_regional_disk(
        &self,
        name: &str,
        disk_type: &str,
        size_gb: i64,
    ) -> Result<DiskRecord, SimCloudError> {
        if self.zones.len() < 2 {
            return Err(SimCloudError::NotEnoughZones(self.zones.len()));
        }
        let region = region_from_zone(&self.zones[0])
            .map_err(|_| SimCloudError::UnknownZone(self.zones[0].clone()))?;
        let placement = Placement::Regional {
            region,
            replica_zones: vec![self.zones[0].clone(), self.zones[1].clone()],
        };
        self.create_disk(name, disk_type, size_gb, placement).await
    }

    async fn create_disk(
        &self,
        name: &str,
        disk_type: &str,
        size_gb: i64,
        placement: Placement,
    ) -> Result<DiskRecord, SimCloudError> {
        let mut state = self.state.write().await;
        if let Some(existing) = state.disks.get(name) {
            let identical = existing.size_gb == size_gb
                && existing.disk_type == disk_type
                && existing.placement == placement;
            return if identical {
                Ok(existing.clone())
            } else {
                Err(SimCloudError::DiskConflict(name.to_string()))
            };
        }
        let record = DiskRecord {
            name: name.to_string(),
            disk_type: disk_type.to_string(),
            size_gb,
            placement,
            attached_to: None,
            created_at: Instant::now(),
        };
        state.disks.insert(name.to_string(), record.clone());
        debug!(disk = name, size_gb, "Created disk");
        Ok(record)
    }

    /// Deletes a disk. Absent disks are fine (`Ok(false)`); attached disks
    /// refuse to go.
    pub async fn delete_disk(&self, name: &str) -> Result<bool, SimCloudError> {
        let mut state = self.state.write().await;
        match state.disks.get(name) {
            None => Ok(false),
            Some(disk) => {
                if let Some(instance) = &disk.attached_to {
                    return Err(SimCloudError::DiskInUse {
                        disk: name.to_string(),
                        instance: instance.clone(),
                    });
                }
                state.disks.remove(name);
                debug!(disk = name, "Deleted disk");
                Ok(true)
            }
        }
    }

    /// Attaches `disk_name` to `instance`. Attaching to the instance the
    /// disk is already on is a no-op; attaching to a second instance fails.
    pub async fn attach(&self, instance: &str, disk_name: &str) -> Result<(), SimCloudError> {
        let mut state = self.state.write().await;
        if !state.instances.contains_key(instance) {
            return Err(SimCloudError::UnknownInstance(instance.to_string()));
        }
        let disk = state
            .disks
            .get_mut(disk_name)
            .ok_or_else(|| SimCloudError::DiskNotFound(disk_name.to_string()))?;
        match &disk.attached_to {
            Some(current) if current == instance => Ok(()),
            Some(current) => Err(SimCloudError::AlreadyAttached {
                disk: disk_name.to_string(),
                instance: current.clone(),
            }),
            None => {
                disk.attached_to = Some(instance.to_string());
                debug!(disk = disk_name, instance, "Attached disk");
                Ok(())
            }
        }
    }

    /// Detaches `disk_name` from `instance`. Missing disks and disks not
    /// attached to this instance both succeed silently.
    pub async fn detach(&self, instance: &str, disk_name: &str) -> Result<(), SimCloudError> {
        let mut state = self.state.write().await;
        if let Some(disk) = state.disks.get_mut(disk_name) {
            if disk.attached_to.as_deref() == Some(instance) {
                disk.attached_to = None;
                debug!(disk = disk_name, instance, "Detached disk");
            }
        }
        Ok(())
    }

    pub async fn is_attached(&self, instance: &str, disk_name: &str) -> bool {
        let state = self.state.read().await;
        state
            .disks
            .get(disk_name)
            .is_some_and(|d| d.attached_to.as_deref() == Some(instance))
    }

    pub async fn disk(&self, name: &str) -> Option<DiskRecord> {
        let state = self.state.read().await;
        state.disks.get(name).cloned()
    }

    fn status_of(&self, record: &DiskRecord) -> &'static str {
        if record.created_at.elapsed() >= self.settle {
            READY_STATUS
        } else {
            CREATING_STATUS
        }
    }

    fn zone_url(&self, zone: &str) -> String {
        format!("{API_ROOT}/projects/{}/zones/{zone}", self.project)
    }

    fn region_url(&self, region: &str) -> String {
        format!("{API_ROOT}/projects/{}/regions/{region}", self.project)
    }

    /// Renders a record the way the API would: resource references as full
    /// URLs, status derived from age.
    fn to_cloud_disk(&self, record: &DiskRecord) -> CloudDisk {
        let status = self.status_of(record).to_string();
        match &record.placement {
            Placement::Zonal(zone) => CloudDisk {
                name: record.name.clone(),
                disk_type: format!("{}/diskTypes/{}", self.zone_url(zone), record.disk_type),
                status,
                size_gb: record.size_gb,
                zone: Some(self.zone_url(zone)),
                region: None,
                replica_zones: Vec::new(),
            },
            Placement::Regional {
                region,
                replica_zones,
            } => CloudDisk {
                name: record.name.clone(),
                disk_type: format!("{}/diskTypes/{}", self.region_url(region), record.disk_type),
                status,
                size_gb: record.size_gb,
                zone: None,
                region: Some(self.region_url(region)),
                replica_zones: replica_zones.iter().map(|z| self.zone_url(z)).collect(),
            },
        }
    }
}

/// Releases the pending-operation slot for a volume name on drop.
pub struct OperationGuard {
    pending: Arc<Mutex<HashSet<String>>>,
    name: String,
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        lock(&self.pending).remove(&self.name);
    }
}

fn lock(pending: &Mutex<HashSet<String>>) -> std::sync::MutexGuard<'_, HashSet<String>> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl ComputeBackend for SimCloud {
    async fn fetch_disk(
        &self,
        project: &str,
        zone: &str,
        name: &str,
    ) -> Result<CloudDisk, ComputeError> {
        let not_found = || ComputeError::NotFound {
            scope: format!("{project}/{zone}"),
            name: name.to_string(),
        };
        if project != self.project {
            return Err(not_found());
        }
        let state = self.state.read().await;
        match state.disks.get(name) {
            Some(record) if record.placement == Placement::Zonal(zone.to_string()) => {
                Ok(self.to_cloud_disk(record))
            }
            _ => Err(not_found()),
        }
    }

    async fn fetch_region_disk(
        &self,
        project: &str,
        region: &str,
        name: &str,
    ) -> Result<CloudDisk, ComputeError> {
        let not_found = || ComputeError::NotFound {
            scope: format!("{project}/{region}"),
            name: name.to_string(),
        };
        if project != self.project {
            return Err(not_found());
        }
        let state = self.state.read().await;
        match state.disks.get(name) {
            Some(record)
                if matches!(&record.placement, Placement::Regional { region: r, .. } if r == region) =>
            {
                Ok(self.to_cloud_disk(record))
            }
            _ => Err(not_found()),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
