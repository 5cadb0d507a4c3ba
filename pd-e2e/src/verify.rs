//! Backend cross-checks for provisioned disks.
//!
//! After the driver claims success the harness goes around it and asks the
//! compute backend directly. Creation checks poll until the disk settles
//! into `READY` within a bounded window; absence checks poll until the
//! backend reports NOT_FOUND. Both windows use the configured settle
//! budget, so eventual consistency is tolerated but never unbounded.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::compute::{CloudDisk, ComputeBackend, ComputeError, READY_STATUS, resource_tail};
use crate::error::VerifyError;
use crate::zones;

/// Where a disk is expected to live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiskPlacement {
    Zonal { zone: String },
    Regional { region: String },
}

/// Everything the backend must agree on for one disk.
#[derive(Debug, Clone)]
pub struct DiskExpectation {
    pub name: String,
    pub size_gb: i64,
    pub disk_type: String,
    pub placement: DiskPlacement,
}

impl DiskExpectation {
    pub fn zonal(name: &str, size_gb: i64, disk_type: &str, zone: &str) -> Self {
        Self {
            name: name.to_string(),
            size_gb,
            disk_type: disk_type.to_string(),
            placement: DiskPlacement::Zonal {
                zone: zone.to_string(),
            },
        }
    }

    pub fn regional(name: &str, size_gb: i64, disk_type: &str, region: &str) -> Self {
        Self {
            name: name.to_string(),
            size_gb,
            disk_type: disk_type.to_string(),
            placement: DiskPlacement::Regional {
                region: region.to_string(),
            },
        }
    }
}

/// Compares one backend record against an expectation.
///
/// Resource URLs are compared by their last path segment; the disk type
/// only has to contain the expected token, since the backend reports it as
/// a full `diskTypes/...` URL.
pub fn check_disk(disk: &CloudDisk, expectation: &DiskExpectation) -> Result<(), VerifyError> {
    let mismatch = |field: &'static str, expected: String, actual: String| {
        Err(VerifyError::Mismatch {
            name: expectation.name.clone(),
            field,
            expected,
            actual,
        })
    };

    if disk.name != expectation.name {
        return mismatch("name", expectation.name.clone(), disk.name.clone());
    }
    if disk.status != READY_STATUS {
        return mismatch("status", READY_STATUS.to_string(), disk.status.clone());
    }
    if disk.size_gb != expectation.size_gb {
        return mismatch(
            "sizeGb",
            expectation.size_gb.to_string(),
            disk.size_gb.to_string(),
        );
    }
    if !disk.disk_type.contains(&expectation.disk_type) {
        return mismatch("type", expectation.disk_type.clone(), disk.disk_type.clone());
    }

    match &expectation.placement {
        DiskPlacement::Zonal { zone } => {
            let actual = disk.zone.as_deref().map(resource_tail).unwrap_or("");
            if actual != zone {
                return mismatch("zone", zone.clone(), actual.to_string());
            }
        }
        DiskPlacement::Regional { region } => {
            if disk.replica_zones.len() != 2 {
                return mismatch(
                    "replicaZones",
                    "2 replica zones".to_string(),
                    disk.replica_zones.len().to_string(),
                );
            }
            // Each replica zone must independently resolve to the region.
            let derived =
                zones::common_region(disk.replica_zones.iter().map(|url| resource_tail(url)))
                    .map_err(|error| VerifyError::Mismatch {
                        name: expectation.name.clone(),
                        field: "replicaZones",
                        expected: region.clone(),
                        actual: error.to_string(),
                    })?;
            if derived != *region {
                return mismatch("replicaZones", region.clone(), derived);
            }
        }
    }

    Ok(())
}

/// Polls the backend on behalf of scenarios.
#[derive(Clone)]
pub struct Verifier {
    backend: Arc<dyn ComputeBackend>,
    settle_timeout: Duration,
    poll_interval: Duration,
}

impl Verifier {
    pub fn new(
        backend: Arc<dyn ComputeBackend>,
        settle_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            backend,
            settle_timeout,
            poll_interval,
        }
    }

    async fn fetch(
        &self,
        project: &str,
        placement: &DiskPlacement,
        name: &str,
    ) -> Result<CloudDisk, ComputeError> {
        match placement {
            DiskPlacement::Zonal { zone } => self.backend.fetch_disk(project, zone, name).await,
            DiskPlacement::Regional { region } => {
                self.backend.fetch_region_disk(project, region, name).await
            }
        }
    }

    /// Waits for the disk to exist and reach `READY`, then checks every
    /// expected field. NOT_FOUND and non-ready status keep polling until
    /// the settle budget runs out; any other backend failure is terminal.
    pub async fn await_disk(
        &self,
        project: &str,
        expectation: &DiskExpectation,
    ) -> Result<CloudDisk, VerifyError> {
        let started = Instant::now();
        let mut last = "never fetched".to_string();
        loop {
            match self
                .fetch(project, &expectation.placement, &expectation.name)
                .await
            {
                Ok(disk) if disk.status == READY_STATUS => {
                    check_disk(&disk, expectation)?;
                    info!(
                        disk = %expectation.name,
                        waited = ?started.elapsed(),
                        "Disk settled and matches expectation"
                    );
                    return Ok(disk);
                }
                Ok(disk) => {
                    debug!(disk = %expectation.name, status = %disk.status, "Disk not ready yet");
                    last = format!("status is '{}'", disk.status);
                }
                Err(error) if error.is_not_found() => {
                    debug!(disk = %expectation.name, "Disk not visible yet");
                    last = error.to_string();
                }
                Err(error) => return Err(VerifyError::Backend(error)),
            }

            if started.elapsed() >= self.settle_timeout {
                return Err(VerifyError::SettleTimeout {
                    name: expectation.name.clone(),
                    waited: started.elapsed(),
                    last,
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Waits for the backend to stop reporting the disk after deletion.
    pub async fn expect_absent(
        &self,
        project: &str,
        placement: &DiskPlacement,
        name: &str,
    ) -> Result<(), VerifyError> {
        let started = Instant::now();
        loop {
            match self.fetch(project, placement, name).await {
                Err(error) if error.is_not_found() => {
                    info!(disk = %name, waited = ?started.elapsed(), "Disk gone from backend");
                    return Ok(());
                }
                Err(error) => return Err(VerifyError::Backend(error)),
                Ok(_) => debug!(disk = %name, "Disk still reported by backend"),
            }

            if started.elapsed() >= self.settle_timeout {
                return Err(VerifyError::StillPresent {
                    name: name.to_string(),
                    waited: started.elapsed(),
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
