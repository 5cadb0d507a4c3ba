//! Read-only view of disk state in the compute backend.
//!
//! Verification never trusts the driver's answers: every lifecycle step is
//! cross-checked against this independent view. [`ComputeBackend`] is the
//! seam; production code talks to the GCE API through
//! [`crate::gce::GceCompute`], tests supply their own implementation.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer};
use thiserror::Error;

/// Disk status reported by the backend once provisioning has finished.
pub const READY_STATUS: &str = "READY";

#[derive(Error, Debug)]
pub enum ComputeError {
    #[error("disk '{name}' not found in {scope}")]
    NotFound { scope: String, name: String },

    #[error("compute API returned {status} for {url}")]
    Api { status: u16, url: String },

    #[error("compute API request failed: {0}")]
    Http(#[from] reqwest::Error),
}

impl ComputeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ComputeError::NotFound { .. })
    }
}

/// A disk as the backend reports it.
///
/// Resource references (`zone`, `type`, `replicaZones`) come back as full
/// URLs; compare them with [`resource_tail`]. `sizeGb` arrives as a
/// string-encoded int64, as all GCE int64 fields do.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudDisk {
    pub name: String,

    #[serde(rename = "type", default)]
    pub disk_type: String,

    #[serde(default)]
    pub status: String,

    #[serde(default, deserialize_with = "int64_string")]
    pub size_gb: i64,

    #[serde(default)]
    pub zone: Option<String>,

    #[serde(default)]
    pub region: Option<String>,

    #[serde(default)]
    pub replica_zones: Vec<String>,
}

/// Returns the last path segment of a resource URL, or the input unchanged
/// when it contains no slash.
pub fn resource_tail(resource: &str) -> &str {
    resource.rsplit('/').next().unwrap_or(resource)
}

#[async_trait]
pub trait ComputeBackend: Send + Sync {
    /// Fetches a zonal disk.
    async fn fetch_disk(
        &self,
        project: &str,
        zone: &str,
        name: &str,
    ) -> Result<CloudDisk, ComputeError>;

    /// Fetches a regional disk.
    async fn fetch_region_disk(
        &self,
        project: &str,
        region: &str,
        name: &str,
    ) -> Result<CloudDisk, ComputeError>;
}

fn int64_string<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    struct Int64Visitor;

    impl serde::de::Visitor<'_> for Int64Visitor {
        type Value = i64;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("an integer or a string-encoded integer")
        }

        fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<i64, E> {
            Ok(v)
        }

        fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<i64, E> {
            i64::try_from(v).map_err(E::custom)
        }

        fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<i64, E> {
            v.parse().map_err(E::custom)
        }
    }

    deserializer.deserialize_any(Int64Visitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_gce_disk_payload() {
        let body = r#"{
            "name": "pd-e2e-test",
            "sizeGb": "5",
            "status": "READY",
            "type": "https://www.googleapis.com/compute/v1/projects/p/zones/us-central1-a/diskTypes/pd-standard",
            "zone": "https://www.googleapis.com/compute/v1/projects/p/zones/us-central1-a"
        }"#;

        let disk: CloudDisk = serde_json::from_str(body).unwrap();
        assert_eq!(disk.name, "pd-e2e-test");
        assert_eq!(disk.size_gb, 5);
        assert_eq!(disk.status, READY_STATUS);
        assert!(disk.disk_type.contains("pd-standard"));
        assert_eq!(resource_tail(disk.zone.as_deref().unwrap()), "us-central1-a");
        assert!(disk.replica_zones.is_empty());
    }

    #[test]
    fn deserializes_regional_disk_payload() {
        let body = r#"{
            "name": "pd-e2e-regional",
            "sizeGb": 5,
            "status": "READY",
            "region": "https://www.googleapis.com/compute/beta/projects/p/regions/us-central1",
            "replicaZones": [
                "https://www.googleapis.com/compute/beta/projects/p/zones/us-central1-a",
                "https://www.googleapis.com/compute/beta/projects/p/zones/us-central1-b"
            ]
        }"#;

        let disk: CloudDisk = serde_json::from_str(body).unwrap();
        assert_eq!(disk.size_gb, 5);
        assert_eq!(disk.replica_zones.len(), 2);
        assert_eq!(resource_tail(&disk.replica_zones[1]), "us-central1-b");
    }

    #[test]
    fn resource_tail_handles_bare_names() {
        assert_eq!(resource_tail("us-central1-a"), "us-central1-a");
        assert_eq!(resource_tail("a/b/c"), "c");
    }
}
