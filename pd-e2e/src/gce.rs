//! GCE compute API backend.
//!
//! Strictly read-only: the harness only ever asks the API what a disk
//! looks like, never mutates through it. Zonal disks are fetched from the
//! v1 surface, regional disks from beta, matching where regional PD lives.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;

use crate::compute::{CloudDisk, ComputeBackend, ComputeError};

const DEFAULT_API_ROOT: &str = "https://compute.googleapis.com/compute";

pub struct GceCompute {
    http: reqwest::Client,
    api_root: String,
    access_token: Option<String>,
}

impl GceCompute {
    /// Builds a client against the public API. `access_token` is a bearer
    /// OAuth token; pass `None` only when the API root is an unauthenticated
    /// emulator.
    pub fn new(access_token: Option<String>) -> Result<Self, ComputeError> {
        Self::with_api_root(DEFAULT_API_ROOT, access_token)
    }

    pub fn with_api_root(
        api_root: impl Into<String>,
        access_token: Option<String>,
    ) -> Result<Self, ComputeError> {
        let http = reqwest::ClientBuilder::new()
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            api_root: api_root.into().trim_end_matches('/').to_string(),
            access_token,
        })
    }

    fn disk_url(&self, project: &str, zone: &str, name: &str) -> String {
        format!(
            "{}/v1/projects/{}/zones/{}/disks/{}",
            self.api_root, project, zone, name
        )
    }

    fn region_disk_url(&self, project: &str, region: &str, name: &str) -> String {
        format!(
            "{}/beta/projects/{}/regions/{}/disks/{}",
            self.api_root, project, region, name
        )
    }

    async fn fetch(&self, url: String, scope: String, name: &str) -> Result<CloudDisk, ComputeError> {
        let mut request = self.http.get(&url);
        if let Some(token) = &self.access_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(ComputeError::NotFound {
                scope,
                name: name.to_string(),
            }),
            status if status.is_success() => Ok(response.json::<CloudDisk>().await?),
            status => Err(ComputeError::Api {
                status: status.as_u16(),
                url,
            }),
        }
    }
}

#[async_trait]
impl ComputeBackend for GceCompute {
    async fn fetch_disk(
        &self,
        project: &str,
        zone: &str,
        name: &str,
    ) -> Result<CloudDisk, ComputeError> {
        let url = self.disk_url(project, zone, name);
        self.fetch(url, format!("{}/{}", project, zone), name).await
    }

    async fn fetch_region_disk(
        &self,
        project: &str,
        region: &str,
        name: &str,
    ) -> Result<CloudDisk, ComputeError> {
        let url = self.region_disk_url(project, region, name);
        self.fetch(url, format!("{}/{}", project, region), name)
            .await
    }
}
