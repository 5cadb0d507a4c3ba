//! CSI Identity service for the simulated driver.

use std::collections::HashMap;

use tonic::{Request, Response, Status};
use tracing::debug;

use crate::csi;
use crate::csi::identity_server::Identity;

/// Driver name reported to clients. Matches the production GCE PD driver so
/// harness runs look identical against either.
pub const DRIVER_NAME: &str = "pd.csi.storage.gke.io";

/// Driver version reported to clients.
pub const DRIVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Identity service implementation.
#[derive(Debug, Default)]
pub struct IdentityService {}

impl IdentityService {
    pub fn new() -> Self {
        Self {}
    }
}

#[tonic::async_trait]
impl Identity for IdentityService {
    async fn get_plugin_info(
        &self,
        _request: Request<csi::GetPluginInfoRequest>,
    ) -> Result<Response<csi::GetPluginInfoResponse>, Status> {
        debug!("GetPluginInfo called");

        Ok(Response::new(csi::GetPluginInfoResponse {
            name: DRIVER_NAME.to_string(),
            vendor_version: DRIVER_VERSION.to_string(),
            manifest: HashMap::new(),
        }))
    }

    async fn probe(
        &self,
        _request: Request<csi::ProbeRequest>,
    ) -> Result<Response<csi::ProbeResponse>, Status> {
        debug!("Probe called");

        Ok(Response::new(csi::ProbeResponse { ready: Some(true) }))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_plugin_info() {
        let service = IdentityService::new();
        let response = Identity::get_plugin_info(&service, Request::new(csi::GetPluginInfoRequest {}))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(response.name, DRIVER_NAME);
        assert_eq!(response.vendor_version, DRIVER_VERSION);
    }

    #[tokio::test]
    async fn test_probe_reports_ready() {
        let service = IdentityService::new();
        let response = Identity::probe(&service, Request::new(csi::ProbeRequest {}))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(response.ready, Some(true));
    }
}
