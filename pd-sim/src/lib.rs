//! In-process simulation of a GCE persistent-disk CSI driver.
//!
//! `pd-sim` hosts the same gRPC surface the harness drives against real
//! deployments (Identity, Controller, Node) on top of an in-memory cloud
//! that tracks disks, attachments, and instances. The harness's cloud
//! cross-checks run against the same state through [`SimCloud`]'s
//! `ComputeBackend` implementation, so the full verification loop can be
//! exercised without a project or a VM.

pub mod csi {
    tonic::include_proto!("csi.v1");
}

pub mod cloud;
pub mod controller;
pub mod identity;
pub mod instance;
pub mod node;

pub use cloud::{DiskRecord, Placement, SimCloud, SimCloudError};
pub use controller::ControllerService;
pub use identity::IdentityService;
pub use instance::SimInstance;
pub use node::NodeService;
