//! End-to-end verification harness for GCE persistent-disk CSI drivers.
//!
//! Drives a running driver endpoint through full volume lifecycles
//! (create, attach, stage, mount, write, detach, delete), cross-checks
//! every step against the compute API, and tears down everything it
//! created no matter how a scenario exits.
//!
//! This library provides:
//! - A typed client over the CSI Identity, Controller, and Node services
//! - An independent compute-backend view of disk state for verification
//! - Scenario plumbing with deterministic, LIFO cleanup

/// CSI proto generated types (client)
pub mod csi {
    tonic::include_proto!("csi.v1");
}

pub mod cleanup;
pub mod client;
pub mod compute;
pub mod config;
pub mod context;
pub mod error;
pub mod gce;
pub mod lifecycle;
pub mod scenario;
pub mod target;
pub mod topology;
pub mod verify;
pub mod zones;

pub use cleanup::CleanupStack;
pub use client::{ConnectOptions, DriverClient, VolumeHandle, VolumeRequest};
pub use compute::{CloudDisk, ComputeBackend, ComputeError};
pub use config::{HarnessConfig, RunConfig};
pub use context::TestContext;
pub use error::{ProtocolError, ScenarioError, SetupError, TeardownFailure, VerifyError};
pub use lifecycle::ProvisionedVolume;
pub use scenario::{Runner, Scenario, ScenarioEnv, ScenarioReport};
pub use target::{Instance, InstanceIdentity, ShellInstance};
pub use verify::{DiskExpectation, DiskPlacement, Verifier};
