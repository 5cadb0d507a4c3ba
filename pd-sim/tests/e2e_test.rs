//! End-to-end runs of the verification harness against the simulated driver.
//!
//! These tests stand up real gRPC servers on loopback ports and drive them
//! through the same [`Runner`] and [`DriverClient`] paths a production run
//! uses, with the simulated cloud doubling as the verification backend.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tonic::Code;

use pd_e2e::cleanup::CleanupStack;
use pd_e2e::client::{ConnectOptions, DriverClient, VolumeHandle, VolumeRequest, unique_volume_name};
use pd_e2e::compute::ComputeBackend;
use pd_e2e::config::RunConfig;
use pd_e2e::context::TestContext;
use pd_e2e::error::{ProtocolError, ScenarioError, VerifyError};
use pd_e2e::lifecycle::ProvisionedVolume;
use pd_e2e::scenario::{Runner, Scenario, ScenarioEnv, all_passed, standard_suite};
use pd_e2e::target::Instance;
use pd_e2e::topology::zone_requirement;

use pd_sim::cloud::SimCloud;
use pd_sim::controller::DEVICE_PATH_KEY;
use pd_sim::identity::DRIVER_NAME;
use pd_sim::instance::SimInstance;

const PROJECT: &str = "sim-project";
const ZONES: &[&str] = &["us-central1-a", "us-central1-b", "us-central1-c"];

fn run_config() -> RunConfig {
    RunConfig {
        disk_size_gb: 2,
        disk_type: "pd-standard".to_string(),
        zones: ZONES.iter().map(|z| z.to_string()).collect(),
        connect: ConnectOptions {
            connect_timeout: Duration::from_secs(5),
            call_timeout: Duration::from_secs(10),
            ready_timeout: Duration::from_secs(10),
            probe_interval: Duration::from_millis(50),
        },
        settle_timeout: Duration::from_secs(10),
        poll_interval: Duration::from_millis(25),
    }
}

async fn connected_client(instance: &SimInstance) -> (DriverClient, String) {
    let endpoint = instance.launch_driver().await.unwrap();
    let client = DriverClient::connect(&endpoint, &run_config().connect)
        .await
        .unwrap();
    (client, endpoint)
}

// ============================================================================
// Full suite
// ============================================================================

#[tokio::test]
async fn standard_suite_passes_against_two_targets() {
    // Small but nonzero settle and hold windows make the harness poll
    // through CREATING and race real pending operations.
    let cloud = SimCloud::new(PROJECT, ZONES)
        .with_settle(Duration::from_millis(150))
        .with_op_hold(Duration::from_millis(25));
    let targets: Vec<Arc<dyn Instance>> = vec![
        SimInstance::new(&cloud, "us-central1-a", "sim-vm-1").unwrap(),
        SimInstance::new(&cloud, "us-central1-b", "sim-vm-2").unwrap(),
    ];

    let runner = Runner::new(run_config(), Arc::new(cloud.clone()), targets);
    let reports = runner.run().await;

    assert_eq!(reports.len(), standard_suite().len() * 2);
    for report in &reports {
        assert!(
            report.passed(),
            "scenario '{}' on {} failed: outcome={:?} teardown={:?}",
            report.scenario,
            report.target,
            report.outcome.as_ref().err(),
            report.teardown_failures,
        );
    }
    assert!(all_passed(&reports));
}

// ============================================================================
// Driver-side ordering enforcement
// ============================================================================

#[tokio::test]
async fn driver_rejects_stage_before_attach() {
    let cloud = SimCloud::new(PROJECT, ZONES);
    let instance = SimInstance::new(&cloud, "us-central1-a", "sim-vm-1").unwrap();
    let (mut client, _endpoint) = connected_client(&instance).await;

    let name = unique_volume_name();
    let request = VolumeRequest::new(&name, 2).topology(zone_requirement("us-central1-a"));
    let created = client.create_volume(&request).await.unwrap();

    // Hand the node a plausible publish context without ever attaching.
    let mut publish_context = HashMap::new();
    publish_context.insert(
        DEVICE_PATH_KEY.to_string(),
        format!("/dev/disk/by-id/google-{name}"),
    );
    let err = client
        .node_stage(
            &created.handle,
            "/tmp/stage-attempt",
            &publish_context,
            &HashMap::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(
        err.status().map(|s| s.code()),
        Some(Code::FailedPrecondition),
        "got {err:?}"
    );

    client.delete_volume(&created.handle).await.unwrap();
    instance.stop_driver().await.unwrap();
}

#[tokio::test]
async fn driver_maps_absent_and_malformed_volume_ids() {
    let cloud = SimCloud::new(PROJECT, ZONES);
    let instance = SimInstance::new(&cloud, "us-central1-a", "sim-vm-1").unwrap();
    let (mut client, _endpoint) = connected_client(&instance).await;

    // Publishing a well-formed ID for a disk that does not exist is NOT_FOUND.
    let absent = VolumeHandle::new("projects/sim-project/zones/us-central1-a/disks/no-such-disk");
    let err = client
        .controller_publish(&absent, "sim-vm-1", false)
        .await
        .unwrap_err();
    assert_eq!(err.status().map(|s| s.code()), Some(Code::NotFound));

    // Deleting a malformed ID succeeds: such a volume cannot exist.
    let malformed = VolumeHandle::new("not-a-volume-id");
    client.delete_volume(&malformed).await.unwrap();

    instance.stop_driver().await.unwrap();
}

// ============================================================================
// Pending-operation races
// ============================================================================

#[tokio::test]
async fn concurrent_create_aborts_the_loser() {
    let cloud = SimCloud::new(PROJECT, ZONES).with_op_hold(Duration::from_millis(200));
    let instance = SimInstance::new(&cloud, "us-central1-a", "sim-vm-1").unwrap();
    let (client, _endpoint) = connected_client(&instance).await;

    let name = unique_volume_name();
    let request = VolumeRequest::new(&name, 2).topology(zone_requirement("us-central1-a"));
    let mut first = client.clone();
    let mut second = client.clone();
    let (a, b) = tokio::join!(
        first.create_volume(&request),
        second.create_volume(&request)
    );

    let (winner, loser) = match (a, b) {
        (Ok(winner), Err(loser)) => (winner, loser),
        (Err(loser), Ok(winner)) => (winner, loser),
        (a, b) => panic!("expected one winner and one loser, got {a:?} and {b:?}"),
    };
    assert!(loser.is_operation_pending(), "got {loser:?}");

    let mut client = client.clone();
    client.delete_volume(&winner.handle).await.unwrap();
    instance.stop_driver().await.unwrap();
}

// ============================================================================
// Teardown on failure
// ============================================================================

/// Creates and attaches a volume, then fails verification on purpose,
/// leaving cleanup entirely to the deferred stack.
struct BailAfterAttach {
    volume_name: String,
}

#[async_trait]
impl Scenario for BailAfterAttach {
    fn name(&self) -> &'static str {
        "bail-after-attach"
    }

    async fn run(
        &self,
        env: &ScenarioEnv,
        cleanup: &mut CleanupStack,
    ) -> Result<(), ScenarioError> {
        let context =
            TestContext::acquire_scoped(env.target.clone(), &env.run.connect, cleanup).await?;
        let request = VolumeRequest::new(&self.volume_name, env.run.disk_size_gb)
            .disk_type(&env.run.disk_type)
            .topology(zone_requirement(context.zone()));
        let mut volume = ProvisionedVolume::create(&context, cleanup, request).await?;
        volume.attach(cleanup).await?;

        Err(VerifyError::Mismatch {
            name: self.volume_name.clone(),
            field: "status",
            expected: "READY".to_string(),
            actual: "deliberately failed".to_string(),
        }
        .into())
    }
}

#[tokio::test]
async fn failed_scenario_still_detaches_and_deletes() {
    let cloud = SimCloud::new(PROJECT, ZONES);
    let targets: Vec<Arc<dyn Instance>> =
        vec![SimInstance::new(&cloud, "us-central1-a", "sim-vm-1").unwrap()];
    let volume_name = unique_volume_name();

    let runner = Runner::new(run_config(), Arc::new(cloud.clone()), targets)
        .with_suite(vec![Arc::new(BailAfterAttach {
            volume_name: volume_name.clone(),
        })]);
    let reports = runner.run().await;

    assert_eq!(reports.len(), 1);
    let report = &reports[0];
    assert!(report.outcome.is_err());
    assert_eq!(
        report.outcome.as_ref().err().map(|e| e.kind()),
        Some("verification")
    );
    assert!(
        report.teardown_failures.is_empty(),
        "teardown failed: {:?}",
        report.teardown_failures
    );

    // The deferred unwind detached and deleted the disk despite the failure.
    assert!(cloud.disk(&volume_name).await.is_none());
    let fetched = cloud
        .fetch_disk(PROJECT, "us-central1-a", &volume_name)
        .await;
    assert!(fetched.unwrap_err().is_not_found());
}

// ============================================================================
// Context handshake
// ============================================================================

#[tokio::test]
async fn context_handshake_reports_driver_and_node_identity() {
    let cloud = SimCloud::new(PROJECT, ZONES);
    let instance = SimInstance::new(&cloud, "us-central1-c", "sim-vm-3").unwrap();
    let target: Arc<dyn Instance> = instance.clone();

    let context = TestContext::acquire(target, &run_config().connect)
        .await
        .unwrap();
    assert_eq!(context.driver_name(), DRIVER_NAME);
    assert_eq!(context.node_id(), "sim-vm-3");
    assert_eq!(context.zone(), "us-central1-c");
    assert_eq!(context.project(), PROJECT);

    context.release().await.unwrap();
}
