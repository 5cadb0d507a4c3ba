//! Scenario suite and runner.
//!
//! Each scenario is one self-contained proof about the driver. Scenarios
//! never clean up in `Drop` or rely on reaching their last line: anything
//! they acquire goes onto the per-run [`CleanupStack`], and the runner
//! unwinds that stack on every exit path, panics included. Targets run
//! concurrently; the scenarios on one target run in order.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::time::Instant;
use tracing::{error, info};

use crate::cleanup::CleanupStack;
use crate::client::{VolumeRequest, unique_volume_name};
use crate::compute::ComputeBackend;
use crate::config::{ConfigError, DEFAULT_DISK_TYPE, RunConfig};
use crate::context::TestContext;
use crate::error::{ScenarioError, SetupError, TeardownFailure, VerifyError};
use crate::lifecycle::ProvisionedVolume;
use crate::target::Instance;
use crate::topology::zone_requirement;
use crate::verify::{DiskExpectation, DiskPlacement, Verifier};
use crate::zones;

/// Everything a scenario gets to work with.
pub struct ScenarioEnv {
    pub run: RunConfig,
    pub backend: Arc<dyn ComputeBackend>,
    pub target: Arc<dyn Instance>,
}

impl ScenarioEnv {
    pub fn verifier(&self) -> Verifier {
        Verifier::new(
            self.backend.clone(),
            self.run.settle_timeout,
            self.run.poll_interval,
        )
    }

    async fn acquire(&self, cleanup: &mut CleanupStack) -> Result<Arc<TestContext>, SetupError> {
        TestContext::acquire_scoped(self.target.clone(), &self.run.connect, cleanup).await
    }

    fn volume_request(&self, name: &str) -> VolumeRequest {
        VolumeRequest::new(name, self.run.disk_size_gb).disk_type(&self.run.disk_type)
    }

    fn zonal_expectation(&self, name: &str, zone: &str) -> DiskExpectation {
        DiskExpectation::zonal(name, self.run.disk_size_gb, &self.run.disk_type, zone)
    }

    fn regional_expectation(&self, name: &str, region: &str) -> DiskExpectation {
        DiskExpectation::regional(name, self.run.disk_size_gb, &self.run.disk_type, region)
    }
}

#[async_trait]
pub trait Scenario: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(
        &self,
        env: &ScenarioEnv,
        cleanup: &mut CleanupStack,
    ) -> Result<(), ScenarioError>;
}

// ============================================================================
// Scenarios
// ============================================================================

/// Full lifecycle in the target's own zone: create, verify against the
/// backend, attach, stage, mount, prove a write survives, unwind, delete,
/// and verify the disk is gone.
pub struct SingleZoneLifecycle;

#[async_trait]
impl Scenario for SingleZoneLifecycle {
    fn name(&self) -> &'static str {
        "single-zone-lifecycle"
    }

    async fn run(
        &self,
        env: &ScenarioEnv,
        cleanup: &mut CleanupStack,
    ) -> Result<(), ScenarioError> {
        let context = env.acquire(cleanup).await?;
        let zone = context.zone().to_string();
        let name = unique_volume_name();

        let request = env.volume_request(&name).topology(zone_requirement(&zone));
        let mut volume = ProvisionedVolume::create(&context, cleanup, request).await?;

        let verifier = env.verifier();
        let expectation = env.zonal_expectation(&name, &zone);
        verifier.await_disk(context.project(), &expectation).await?;

        volume.attach_write_read_detach(cleanup, false).await?;

        volume.delete().await?;
        verifier
            .expect_absent(context.project(), &expectation.placement, &name)
            .await?;
        Ok(())
    }
}

/// One volume per configured zone, each pinned by a topology requisite;
/// the backend must report each disk in exactly the requested zone.
pub struct ZonalPlacementSweep;

#[async_trait]
impl Scenario for ZonalPlacementSweep {
    fn name(&self) -> &'static str {
        "zonal-placement-sweep"
    }

    async fn run(
        &self,
        env: &ScenarioEnv,
        cleanup: &mut CleanupStack,
    ) -> Result<(), ScenarioError> {
        let context = env.acquire(cleanup).await?;
        let verifier = env.verifier();

        for zone in &env.run.zones {
            let name = unique_volume_name();
            let request = env.volume_request(&name).topology(zone_requirement(zone));
            ProvisionedVolume::create(&context, cleanup, request).await?;
            verifier
                .await_disk(context.project(), &env.zonal_expectation(&name, zone))
                .await?;
            info!(zone = %zone, disk = %name, "Placement verified");
        }
        Ok(())
    }
}

/// Regional volume: two replicas whose zones independently resolve to the
/// target's region.
pub struct RegionalReplication;

#[async_trait]
impl Scenario for RegionalReplication {
    fn name(&self) -> &'static str {
        "regional-replication"
    }

    async fn run(
        &self,
        env: &ScenarioEnv,
        cleanup: &mut CleanupStack,
    ) -> Result<(), ScenarioError> {
        let context = env.acquire(cleanup).await?;
        let region = zones::region_from_zone(context.zone())?;
        let name = unique_volume_name();

        let request = env.volume_request(&name).regional();
        let mut volume = ProvisionedVolume::create(&context, cleanup, request).await?;

        let verifier = env.verifier();
        let expectation = env.regional_expectation(&name, &region);
        verifier.await_disk(context.project(), &expectation).await?;

        volume.delete().await?;
        verifier
            .expect_absent(context.project(), &expectation.placement, &name)
            .await?;
        Ok(())
    }
}

/// No parameters and no topology at all: the driver must fall back to its
/// own zone and default disk type.
pub struct DefaultZone;

#[async_trait]
impl Scenario for DefaultZone {
    fn name(&self) -> &'static str {
        "default-zone"
    }

    async fn run(
        &self,
        env: &ScenarioEnv,
        cleanup: &mut CleanupStack,
    ) -> Result<(), ScenarioError> {
        let context = env.acquire(cleanup).await?;
        let name = unique_volume_name();

        let request = VolumeRequest::new(&name, env.run.disk_size_gb);
        let mut volume = ProvisionedVolume::create(&context, cleanup, request).await?;

        let verifier = env.verifier();
        let expectation = DiskExpectation::zonal(
            &name,
            env.run.disk_size_gb,
            DEFAULT_DISK_TYPE,
            context.zone(),
        );
        verifier.await_disk(context.project(), &expectation).await?;

        volume.delete().await?;
        verifier
            .expect_absent(context.project(), &expectation.placement, &name)
            .await?;
        Ok(())
    }
}

/// Creation idempotency: repeating a create must return the same handle,
/// and repeating it with a different size must be refused as already
/// existing.
pub struct CreateAlreadyExists;

#[async_trait]
impl Scenario for CreateAlreadyExists {
    fn name(&self) -> &'static str {
        "create-already-exists"
    }

    async fn run(
        &self,
        env: &ScenarioEnv,
        cleanup: &mut CleanupStack,
    ) -> Result<(), ScenarioError> {
        let context = env.acquire(cleanup).await?;
        let zone = context.zone().to_string();
        let name = unique_volume_name();

        let request = env.volume_request(&name).topology(zone_requirement(&zone));
        let volume = ProvisionedVolume::create(&context, cleanup, request.clone()).await?;
        env.verifier()
            .await_disk(context.project(), &env.zonal_expectation(&name, &zone))
            .await?;

        let mut client = context.client();

        let repeat = client.create_volume(&request).await?;
        if repeat.handle != *volume.handle() {
            return Err(VerifyError::Mismatch {
                name: name.clone(),
                field: "volumeId",
                expected: volume.handle().to_string(),
                actual: repeat.handle.to_string(),
            }
            .into());
        }
        info!(disk = %name, "Repeated create returned the same volume");

        let mut conflicting = request.clone();
        conflicting.size_gb += 1;
        match client.create_volume(&conflicting).await {
            Ok(other) => Err(VerifyError::UnexpectedSuccess {
                op: "CreateVolume",
                detail: format!(
                    "create with a different size returned volume '{}'",
                    other.handle
                ),
            }
            .into()),
            Err(error) if error.is_already_exists() => {
                info!(disk = %name, "Conflicting create refused as already existing");
                Ok(())
            }
            Err(error) => Err(error.into()),
        }
    }
}

/// Deleting a volume twice: the second delete must converge to success
/// once the backend no longer knows the disk.
pub struct DeleteIdempotence;

#[async_trait]
impl Scenario for DeleteIdempotence {
    fn name(&self) -> &'static str {
        "delete-idempotence"
    }

    async fn run(
        &self,
        env: &ScenarioEnv,
        cleanup: &mut CleanupStack,
    ) -> Result<(), ScenarioError> {
        let context = env.acquire(cleanup).await?;
        let zone = context.zone().to_string();
        let name = unique_volume_name();

        let request = env.volume_request(&name).topology(zone_requirement(&zone));
        let mut volume = ProvisionedVolume::create(&context, cleanup, request).await?;

        let verifier = env.verifier();
        verifier
            .await_disk(context.project(), &env.zonal_expectation(&name, &zone))
            .await?;

        volume.delete().await?;
        verifier
            .expect_absent(
                context.project(),
                &DiskPlacement::Zonal { zone: zone.clone() },
                &name,
            )
            .await?;

        volume.delete().await?;
        info!(disk = %name, "Delete of an absent volume converged to success");
        Ok(())
    }
}

/// Two simultaneous creates for the same name: at most one distinct
/// handle may come back, losers must be refused as operation-pending, and
/// exactly one disk must exist afterwards.
pub struct ConcurrentCreateSingleWinner;

#[async_trait]
impl Scenario for ConcurrentCreateSingleWinner {
    fn name(&self) -> &'static str {
        "concurrent-create-single-winner"
    }

    async fn run(
        &self,
        env: &ScenarioEnv,
        cleanup: &mut CleanupStack,
    ) -> Result<(), ScenarioError> {
        let context = env.acquire(cleanup).await?;
        let zone = context.zone().to_string();
        let name = unique_volume_name();

        let request = env.volume_request(&name).topology(zone_requirement(&zone));
        let mut first = context.client();
        let mut second = context.client();
        let (left, right) = tokio::join!(
            first.create_volume(&request),
            second.create_volume(&request)
        );

        let mut handles = Vec::new();
        for outcome in [left, right] {
            match outcome {
                Ok(created) => handles.push(created.handle),
                Err(error) if error.is_operation_pending() => {
                    info!(disk = %name, "Racing create refused while operation pending");
                }
                Err(error) => return Err(error.into()),
            }
        }

        if let Some(winner) = handles.first() {
            let mut client = context.client();
            let handle = winner.clone();
            let resource = name.clone();
            cleanup.defer(format!("delete-volume {name}"), async move {
                client
                    .delete_volume(&handle)
                    .await
                    .map_err(|error| TeardownFailure::new("delete-volume", resource, error))
            });
        }

        let distinct = handles.windows(2).any(|pair| pair[0] != pair[1]);
        if distinct {
            return Err(VerifyError::Mismatch {
                name: name.clone(),
                field: "volumeId",
                expected: "one distinct handle".to_string(),
                actual: format!("{} distinct handles", handles.len()),
            }
            .into());
        }
        if handles.is_empty() {
            return Err(VerifyError::Mismatch {
                name: name.clone(),
                field: "winning creates",
                expected: "1".to_string(),
                actual: "0".to_string(),
            }
            .into());
        }

        env.verifier()
            .await_disk(context.project(), &env.zonal_expectation(&name, &zone))
            .await?;
        Ok(())
    }
}

/// The scenarios every run executes, in order.
pub fn standard_suite() -> Vec<Arc<dyn Scenario>> {
    vec![
        Arc::new(SingleZoneLifecycle),
        Arc::new(ZonalPlacementSweep),
        Arc::new(RegionalReplication),
        Arc::new(DefaultZone),
        Arc::new(CreateAlreadyExists),
        Arc::new(DeleteIdempotence),
        Arc::new(ConcurrentCreateSingleWinner),
    ]
}

// ============================================================================
// Runner
// ============================================================================

/// Outcome of one scenario on one target.
pub struct ScenarioReport {
    pub scenario: &'static str,
    pub target: String,
    pub outcome: Result<(), ScenarioError>,
    pub teardown_failures: Vec<TeardownFailure>,
    pub elapsed: Duration,
}

impl ScenarioReport {
    /// A scenario only passes if its body succeeded and every cleanup
    /// step ran clean.
    pub fn passed(&self) -> bool {
        self.outcome.is_ok() && self.teardown_failures.is_empty()
    }
}

pub fn all_passed(reports: &[ScenarioReport]) -> bool {
    !reports.is_empty() && reports.iter().all(ScenarioReport::passed)
}

pub struct Runner {
    run: RunConfig,
    backend: Arc<dyn ComputeBackend>,
    targets: Vec<Arc<dyn Instance>>,
    suite: Vec<Arc<dyn Scenario>>,
}

impl Runner {
    pub fn new(
        run: RunConfig,
        backend: Arc<dyn ComputeBackend>,
        targets: Vec<Arc<dyn Instance>>,
    ) -> Self {
        Self {
            run,
            backend,
            targets,
            suite: standard_suite(),
        }
    }

    pub fn with_suite(mut self, suite: Vec<Arc<dyn Scenario>>) -> Self {
        self.suite = suite;
        self
    }

    /// Runs the whole suite against every target and returns one report
    /// per (scenario, target) pair.
    pub async fn run(&self) -> Vec<ScenarioReport> {
        if self.targets.is_empty() {
            error!("No test targets configured, failing every scenario");
            return self
                .suite
                .iter()
                .map(|scenario| ScenarioReport {
                    scenario: scenario.name(),
                    target: "-".to_string(),
                    outcome: Err(ScenarioError::Config(ConfigError::NoTargets)),
                    teardown_failures: Vec::new(),
                    elapsed: Duration::ZERO,
                })
                .collect();
        }

        let mut tasks = Vec::new();
        for target in &self.targets {
            let env = ScenarioEnv {
                run: self.run.clone(),
                backend: self.backend.clone(),
                target: target.clone(),
            };
            let suite = self.suite.clone();
            tasks.push(tokio::spawn(async move {
                let mut reports = Vec::new();
                for scenario in suite {
                    reports.push(run_one(&env, scenario.as_ref()).await);
                }
                reports
            }));
        }

        let mut reports = Vec::new();
        for task in tasks {
            match task.await {
                Ok(mut target_reports) => reports.append(&mut target_reports),
                Err(join_error) => {
                    error!(error = %join_error, "Target task did not complete");
                }
            }
        }
        reports
    }
}

async fn run_one(env: &ScenarioEnv, scenario: &dyn Scenario) -> ScenarioReport {
    let name = scenario.name();
    let target = env.target.identity().to_string();
    info!(scenario = name, target = %target, "Scenario starting");

    let started = Instant::now();
    let mut cleanup = CleanupStack::new();

    let outcome = match AssertUnwindSafe(scenario.run(env, &mut cleanup))
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(panic) => Err(ScenarioError::Panicked(panic_message(panic))),
    };

    let teardown_failures = cleanup.run().await;
    let elapsed = started.elapsed();

    match &outcome {
        Ok(()) if teardown_failures.is_empty() => {
            info!(scenario = name, target = %target, ?elapsed, "Scenario passed");
        }
        Ok(()) => {
            error!(
                scenario = name,
                target = %target,
                failures = teardown_failures.len(),
                "Scenario passed but teardown left failures"
            );
        }
        Err(error) => {
            error!(
                scenario = name,
                target = %target,
                kind = error.kind(),
                error = %error,
                "Scenario failed"
            );
        }
    }

    ScenarioReport {
        scenario: name,
        target,
        outcome,
        teardown_failures,
        elapsed,
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::io;
    use std::sync::atomic::{AtomicBool, Ordering};

    use crate::compute::{CloudDisk, ComputeError};
    use crate::target::InstanceIdentity;

    use super::*;

    struct NullBackend;

    #[async_trait]
    impl ComputeBackend for NullBackend {
        async fn fetch_disk(
            &self,
            project: &str,
            zone: &str,
            name: &str,
        ) -> Result<CloudDisk, ComputeError> {
            Err(ComputeError::NotFound {
                scope: format!("{project}/{zone}"),
                name: name.to_string(),
            })
        }

        async fn fetch_region_disk(
            &self,
            project: &str,
            region: &str,
            name: &str,
        ) -> Result<CloudDisk, ComputeError> {
            Err(ComputeError::NotFound {
                scope: format!("{project}/{region}"),
                name: name.to_string(),
            })
        }
    }

    struct NullInstance {
        identity: InstanceIdentity,
    }

    impl NullInstance {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                identity: InstanceIdentity {
                    project: "p".to_string(),
                    zone: "us-central1-a".to_string(),
                    name: "null".to_string(),
                },
            })
        }
    }

    #[async_trait]
    impl Instance for NullInstance {
        fn identity(&self) -> &InstanceIdentity {
            &self.identity
        }

        async fn launch_driver(&self) -> io::Result<String> {
            Err(io::Error::other("no driver on the null instance"))
        }

        async fn stop_driver(&self) -> io::Result<()> {
            Ok(())
        }

        async fn write_file(&self, _path: &str, _contents: &[u8]) -> io::Result<()> {
            Ok(())
        }

        async fn read_file(&self, _path: &str) -> io::Result<Vec<u8>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn suite_names_are_unique() {
        let suite = standard_suite();
        let names: HashSet<&'static str> = suite.iter().map(|scenario| scenario.name()).collect();
        assert_eq!(names.len(), suite.len());
        assert_eq!(suite.len(), 7);
    }

    #[tokio::test]
    async fn no_targets_fails_every_scenario_with_config_error() {
        let runner = Runner::new(RunConfig::default(), Arc::new(NullBackend), Vec::new());
        let reports = runner.run().await;
        assert_eq!(reports.len(), 7);
        for report in &reports {
            assert!(!report.passed());
            match &report.outcome {
                Err(ScenarioError::Config(ConfigError::NoTargets)) => {}
                other => panic!("expected NoTargets, got {other:?}"),
            }
        }
        assert!(!all_passed(&reports));
    }

    struct PanickingScenario {
        cleaned: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Scenario for PanickingScenario {
        fn name(&self) -> &'static str {
            "panicking"
        }

        async fn run(
            &self,
            _env: &ScenarioEnv,
            cleanup: &mut CleanupStack,
        ) -> Result<(), ScenarioError> {
            let cleaned = self.cleaned.clone();
            cleanup.defer("mark-cleaned", async move {
                cleaned.store(true, Ordering::SeqCst);
                Ok(())
            });
            panic!("deliberate scenario panic");
        }
    }

    #[tokio::test]
    async fn panics_are_reported_and_cleanup_still_runs() {
        let cleaned = Arc::new(AtomicBool::new(false));
        let suite: Vec<Arc<dyn Scenario>> = vec![Arc::new(PanickingScenario {
            cleaned: cleaned.clone(),
        })];
        let runner = Runner::new(
            RunConfig::default(),
            Arc::new(NullBackend),
            vec![NullInstance::new() as Arc<dyn Instance>],
        )
        .with_suite(suite);

        let reports = runner.run().await;
        assert_eq!(reports.len(), 1);
        match &reports[0].outcome {
            Err(ScenarioError::Panicked(message)) => {
                assert!(message.contains("deliberate scenario panic"));
            }
            other => panic!("expected panic outcome, got {other:?}"),
        }
        assert!(cleaned.load(Ordering::SeqCst));
        assert!(reports[0].teardown_failures.is_empty());
    }

    #[tokio::test]
    async fn setup_failures_are_classified() {
        let runner = Runner::new(
            RunConfig::default(),
            Arc::new(NullBackend),
            vec![NullInstance::new() as Arc<dyn Instance>],
        )
        .with_suite(vec![Arc::new(SingleZoneLifecycle) as Arc<dyn Scenario>]);

        let reports = runner.run().await;
        assert_eq!(reports.len(), 1);
        match &reports[0].outcome {
            Err(error @ ScenarioError::Setup(SetupError::Launch { .. })) => {
                assert_eq!(error.kind(), "setup");
            }
            other => panic!("expected launch failure, got {other:?}"),
        }
    }

    #[test]
    fn panic_messages_downcast() {
        assert_eq!(panic_message(Box::new("static")), "static");
        assert_eq!(panic_message(Box::new("owned".to_string())), "owned");
        assert_eq!(panic_message(Box::new(42_u32)), "non-string panic payload");
    }
}
