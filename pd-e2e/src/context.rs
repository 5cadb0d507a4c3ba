//! Per-target test context.
//!
//! Acquisition is the only door into a scenario: launch the driver on the
//! target, connect, wait for readiness, learn the node identity, and
//! cross-check the driver's advertised zone against where the instance
//! actually is. If any step after launch fails the driver is stopped again
//! before the error propagates, so a failed acquisition leaks nothing.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::cleanup::CleanupStack;
use crate::client::{ConnectOptions, DriverClient};
use crate::error::{SetupError, TeardownFailure};
use crate::target::{Instance, InstanceIdentity};

pub struct TestContext {
    instance: Arc<dyn Instance>,
    client: DriverClient,
    node_id: String,
    driver_name: String,
}

impl std::fmt::Debug for TestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestContext")
            .field("node_id", &self.node_id)
            .field("driver_name", &self.driver_name)
            .finish_non_exhaustive()
    }
}

impl TestContext {
    pub async fn acquire(
        instance: Arc<dyn Instance>,
        options: &ConnectOptions,
    ) -> Result<Self, SetupError> {
        let identity = instance.identity().clone();
        info!(instance = %identity, "Acquiring test context");

        let endpoint = instance
            .launch_driver()
            .await
            .map_err(|source| SetupError::Launch {
                instance: identity.name.clone(),
                source,
            })?;

        match Self::handshake(&instance, &identity, &endpoint, options).await {
            Ok(context) => Ok(context),
            Err(error) => {
                // The driver did launch; stop it before surfacing the error.
                if let Err(stop) = instance.stop_driver().await {
                    warn!(instance = %identity, error = %stop, "Failed to stop driver after setup failure");
                }
                Err(error)
            }
        }
    }

    /// Acquires a context and registers its release on `cleanup` in the
    /// same step, so no exit path can skip it.
    pub async fn acquire_scoped(
        instance: Arc<dyn Instance>,
        options: &ConnectOptions,
        cleanup: &mut CleanupStack,
    ) -> Result<Arc<Self>, SetupError> {
        let context = Arc::new(Self::acquire(instance, options).await?);
        let held = context.clone();
        cleanup.defer("release-context", async move { held.release().await });
        Ok(context)
    }

    async fn handshake(
        instance: &Arc<dyn Instance>,
        identity: &InstanceIdentity,
        endpoint: &str,
        options: &ConnectOptions,
    ) -> Result<Self, SetupError> {
        let mut client = DriverClient::connect(endpoint, options).await?;
        client
            .wait_ready(options.ready_timeout, options.probe_interval)
            .await?;

        let (driver_name, driver_version) = client.plugin_info().await?;
        let node = client.node_info().await?;

        if let Some(reported) = &node.zone {
            if *reported != identity.zone {
                return Err(SetupError::ZoneMismatch {
                    instance: identity.name.clone(),
                    reported: reported.clone(),
                    expected: identity.zone.clone(),
                });
            }
        }

        info!(
            instance = %identity,
            driver = %driver_name,
            version = %driver_version,
            node_id = %node.node_id,
            "Driver ready"
        );

        Ok(Self {
            instance: instance.clone(),
            client,
            node_id: node.node_id,
            driver_name,
        })
    }

    pub fn identity(&self) -> &InstanceIdentity {
        self.instance.identity()
    }

    pub fn zone(&self) -> &str {
        &self.instance.identity().zone
    }

    pub fn project(&self) -> &str {
        &self.instance.identity().project
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn driver_name(&self) -> &str {
        &self.driver_name
    }

    pub fn instance(&self) -> &Arc<dyn Instance> {
        &self.instance
    }

    /// A client clone sharing the underlying channel.
    pub fn client(&self) -> DriverClient {
        self.client.clone()
    }

    /// Stops the driver on the target. Best effort; the failure is
    /// reported as a teardown failure, not an error that masks anything.
    pub async fn release(&self) -> Result<(), TeardownFailure> {
        let identity = self.instance.identity();
        debug!(instance = %identity, "Releasing test context");
        self.instance
            .stop_driver()
            .await
            .map_err(|error| TeardownFailure::new("stop-driver", identity.to_string(), error))
    }
}
