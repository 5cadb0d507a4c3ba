//! An in-process test target hosting the simulated driver.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tracing::{debug, info};

use pd_e2e::target::{Instance, InstanceIdentity};

use crate::cloud::SimCloud;
use crate::controller::ControllerService;
use crate::csi::controller_server::ControllerServer;
use crate::csi::identity_server::IdentityServer;
use crate::csi::node_server::NodeServer;
use crate::identity::IdentityService;
use crate::node::NodeService;

struct DriverHandle {
    endpoint: String,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<Result<(), tonic::transport::Error>>,
}

/// A simulated VM: a temp directory for its filesystem and, while launched,
/// a driver serving all three CSI services on a loopback port.
///
/// The node paths the driver mounts and the paths [`Instance::write_file`]
/// touches resolve through the same root, so a file written to a published
/// target path lands where the mount bookkeeping says it should.
pub struct SimInstance {
    identity: InstanceIdentity,
    cloud: SimCloud,
    root: TempDir,
    driver: Mutex<Option<DriverHandle>>,
}

impl SimInstance {
    pub fn new(cloud: &SimCloud, zone: &str, name: &str) -> io::Result<Arc<Self>> {
        let root = tempfile::tempdir()?;
        Ok(Arc::new(Self {
            identity: InstanceIdentity {
                project: cloud.project().to_string(),
                zone: zone.to_string(),
                name: name.to_string(),
            },
            cloud: cloud.clone(),
            root,
            driver: Mutex::new(None),
        }))
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    fn host_path(&self, remote: &str) -> PathBuf {
        self.root.path().join(remote.trim_start_matches('/'))
    }
}

#[async_trait]
impl Instance for SimInstance {
    fn identity(&self) -> &InstanceIdentity {
        &self.identity
    }

    async fn launch_driver(&self) -> io::Result<String> {
        let mut driver = self.driver.lock().await;
        if let Some(handle) = &*driver {
            debug!(instance = %self.identity, "Driver already running");
            return Ok(handle.endpoint.clone());
        }

        self.cloud
            .register_instance(&self.identity.zone, &self.identity.name)
            .await
            .map_err(io::Error::other)?;

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (shutdown, on_shutdown) = oneshot::channel::<()>();

        let router = Server::builder()
            .add_service(IdentityServer::new(IdentityService::new()))
            .add_service(ControllerServer::new(ControllerService::new(
                self.cloud.clone(),
                &self.identity.zone,
            )))
            .add_service(NodeServer::new(NodeService::new(
                self.cloud.clone(),
                &self.identity.zone,
                &self.identity.name,
                self.root.path().to_path_buf(),
            )));
        let task = tokio::spawn(async move {
            router
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async {
                    let _ = on_shutdown.await;
                })
                .await
        });

        let endpoint = format!("http://{addr}");
        info!(instance = %self.identity, endpoint = %endpoint, "Simulated driver listening");
        *driver = Some(DriverHandle {
            endpoint: endpoint.clone(),
            shutdown,
            task,
        });
        Ok(endpoint)
    }

    async fn stop_driver(&self) -> io::Result<()> {
        let handle = self.driver.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.shutdown.send(());
            handle
                .task
                .await
                .map_err(io::Error::other)?
                .map_err(io::Error::other)?;
            debug!(instance = %self.identity, "Simulated driver stopped");
        }
        Ok(())
    }

    async fn write_file(&self, path: &str, contents: &[u8]) -> io::Result<()> {
        let host = self.host_path(path);
        if let Some(parent) = host.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&host, contents).await
    }

    async fn read_file(&self, path: &str) -> io::Result<Vec<u8>> {
        tokio::fs::read(self.host_path(path)).await
    }
}

// ============================================================================
// Tests
// ============================================================================
