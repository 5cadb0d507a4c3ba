use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tonic::transport::Server;
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

use pd_sim::cloud::SimCloud;
use pd_sim::controller::ControllerService;
use pd_sim::csi::controller_server::ControllerServer;
use pd_sim::csi::identity_server::IdentityServer;
use pd_sim::csi::node_server::NodeServer;
use pd_sim::identity::IdentityService;
use pd_sim::node::NodeService;

#[derive(Parser, Debug)]
#[command(name = "pd-sim")]
#[command(about = "Simulated GCE persistent-disk CSI driver")]
struct Args {
    /// gRPC listen address
    #[arg(long, env = "PD_SIM_LISTEN", default_value = "127.0.0.1:10808")]
    listen: String,

    /// Project the simulated cloud belongs to
    #[arg(long, env = "PD_SIM_PROJECT", default_value = "sim-project")]
    project: String,

    /// Zones the simulated cloud offers (comma separated, first two host
    /// regional replicas)
    #[arg(
        long,
        env = "PD_SIM_ZONES",
        value_delimiter = ',',
        default_value = "us-central1-a,us-central1-b,us-central1-c"
    )]
    zones: Vec<String>,

    /// Zone this instance lives in
    #[arg(long, env = "PD_SIM_ZONE", default_value = "us-central1-a")]
    zone: String,

    /// Node ID reported by NodeGetInfo (defaults to the hostname)
    #[arg(long, env = "PD_SIM_NODE_ID")]
    node_id: Option<String>,

    /// Directory node mounts land under (defaults to a temp directory)
    #[arg(long, env = "PD_SIM_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Milliseconds a new disk reports CREATING before turning READY
    #[arg(long, env = "PD_SIM_SETTLE_MS", default_value = "0")]
    settle_ms: u64,

    /// Milliseconds mutating operations stay pending
    #[arg(long, env = "PD_SIM_OP_HOLD_MS", default_value = "0")]
    op_hold_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize tracing with configured log level
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let node_id = match args.node_id {
        Some(ref name) => name.clone(),
        None => hostname::get()?.to_string_lossy().to_string(),
    };

    info!("Starting pd-sim on {}", args.listen);
    info!("Project: {}", args.project);
    info!("Zones: {}", args.zones.join(", "));
    info!("Instance: {} in {}", node_id, args.zone);

    let zones: Vec<&str> = args.zones.iter().map(String::as_str).collect();
    let cloud = SimCloud::new(&args.project, &zones)
        .with_settle(Duration::from_millis(args.settle_ms))
        .with_op_hold(Duration::from_millis(args.op_hold_ms));
    cloud
        .register_instance(&args.zone, &node_id)
        .await
        .map_err(|e| format!("Startup validation failed: {}", e))?;

    // Node mounts resolve under this root.
    let (root, _scratch) = match args.data_dir {
        Some(dir) => {
            tokio::fs::create_dir_all(&dir).await?;
            (dir, None)
        }
        None => {
            let scratch = tempfile::tempdir()?;
            (scratch.path().to_path_buf(), Some(scratch))
        }
    };
    info!("Node root: {}", root.display());

    let addr = args.listen.parse()?;
    info!("gRPC server listening on {}", addr);

    Server::builder()
        .add_service(IdentityServer::new(IdentityService::new()))
        .add_service(ControllerServer::new(ControllerService::new(
            cloud.clone(),
            &args.zone,
        )))
        .add_service(NodeServer::new(NodeService::new(
            cloud,
            &args.zone,
            &node_id,
            root,
        )))
        .serve_with_shutdown(addr, async {
            shutdown_signal().await;
            info!("Shutdown signal received, draining connections...");
        })
        .await?;

    info!("pd-sim shutdown complete");
    Ok(())
}

/// Resolves once SIGTERM, SIGINT, or SIGHUP arrives.
async fn shutdown_signal() {
    use signal::unix::{SignalKind, signal};

    // A handler that cannot be installed is skipped; the rest still stop
    // the server.
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => Some(s),
        Err(e) => {
            tracing::error!("Failed to install SIGTERM handler: {}", e);
            None
        }
    };

    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => Some(s),
        Err(e) => {
            tracing::error!("Failed to install SIGINT handler: {}", e);
            None
        }
    };

    let mut sighup = match signal(SignalKind::hangup()) {
        Ok(s) => Some(s),
        Err(e) => {
            tracing::error!("Failed to install SIGHUP handler: {}", e);
            None
        }
    };

    // Only the handlers that installed take part in the select.
    tokio::select! {
        _ = async { sigterm.as_mut().unwrap().recv().await }, if sigterm.is_some() => {
            info!("Received SIGTERM");
        }
        _ = async { sigint.as_mut().unwrap().recv().await }, if sigint.is_some() => {
            info!("Received SIGINT");
        }
        _ = async { sighup.as_mut().unwrap().recv().await }, if sighup.is_some() => {
            info!("Received SIGHUP (shutting down)");
        }
    }
}
