//! End-to-end verification harness for GCE persistent-disk CSI drivers.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{Level, error, info, warn};
use tracing_subscriber::FmtSubscriber;

use pd_e2e::compute::ComputeBackend;
use pd_e2e::config::HarnessConfig;
use pd_e2e::gce::GceCompute;
use pd_e2e::scenario::{Runner, all_passed};

#[derive(Parser, Debug)]
#[command(name = "pd-e2e")]
#[command(about = "End-to-end verification harness for GCE PD CSI drivers")]
struct Args {
    /// Path to the harness config (TOML)
    #[arg(long, env = "PD_E2E_CONFIG", default_value = "pd-e2e.toml")]
    config: PathBuf,

    /// OAuth bearer token for compute API verification calls
    #[arg(long, env = "GOOGLE_OAUTH_ACCESS_TOKEN", hide_env_values = true)]
    access_token: Option<String>,

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

    let config = HarnessConfig::load(&args.config)?;
    info!(
        config = %args.config.display(),
        targets = config.target_sections().len(),
        "Loaded harness config"
    );

    if config.gce.api_root.is_none() && args.access_token.is_none() {
        warn!("No compute API access token; verification calls will be unauthenticated");
    }

    let backend: Arc<dyn ComputeBackend> = match &config.gce.api_root {
        Some(api_root) => Arc::new(GceCompute::with_api_root(
            api_root.clone(),
            args.access_token,
        )?),
        None => Arc::new(GceCompute::new(args.access_token)?),
    };

    let runner = Runner::new(config.run.clone(), backend, config.targets());
    let reports = runner.run().await;

    let mut passed = 0;
    for report in &reports {
        if report.passed() {
            passed += 1;
            info!(
                scenario = report.scenario,
                target = %report.target,
                elapsed = ?report.elapsed,
                "PASS"
            );
            continue;
        }
        if let Err(scenario_error) = &report.outcome {
            error!(
                scenario = report.scenario,
                target = %report.target,
                kind = scenario_error.kind(),
                error = %scenario_error,
                "FAIL"
            );
        }
        for failure in &report.teardown_failures {
            error!(
                scenario = report.scenario,
                target = %report.target,
                error = %failure,
                "Teardown failure"
            );
        }
    }

    info!(passed, total = reports.len(), "Run complete");

    if !all_passed(&reports) {
        error!("One or more scenarios failed");
        std::process::exit(1);
    }
    Ok(())
}
