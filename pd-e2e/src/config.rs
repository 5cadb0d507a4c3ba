//! Harness configuration.
//!
//! A single TOML file names the targets and tunes the budgets. Everything
//! has a default except the targets themselves; an empty target list is
//! legal to parse and is reported per scenario at run time, never silently
//! skipped.
//!
//! ```toml
//! [run]
//! disk_size_gb = 5
//! disk_type = "pd-standard"
//! zones = ["us-central1-a", "us-central1-b", "us-central1-c"]
//!
//! [[target]]
//! project = "my-project"
//! zone = "us-central1-a"
//! instance = "e2e-test-vm"
//! endpoint = "http://127.0.0.1:10000"
//! exec = ["gcloud", "compute", "ssh", "e2e-test-vm", "--command"]
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::client::ConnectOptions;
use crate::target::{Instance, InstanceIdentity, ShellInstance};
use crate::topology::TopologyError;
use crate::zones::{self, ZoneError};

pub const DEFAULT_DISK_SIZE_GB: i64 = 5;
pub const DEFAULT_DISK_TYPE: &str = "pd-standard";
pub const DEFAULT_ZONES: &[&str] = &["us-central1-a", "us-central1-b", "us-central1-c"];

const DEFAULT_SETTLE_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("no test targets configured")]
    NoTargets,

    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error(transparent)]
    Zone(#[from] ZoneError),
}

/// Validated, defaulted settings the scenarios read.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub disk_size_gb: i64,
    pub disk_type: String,
    /// Zones swept by the placement scenario.
    pub zones: Vec<String>,
    pub connect: ConnectOptions,
    /// How long backend state gets to settle after create or delete.
    pub settle_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            disk_size_gb: DEFAULT_DISK_SIZE_GB,
            disk_type: DEFAULT_DISK_TYPE.to_string(),
            zones: DEFAULT_ZONES.iter().map(|zone| zone.to_string()).collect(),
            connect: ConnectOptions::default(),
            settle_timeout: DEFAULT_SETTLE_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default)]
    run: RunSection,
    #[serde(default)]
    gce: GceSection,
    #[serde(default, rename = "target")]
    targets: Vec<TargetSection>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RunSection {
    disk_size_gb: Option<i64>,
    disk_type: Option<String>,
    zones: Option<Vec<String>>,
    connect_timeout_secs: Option<u64>,
    call_timeout_secs: Option<u64>,
    ready_timeout_secs: Option<u64>,
    probe_interval_secs: Option<u64>,
    settle_timeout_secs: Option<u64>,
    poll_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GceSection {
    /// Override for the compute API root, e.g. an emulator.
    pub api_root: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetSection {
    pub project: String,
    pub zone: String,
    pub instance: String,
    /// Driver endpoint as seen from the harness, usually a tunnel.
    pub endpoint: String,
    /// Command prefix for running scripts on the instance. Empty means
    /// the local shell.
    #[serde(default)]
    pub exec: Vec<String>,
}

#[derive(Debug)]
pub struct HarnessConfig {
    pub run: RunConfig,
    pub gce: GceSection,
    targets: Vec<TargetSection>,
}

impl HarnessConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(path, &contents)
    }

    fn parse(path: &Path, contents: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        let defaults = RunConfig::default();
        let section = file.run;
        let secs = Duration::from_secs;
        let run = RunConfig {
            disk_size_gb: section.disk_size_gb.unwrap_or(defaults.disk_size_gb),
            disk_type: section.disk_type.unwrap_or(defaults.disk_type),
            zones: section.zones.unwrap_or(defaults.zones),
            connect: ConnectOptions {
                connect_timeout: section
                    .connect_timeout_secs
                    .map(secs)
                    .unwrap_or(defaults.connect.connect_timeout),
                call_timeout: section
                    .call_timeout_secs
                    .map(secs)
                    .unwrap_or(defaults.connect.call_timeout),
                ready_timeout: section
                    .ready_timeout_secs
                    .map(secs)
                    .unwrap_or(defaults.connect.ready_timeout),
                probe_interval: section
                    .probe_interval_secs
                    .map(secs)
                    .unwrap_or(defaults.connect.probe_interval),
            },
            settle_timeout: section
                .settle_timeout_secs
                .map(secs)
                .unwrap_or(defaults.settle_timeout),
            poll_interval: section
                .poll_interval_secs
                .map(secs)
                .unwrap_or(defaults.poll_interval),
        };

        let config = Self {
            run,
            gce: file.gce,
            targets: file.targets,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.run.disk_size_gb <= 0 {
            return Err(ConfigError::Invalid(format!(
                "disk_size_gb must be positive, got {}",
                self.run.disk_size_gb
            )));
        }
        if self.run.disk_type.is_empty() {
            return Err(ConfigError::Invalid("disk_type must be non-empty".into()));
        }
        if self.run.zones.is_empty() {
            return Err(ConfigError::Invalid("zones must be non-empty".into()));
        }
        for zone in &self.run.zones {
            zones::region_from_zone(zone)?;
        }
        for target in &self.targets {
            for (field, value) in [
                ("project", &target.project),
                ("zone", &target.zone),
                ("instance", &target.instance),
                ("endpoint", &target.endpoint),
            ] {
                if value.is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "target '{}': {} must be non-empty",
                        target.instance, field
                    )));
                }
            }
            zones::region_from_zone(&target.zone)?;
        }
        Ok(())
    }

    pub fn target_sections(&self) -> &[TargetSection] {
        &self.targets
    }

    /// Instantiates every configured target.
    pub fn targets(&self) -> Vec<Arc<dyn Instance>> {
        self.targets
            .iter()
            .map(|target| {
                Arc::new(ShellInstance::new(
                    InstanceIdentity {
                        project: target.project.clone(),
                        zone: target.zone.clone(),
                        name: target.instance.clone(),
                    },
                    target.endpoint.clone(),
                    target.exec.clone(),
                )) as Arc<dyn Instance>
            })
            .collect()
    }
}
