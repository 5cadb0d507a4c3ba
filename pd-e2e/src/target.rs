//! Test targets: the machines a driver under test runs on.
//!
//! A target is anything that can host the driver endpoint and execute file
//! reads and writes on the paths the node service mounts. [`ShellInstance`]
//! covers real machines reachable through a command prefix such as
//! `gcloud compute ssh`; the simulator crate provides an in-process
//! implementation for hermetic runs.

use std::fmt::{self, Display};
use std::io;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Stable identity of a target machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceIdentity {
    pub project: String,
    pub zone: String,
    pub name: String,
}

impl Display for InstanceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.project, self.zone, self.name)
    }
}

#[async_trait]
pub trait Instance: Send + Sync {
    fn identity(&self) -> &InstanceIdentity;

    /// Makes the driver endpoint available and returns its URI.
    ///
    /// Binding is not verified here; the caller confirms liveness by
    /// connecting and probing.
    async fn launch_driver(&self) -> io::Result<String>;

    /// Stops whatever `launch_driver` started. Idempotent.
    async fn stop_driver(&self) -> io::Result<()>;

    /// Writes `contents` to `path` on the target, creating parent
    /// directories as needed.
    async fn write_file(&self, path: &str, contents: &[u8]) -> io::Result<()>;

    /// Reads the file at `path` on the target.
    async fn read_file(&self, path: &str) -> io::Result<Vec<u8>>;
}

/// A target reached by running shell commands, optionally through an exec
/// prefix (e.g. `["gcloud", "compute", "ssh", "inst", "--command"]`). An
/// empty prefix runs commands on the local machine.
///
/// The driver itself is managed out of band on these targets; launching
/// just hands back the configured endpoint.
pub struct ShellInstance {
    identity: InstanceIdentity,
    endpoint: String,
    exec_prefix: Vec<String>,
}

impl ShellInstance {
    pub fn new(identity: InstanceIdentity, endpoint: String, exec_prefix: Vec<String>) -> Self {
        Self {
            identity,
            endpoint,
            exec_prefix,
        }
    }

    async fn run_script(&self, script: &str, stdin: Option<&[u8]>) -> io::Result<Vec<u8>> {
        debug!(instance = %self.identity, %script, "Running script on target");

        let mut command = match self.exec_prefix.split_first() {
            Some((head, rest)) => {
                let mut command = Command::new(head);
                command.args(rest);
                command
            }
            None => {
                let mut command = Command::new("sh");
                command.arg("-c");
                command
            }
        };
        command
            .arg(script)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn()?;
        if let Some(contents) = stdin {
            let mut pipe = child
                .stdin
                .take()
                .ok_or_else(|| io::Error::other("child stdin not captured"))?;
            pipe.write_all(contents).await?;
            pipe.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(io::Error::other(format!(
                "script exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(output.stdout)
    }
}

/// Single-quotes `path` for embedding in a shell command line.
fn shell_quote(path: &str) -> String {
    format!("'{}'", path.replace('\'', r"'\''"))
}

#[async_trait]
impl Instance for ShellInstance {
    fn identity(&self) -> &InstanceIdentity {
        &self.identity
    }

    async fn launch_driver(&self) -> io::Result<String> {
        Ok(self.endpoint.clone())
    }

    async fn stop_driver(&self) -> io::Result<()> {
        Ok(())
    }

    async fn write_file(&self, path: &str, contents: &[u8]) -> io::Result<()> {
        let parent = match path.rsplit_once('/') {
            Some((parent, _)) if !parent.is_empty() => parent,
            _ => ".",
        };
        let script = format!(
            "mkdir -p {} && cat > {}",
            shell_quote(parent),
            shell_quote(path)
        );
        self.run_script(&script, Some(contents)).await?;
        Ok(())
    }

    async fn read_file(&self, path: &str) -> io::Result<Vec<u8>> {
        self.run_script(&format!("cat {}", shell_quote(path)), None)
            .await
    }
}
