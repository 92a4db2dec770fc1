//! SSH command execution
//!
//! Builds and runs `ssh`/`scp` invocations from worker credentials. Every
//! invocation is non-interactive (`BatchMode=yes`) and bounded by a timeout;
//! there are no unbounded blocking shell calls anywhere in the tunnel layer.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::debug;

use fleet_core::types::Credentials;
use fleet_core::{Error, Result};

/// Runs remote commands over SSH for one fleet
#[derive(Debug, Clone)]
pub struct SshRunner {
    connect_timeout: Duration,
    command_timeout: Duration,
}

impl SshRunner {
    /// Create a runner with the given SSH connect and command timeouts
    pub fn new(connect_timeout: Duration, command_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            command_timeout,
        }
    }

    /// Common non-interactive SSH options for these credentials
    fn base_args(&self, creds: &Credentials) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
        ];
        if let Some(key) = &creds.key_path {
            args.push("-i".to_string());
            args.push(key.clone());
        }
        args
    }

    fn destination(creds: &Credentials) -> String {
        format!("{}@{}", creds.username, creds.hostname)
    }

    /// Run a shell command on the remote host, returning its stdout.
    ///
    /// A non-zero exit status is a `Connectivity` error carrying stderr.
    pub async fn run(&self, creds: &Credentials, remote_cmd: &str) -> Result<String> {
        self.run_with_timeout(creds, remote_cmd, self.command_timeout)
            .await
    }

    /// `run` with an explicit timeout, for slow steps like package installs
    pub async fn run_with_timeout(
        &self,
        creds: &Credentials,
        remote_cmd: &str,
        timeout: Duration,
    ) -> Result<String> {
        let mut command = Command::new("ssh");
        command
            .args(self.base_args(creds))
            .arg("-p")
            .arg(creds.port.to_string())
            .arg(Self::destination(creds))
            .arg(remote_cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!(host = %creds.hostname, command = remote_cmd, "Running remote command");

        let output = tokio::time::timeout(timeout, command.output())
            .await
            .map_err(|_| Error::Timeout {
                operation: format!("ssh {}", remote_cmd),
                timeout_ms: timeout.as_millis() as u64,
            })??;

        if !output.status.success() {
            return Err(Error::Connectivity {
                worker: creds.hostname.clone(),
                message: format!(
                    "remote command exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Verify the host answers over SSH at all
    pub async fn check_reachable(&self, creds: &Credentials) -> Result<()> {
        let output = self.run(creds, "echo ok").await?;
        if output.trim() == "ok" {
            Ok(())
        } else {
            Err(Error::Connectivity {
                worker: creds.hostname.clone(),
                message: format!("unexpected reachability probe output: {}", output.trim()),
            })
        }
    }

    /// Copy local files into a remote directory with `scp`
    pub async fn copy(&self, creds: &Credentials, sources: &[String], remote_dir: &str) -> Result<()> {
        if sources.is_empty() {
            return Ok(());
        }

        let mut command = Command::new("scp");
        command
            .args(self.base_args(creds))
            .arg("-P")
            .arg(creds.port.to_string())
            .args(sources)
            .arg(format!("{}:{}", Self::destination(creds), remote_dir))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let output = tokio::time::timeout(self.command_timeout, command.output())
            .await
            .map_err(|_| Error::Timeout {
                operation: format!("scp to {}", remote_dir),
                timeout_ms: self.command_timeout.as_millis() as u64,
            })??;

        if !output.status.success() {
            return Err(Error::Connectivity {
                worker: creds.hostname.clone(),
                message: format!(
                    "scp exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(())
    }

    /// Spawn the long-running local-port-forward process:
    /// `ssh -N -L <local_port>:localhost:<remote_port> ...`
    ///
    /// The child is returned unwaited; the tunnel manager owns its lifetime.
    /// `kill_on_drop` is a backstop for abnormal coordinator exits only; the
    /// normal path kills the child explicitly on release.
    pub fn spawn_forward(
        &self,
        creds: &Credentials,
        local_port: u16,
        remote_port: u16,
    ) -> Result<Child> {
        let mut command = Command::new("ssh");
        command
            .args(self.base_args(creds))
            .arg("-N")
            .arg("-L")
            .arg(format!("{}:localhost:{}", local_port, remote_port))
            .arg("-p")
            .arg(creds.port.to_string())
            .arg(Self::destination(creds))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        debug!(
            host = %creds.hostname,
            local_port = local_port,
            remote_port = remote_port,
            "Spawning SSH forward"
        );

        command.spawn().map_err(|e| Error::Connectivity {
            worker: creds.hostname.clone(),
            message: format!("failed to spawn ssh forward: {}", e),
        })
    }
}
