//! Compute resource discovery
//!
//! Probes a worker host for CPU and accelerator inventory with a fixed,
//! ordered probe sequence. Probes never fail the discovery: a probe that
//! errors or prints nothing simply contributes no resource. Results are in
//! probe-declaration order, not sorted; callers must not assume stability
//! across probe-set changes.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info};

use fleet_core::types::{ComputeResource, Credentials, ResourceKind};

use crate::ssh::SshRunner;

const CPU_PROBE: &str =
    "sysctl -n machdep.cpu.brand_string 2>/dev/null || grep -m1 'model name' /proc/cpuinfo 2>/dev/null | cut -d: -f2-";

const METAL_PROBE: &str = "system_profiler SPDisplaysDataType 2>/dev/null | grep 'Metal:' 2>/dev/null";

const GPU_PROBE: &str =
    "nvidia-smi --query-gpu=name,memory.total,memory.free --format=csv,noheader 2>/dev/null";

const GPU_FALLBACK_PROBE: &str = "nvidia-smi 2>/dev/null | grep 'NVIDIA'";

/// Probes local or remote hosts for compute resources
pub struct ResourceDiscovery {
    ssh: SshRunner,
    command_timeout: Duration,
}

impl ResourceDiscovery {
    /// Create a discovery runner; remote probes go through `ssh`
    pub fn new(ssh: SshRunner, command_timeout: Duration) -> Self {
        Self {
            ssh,
            command_timeout,
        }
    }

    /// Run the probe sequence against a worker host.
    ///
    /// Local credentials probe the local shell; anything else probes over
    /// the worker's SSH session.
    pub async fn discover(&self, creds: &Credentials) -> Vec<ComputeResource> {
        let mut resources = Vec::new();

        if let Some(output) = self.exec(creds, CPU_PROBE).await {
            let name = output.trim();
            if !name.is_empty() {
                resources.push(ComputeResource::new(name, ResourceKind::Cpu));
            }
        }

        if let Some(output) = self.exec(creds, METAL_PROBE).await {
            if !output.trim().is_empty() {
                resources.push(
                    ComputeResource::new("Metal Performance Shaders", ResourceKind::Accelerator)
                        .with_property("status", "Available"),
                );
            }
        }

        if let Some(output) = self.exec(creds, GPU_PROBE).await {
            resources.extend(parse_gpu_csv(&output));
        }

        // Plain-text fallback when the structured query found nothing at all
        if resources.is_empty() {
            if let Some(output) = self.exec(creds, GPU_FALLBACK_PROBE).await {
                if !output.trim().is_empty() {
                    resources.push(
                        ComputeResource::new("NVIDIA GPU", ResourceKind::Gpu)
                            .with_property("status", "Available"),
                    );
                }
            }
        }

        let host = if creds.is_local() {
            "localhost"
        } else {
            creds.hostname.as_str()
        };
        info!(
            host = host,
            resource_count = resources.len(),
            "Resource discovery complete"
        );
        resources
    }

    async fn exec(&self, creds: &Credentials, probe: &str) -> Option<String> {
        let result = if creds.is_local() {
            self.exec_local(probe).await
        } else {
            self.ssh.run(creds, probe).await.ok()
        };

        if result.is_none() {
            debug!(probe = probe, "Probe produced no output");
        }
        result
    }

    async fn exec_local(&self, probe: &str) -> Option<String> {
        let output = tokio::time::timeout(
            self.command_timeout,
            Command::new("sh")
                .arg("-c")
                .arg(probe)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .output(),
        )
        .await
        .ok()?
        .ok()?;

        if output.status.success() {
            Some(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            None
        }
    }
}

/// Parse `nvidia-smi --format=csv,noheader` lines: `name, total, free`
fn parse_gpu_csv(output: &str) -> Vec<ComputeResource> {
    output
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.splitn(3, ',').map(str::trim).collect();
            match fields.as_slice() {
                [name, total, free] if !name.is_empty() => Some(
                    ComputeResource::new(*name, ResourceKind::Gpu)
                        .with_property("total_memory", *total)
                        .with_property("free_memory", *free),
                ),
                _ => None,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_gpu_csv() {
        let output = "NVIDIA A100-SXM4-40GB, 40960 MiB, 39500 MiB\n\
                      NVIDIA A100-SXM4-40GB, 40960 MiB, 40960 MiB\n";
        let gpus = parse_gpu_csv(output);

        assert_eq!(gpus.len(), 2);
        assert_eq!(gpus[0].name, "NVIDIA A100-SXM4-40GB");
        assert_eq!(gpus[0].kind, ResourceKind::Gpu);
        assert_eq!(
            gpus[0].properties.get("total_memory"),
            Some(&"40960 MiB".to_string())
        );
        assert_eq!(
            gpus[1].properties.get("free_memory"),
            Some(&"40960 MiB".to_string())
        );
    }

    #[test]
    fn test_parse_gpu_csv_ignores_malformed_lines() {
        assert!(parse_gpu_csv("").is_empty());
        assert!(parse_gpu_csv("garbage without commas\n").is_empty());
        assert_eq!(parse_gpu_csv("GeForce RTX 3090, 24576 MiB, 1024 MiB").len(), 1);
    }

    #[tokio::test]
    async fn test_local_discovery_never_fails() {
        let ssh = SshRunner::new(Duration::from_secs(1), Duration::from_secs(5));
        let discovery = ResourceDiscovery::new(ssh, Duration::from_secs(5));

        // Whatever this host has, discovery returns without error and every
        // entry has a non-empty name.
        let resources = discovery.discover(&Credentials::local()).await;
        assert!(resources.iter().all(|r| !r.name.is_empty()));
    }
}
