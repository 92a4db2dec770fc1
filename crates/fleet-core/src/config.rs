//! Fleet configuration types

use crate::types::DEFAULT_SERVICE_PORT;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main fleet configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetConfig {
    /// RPC channel settings
    pub network: NetworkConfig,

    /// SSH tunnel settings
    pub tunnel: TunnelConfig,

    /// Remote provisioning settings
    pub provision: ProvisionConfig,

    /// Training dispatch settings
    pub training: TrainingConfig,

    /// Workers to add at startup
    pub workers: Vec<WorkerSpec>,
}

/// Declarative worker entry for config-driven fleets
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSpec {
    /// Registry name for the worker
    pub name: String,

    /// SSH username (empty for direct TCP workers)
    #[serde(default)]
    pub username: String,

    /// Hostname or address
    pub hostname: String,

    /// SSH port (or service port for direct workers)
    pub port: u16,

    /// SSH private key path
    #[serde(default)]
    pub key_path: Option<String>,
}

/// RPC channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Connection timeout
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,

    /// Per-RPC request timeout (every dispatch carries this deadline)
    #[serde(with = "duration_ms")]
    pub request_timeout: Duration,

    /// HTTP/2 keepalive ping interval, to detect dead tunnels promptly
    #[serde(with = "duration_ms")]
    pub keepalive_interval: Duration,

    /// How long to wait for a keepalive ack before declaring the peer dead
    #[serde(with = "duration_ms")]
    pub keepalive_timeout: Duration,

    /// Maximum message size in bytes, sized for full model weight vectors
    pub max_message_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(60),
            keepalive_interval: Duration::from_secs(20),
            keepalive_timeout: Duration::from_secs(10),
            max_message_size: 64 * 1024 * 1024, // 64MB
        }
    }
}

/// SSH tunnel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// First local port eligible for tunnel forwards
    pub port_range_start: u16,

    /// Last local port eligible for tunnel forwards (inclusive)
    pub port_range_end: u16,

    /// Remote port the worker RPC service listens on
    pub service_port: u16,

    /// SSH connection timeout passed to `-o ConnectTimeout`
    #[serde(with = "duration_ms")]
    pub ssh_connect_timeout: Duration,

    /// Overall timeout for a single remote shell command
    #[serde(with = "duration_ms")]
    pub command_timeout: Duration,

    /// How long to wait for the local forward to start accepting connections
    #[serde(with = "duration_ms")]
    pub forward_ready_timeout: Duration,

    /// Deadline for the liveness RPC through a fresh tunnel
    #[serde(with = "duration_ms")]
    pub liveness_timeout: Duration,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            port_range_start: 50051,
            port_range_end: 50100,
            service_port: DEFAULT_SERVICE_PORT,
            ssh_connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(30),
            forward_ready_timeout: Duration::from_secs(10),
            liveness_timeout: Duration::from_secs(10),
        }
    }
}

/// Remote provisioning configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionConfig {
    /// Name of the worker service container on the remote host
    pub container_name: String,

    /// Remote directory that receives the deploy artifacts
    pub deploy_dir: String,

    /// Local files copied into the deploy directory before starting
    pub artifacts: Vec<String>,

    /// Remote command that builds/starts the worker container
    pub start_command: String,

    /// Whether to install the container runtime if it is missing
    pub install_if_missing: bool,

    /// Overall timeout for slow provisioning steps (install, image build)
    #[serde(with = "duration_ms")]
    pub step_timeout: Duration,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            container_name: "canopy-worker".to_string(),
            deploy_dir: "/tmp/canopy-deploy".to_string(),
            artifacts: Vec::new(),
            start_command: "cd /tmp/canopy-deploy && chmod +x run-worker.sh && ./run-worker.sh"
                .to_string(),
            install_if_missing: true,
            step_timeout: Duration::from_secs(300),
        }
    }
}

/// Training dispatch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Model type name sent with gradient requests
    pub model_type: String,

    /// Criterion type name sent with gradient requests
    pub criterion_type: String,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            model_type: "linear".to_string(),
            criterion_type: "mse".to_string(),
        }
    }
}

/// Duration (de)serialization as integer milliseconds
mod duration_ms {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = FleetConfig::default();
        assert_eq!(config.tunnel.port_range_start, 50051);
        assert_eq!(config.tunnel.port_range_end, 50100);
        assert_eq!(config.tunnel.service_port, 50051);
        assert_eq!(config.network.max_message_size, 64 * 1024 * 1024);
    }

    #[test]
    fn test_config_serialization() {
        let config = FleetConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: FleetConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.tunnel.service_port, config.tunnel.service_port);
        assert_eq!(parsed.network.request_timeout, config.network.request_timeout);
    }

    #[test]
    fn test_worker_spec_parsing() {
        let json = r#"{"name": "gpu1", "username": "ubuntu", "hostname": "10.0.0.5", "port": 22}"#;
        let spec: WorkerSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.name, "gpu1");
        assert!(spec.key_path.is_none());
    }
}
