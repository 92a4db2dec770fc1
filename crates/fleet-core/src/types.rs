//! Core type definitions for the fleet coordination layer

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Unique identifier types
pub type WorkerName = String;
pub type ModelIndex = u32;

/// Default port the worker RPC service listens on, both locally and on the
/// remote end of a tunnel.
pub const DEFAULT_SERVICE_PORT: u16 = 50051;

/// SSH credentials identifying how to reach a worker host.
///
/// Three shapes exist: full SSH credentials for tunneled remotes, a bare
/// host/port pair for workers reachable over plain TCP (no tunnel), and the
/// empty credentials that mark the local process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// SSH username (empty for local and direct workers)
    pub username: String,

    /// Hostname or address (empty for local workers)
    pub hostname: String,

    /// SSH port for tunneled workers, service port for direct workers
    pub port: u16,

    /// Path to the SSH private key, if not the default identity
    pub key_path: Option<String>,
}

impl Credentials {
    /// Credentials for an SSH-reachable remote worker
    pub fn new(
        username: impl Into<String>,
        hostname: impl Into<String>,
        port: u16,
        key_path: Option<String>,
    ) -> Self {
        Self {
            username: username.into(),
            hostname: hostname.into(),
            port,
            key_path,
        }
    }

    /// Credentials marking the local process
    pub fn local() -> Self {
        Self {
            username: String::new(),
            hostname: String::new(),
            port: 0,
            key_path: None,
        }
    }

    /// Credentials for a worker reachable over plain TCP, without an SSH
    /// tunnel (trusted-network deployments and in-process test servers)
    pub fn direct(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            username: String::new(),
            hostname: hostname.into(),
            port,
            key_path: None,
        }
    }

    /// True for the empty credentials of the local process
    pub fn is_local(&self) -> bool {
        self.username.is_empty() && self.hostname.is_empty()
    }

    /// True for tunnel-less TCP workers
    pub fn is_direct(&self) -> bool {
        self.username.is_empty() && !self.hostname.is_empty()
    }

    /// Human-readable `user@host:port` form
    pub fn connection_string(&self) -> String {
        format!("{}@{}:{}", self.username, self.hostname, self.port)
    }
}

/// Connection state of a registered worker
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConnectionState {
    /// Added but never verified
    Unverified,

    /// Verification in progress
    Connecting,

    /// Verified and usable for dispatch
    Connected,

    /// Verification failed; unusable until re-added
    Failed,
}

impl ConnectionState {
    /// Returns true if the worker can receive dispatched work
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// Kind of a discovered compute resource
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ResourceKind {
    /// Host CPU
    Cpu,

    /// Discrete GPU
    Gpu,

    /// Integrated accelerator (e.g. Apple Metal)
    Accelerator,
}

/// A compute resource discovered on a worker host.
///
/// Immutable once discovered; the whole list is recomputed on reconnect,
/// never patched incrementally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeResource {
    /// Resource name as reported by the probe
    pub name: String,

    /// Resource kind
    pub kind: ResourceKind,

    /// Probe-specific properties (memory sizes, status flags)
    pub properties: HashMap<String, String>,
}

impl ComputeResource {
    /// Create a resource with no properties
    pub fn new(name: impl Into<String>, kind: ResourceKind) -> Self {
        Self {
            name: name.into(),
            kind,
            properties: HashMap::new(),
        }
    }

    /// Attach a property, builder-style
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// Registry entry for one worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
    /// Worker name, unique within the registry
    pub name: WorkerName,

    /// How to reach the worker host
    pub credentials: Credentials,

    /// True for the in-process local worker
    pub is_local: bool,

    /// Current connection state
    pub state: ConnectionState,

    /// Discovered compute resources
    pub resources: Vec<ComputeResource>,

    /// When the worker was added to the registry
    pub registered_at: DateTime<Utc>,

    /// When the connection was last verified, if ever
    pub last_verified: Option<DateTime<Utc>>,
}

impl WorkerRecord {
    /// Create a record for a remote or direct worker, initially unverified
    pub fn new(name: impl Into<String>, credentials: Credentials) -> Self {
        let is_local = credentials.is_local();
        Self {
            name: name.into(),
            credentials,
            is_local,
            state: if is_local {
                ConnectionState::Connected
            } else {
                ConnectionState::Unverified
            },
            resources: Vec::new(),
            registered_at: Utc::now(),
            last_verified: None,
        }
    }
}

/// Address and forwarding-process identity for reaching a worker's RPC
/// service, as reported by `connection_info`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// OS process id of the SSH forward, -1 when no tunnel process exists
    pub process_id: i32,

    /// `host:port` the RPC channel should dial
    pub rpc_address: String,
}
