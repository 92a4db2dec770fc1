//! Error types for the fleet coordination layer

use thiserror::Error;

/// Result type alias using the fleet Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the fleet coordination layer
#[derive(Error, Debug)]
pub enum Error {
    // Connectivity errors (SSH, tunnels, channels)
    #[error("Connectivity failure for worker {worker}: {message}")]
    Connectivity { worker: String, message: String },

    #[error("Tunnel setup failed at stage {stage}: {message}")]
    TunnelSetup { stage: String, message: String },

    #[error("Provisioning failed on {host}: {message}")]
    Provisioning { host: String, message: String },

    // Wire-contract errors
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Transport error: {0}")]
    Transport(String),

    // Resource errors
    #[error("Resource exhausted: {message}")]
    ResourceExhausted { message: String },

    // Registry errors
    #[error("Worker not found: {name}")]
    WorkerNotFound { name: String },

    // Training-step errors
    #[error("Gradient length mismatch during reduction: expected {expected}, got {actual}")]
    Reduce { expected: usize, actual: usize },

    #[error("No connected workers available")]
    NoConnectedWorkers,

    #[error("Model not found: index {index}")]
    ModelNotFound { index: u32 },

    // Engine seam errors
    #[error("Engine error: {0}")]
    Engine(String),

    // Timeout errors
    #[error("Operation timeout: {operation} after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Configuration errors
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },
}

impl Error {
    /// Returns true if this error is scoped to a single worker: it poisons
    /// that worker's slot in a training-step result but must not abort the
    /// step for the remaining workers.
    pub fn is_worker_scoped(&self) -> bool {
        matches!(
            self,
            Error::Connectivity { .. }
                | Error::TunnelSetup { .. }
                | Error::Provisioning { .. }
                | Error::Rpc(_)
                | Error::Transport(_)
                | Error::Timeout { .. }
                | Error::Protocol { .. }
                | Error::Engine(_)
        )
    }

    /// Returns true if this error aborts an entire training step.
    pub fn is_step_fatal(&self) -> bool {
        matches!(
            self,
            Error::Reduce { .. } | Error::NoConnectedWorkers | Error::ModelNotFound { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
