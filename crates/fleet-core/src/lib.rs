//! Fleet Core - Foundation for the fleet training coordination layer
//!
//! Provides core types, error handling, configuration, the worker registry,
//! and the engine/data-loader seams used by the tunnel, RPC, and
//! coordinator crates.

pub mod config;
pub mod engine;
pub mod error;
pub mod registry;
pub mod tensor;
pub mod types;

pub use config::FleetConfig;
pub use error::{Error, Result};
pub use registry::{WorkerRegistry, WorkerRegistryHandle, LOCALHOST};
pub use types::*;
