//! Coordinator for fleet-distributed training
//!
//! This crate drives training across the fleet:
//! - **Model lifecycle**: registration, weight mirroring to every connected
//!   worker, bulk cleanup
//! - **Training steps**: deterministic batch partitioning, concurrent
//!   dispatch (in-process for local workers, RPC for remote ones),
//!   collection with per-worker failure isolation, sum-then-average
//!   reduction
//! - **Fleet context**: one [`Fleet`] object owning the worker registry,
//!   tunnel manager, channel cache, and model registry
//! - **Status API**: read-only HTTP endpoints over the fleet state
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use coordinator::Fleet;
//! use fleet_core::engine::linear::LinearFactory;
//! use fleet_core::{Credentials, FleetConfig};
//! use tunnel::StaticProvisioner;
//!
//! #[tokio::main]
//! async fn main() -> fleet_core::Result<()> {
//!     let fleet = Fleet::new(
//!         FleetConfig::default(),
//!         Arc::new(LinearFactory),
//!         Arc::new(StaticProvisioner),
//!     )
//!     .await?;
//!     fleet
//!         .add_worker("gpu1", Credentials::new("ubuntu", "gpu1.example.com", 22, None))
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod fleet;
pub mod http_api;
pub mod models;
pub mod training;

pub use fleet::{Fleet, FleetHandle, FleetStatus, TrainingSummary};
pub use models::ModelRegistry;
pub use training::{
    partition_batch, reduce_gradients, reduce_losses, StepPhase, StepReport, WorkerStepResult,
};
