//! Worker RPC surface
//!
//! This crate owns the wire contract between the coordinator and worker
//! hosts: the generated protobuf types, the worker-side `Executor` service
//! and server (the process that runs inside the remote container at the far
//! end of each tunnel), and the coordinator-side channel cache.

pub mod channel;
pub mod server;
pub mod service;

// Re-export generated protobuf types
pub mod proto {
    tonic::include_proto!("worker");
}

// Re-export main types
pub use channel::{check_liveness, ChannelCache};
pub use server::{WorkerServer, WorkerServerConfig};
pub use service::ExecutorService;

// Re-export proto service trait and client for convenience
pub use proto::executor_client::ExecutorClient;
pub use proto::executor_server::ExecutorServer as ExecutorGrpcServer;
