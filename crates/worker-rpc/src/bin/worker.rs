//! Worker binary entry point
//!
//! Serves the Executor RPC service with the linear reference engine. Real
//! deployments link their own `EngineFactory` and use `WorkerServer`
//! directly.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fleet_core::engine::linear::LinearFactory;
use worker_rpc::{ExecutorService, WorkerServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "worker_rpc=info,fleet_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let addr: SocketAddr = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(|| "0.0.0.0:50051".parse().unwrap());

    tracing::info!("Starting worker on {}", addr);

    let service = ExecutorService::new(Arc::new(LinearFactory));
    WorkerServer::new(service).run_on(addr).await
}
