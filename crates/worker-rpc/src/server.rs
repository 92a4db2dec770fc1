//! Worker gRPC server with graceful shutdown
//!
//! This is the process that runs on every worker host (inside the remote
//! container at the far end of a tunnel, or directly for local testing).

use std::net::SocketAddr;
use std::time::Duration;

use tokio::signal;
use tonic::transport::Server;
use tracing::{error, info};

use fleet_core::types::DEFAULT_SERVICE_PORT;

use crate::proto::executor_server::ExecutorServer as ExecutorGrpcServer;
use crate::service::ExecutorService;

/// Worker server configuration
#[derive(Debug, Clone)]
pub struct WorkerServerConfig {
    /// Address to bind to
    pub addr: SocketAddr,

    /// Maximum message size in bytes, sized for full weight vectors
    pub max_message_size: usize,

    /// TCP keepalive interval
    pub tcp_keepalive: Option<Duration>,

    /// HTTP/2 keepalive ping interval
    pub http2_keepalive: Option<Duration>,
}

impl Default for WorkerServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_SERVICE_PORT)),
            max_message_size: 64 * 1024 * 1024, // 64MB
            tcp_keepalive: Some(Duration::from_secs(60)),
            http2_keepalive: Some(Duration::from_secs(20)),
        }
    }
}

/// Worker gRPC server
pub struct WorkerServer {
    config: WorkerServerConfig,
    service: ExecutorService,
}

impl WorkerServer {
    /// Create a server with default configuration
    pub fn new(service: ExecutorService) -> Self {
        Self {
            config: WorkerServerConfig::default(),
            service,
        }
    }

    /// Create with custom configuration
    pub fn with_config(service: ExecutorService, config: WorkerServerConfig) -> Self {
        Self { config, service }
    }

    /// Run the server until shutdown signal
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = self.config.addr;

        let grpc_service = ExecutorGrpcServer::new(self.service)
            .max_decoding_message_size(self.config.max_message_size)
            .max_encoding_message_size(self.config.max_message_size);

        let mut builder = Server::builder();

        if let Some(keepalive) = self.config.tcp_keepalive {
            builder = builder.tcp_keepalive(Some(keepalive));
        }

        if let Some(interval) = self.config.http2_keepalive {
            builder = builder.http2_keepalive_interval(Some(interval));
        }

        info!(address = %addr, "Worker server listening");

        builder
            .add_service(grpc_service)
            .serve_with_shutdown(addr, shutdown_signal())
            .await
            .map_err(|e| {
                error!(error = %e, "Worker server error");
                Box::new(e) as Box<dyn std::error::Error + Send + Sync>
            })?;

        info!("Worker server shutdown complete");
        Ok(())
    }

    /// Run the server on a specific address
    pub async fn run_on(
        self,
        addr: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut server = self;
        server.config.addr = addr;
        server.run().await
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
