//! Coordinator binary entry point
//!
//! Builds a fleet from an optional JSON config file, connects the workers
//! declared there, and serves the HTTP status API.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use coordinator::{http_api, Fleet};
use fleet_core::engine::linear::LinearFactory;
use fleet_core::types::Credentials;
use fleet_core::FleetConfig;
use tunnel::{DockerProvisioner, SshRunner};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "coordinator=info,fleet_core=info,tunnel=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Optional JSON config path as the first argument
    let config: FleetConfig = match std::env::args().nth(1) {
        Some(path) => {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str(&raw)?
        }
        None => FleetConfig::default(),
    };

    let http_addr: SocketAddr = std::env::args()
        .nth(2)
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(|| "0.0.0.0:51051".parse().unwrap());

    let ssh = SshRunner::new(
        config.tunnel.ssh_connect_timeout,
        config.tunnel.command_timeout,
    );
    let provisioner = Arc::new(DockerProvisioner::new(ssh, config.provision.clone()));

    let workers = config.workers.clone();
    let fleet = Arc::new(Fleet::new(config, Arc::new(LinearFactory), provisioner).await?);

    for spec in workers {
        let credentials = if spec.username.is_empty() {
            Credentials::direct(spec.hostname.clone(), spec.port)
        } else {
            Credentials::new(
                spec.username.clone(),
                spec.hostname.clone(),
                spec.port,
                spec.key_path.clone(),
            )
        };

        // A worker that fails verification stays registered as Failed;
        // keep going so the rest of the fleet comes up.
        if let Err(e) = fleet.add_worker(&spec.name, credentials).await {
            tracing::warn!(worker = %spec.name, error = %e, "Worker failed to connect at startup");
        }
    }

    tracing::info!("Starting fleet status API on {}", http_addr);

    let router = http_api::create_router(fleet);
    let listener = tokio::net::TcpListener::bind(http_addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}
