//! SSH tunnel lifecycle
//!
//! One forwarding process per remote worker, shared by reference count. The
//! OS process and its local port are torn down exactly when the last handle
//! is released. Release is explicit (`TunnelManager::release`), never a
//! side effect of drop timing, so every exit path must release its handle.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::process::Child;
use tracing::{info, warn};

use fleet_core::config::TunnelConfig;
use fleet_core::types::Credentials;
use fleet_core::{Error, Result};
use worker_rpc::check_liveness;

use crate::ports::PortAllocator;
use crate::provision::RemoteProvisioner;
use crate::ssh::SshRunner;

/// A live SSH forward to one remote worker
struct Tunnel {
    worker: String,
    local_port: u16,
    pid: u32,
    refs: AtomicUsize,
    child: Mutex<Option<Child>>,
}

/// Handle to a live tunnel, counting as one reference.
///
/// Deliberately not `Clone`: each handle is released exactly once, by
/// passing it back to `TunnelManager::release`. More references come from
/// further `ensure_tunnel` calls.
pub struct TunnelHandle {
    tunnel: Arc<Tunnel>,
}

impl TunnelHandle {
    /// Local end of the forward
    pub fn local_port(&self) -> u16 {
        self.tunnel.local_port
    }

    /// OS process id of the forwarding process (0 for stub tunnels in tests)
    pub fn pid(&self) -> u32 {
        self.tunnel.pid
    }

    /// Worker this tunnel belongs to
    pub fn worker(&self) -> &str {
        &self.tunnel.worker
    }

    /// Address the RPC channel should dial
    pub fn address(&self) -> String {
        format!("localhost:{}", self.tunnel.local_port)
    }
}

/// Owns all SSH forwards for a fleet
pub struct TunnelManager {
    config: TunnelConfig,
    ports: Arc<PortAllocator>,
    ssh: SshRunner,
    provisioner: Arc<dyn RemoteProvisioner>,
    tunnels: DashMap<String, Arc<Tunnel>>,
    /// Serializes setup/teardown per worker; distinct workers proceed
    /// concurrently
    worker_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl TunnelManager {
    /// Create a manager over its own port pool
    pub fn new(config: TunnelConfig, provisioner: Arc<dyn RemoteProvisioner>) -> Self {
        let ports = Arc::new(PortAllocator::new(
            config.port_range_start,
            config.port_range_end,
        ));
        let ssh = SshRunner::new(config.ssh_connect_timeout, config.command_timeout);
        Self {
            config,
            ports,
            ssh,
            provisioner,
            tunnels: DashMap::new(),
            worker_locks: DashMap::new(),
        }
    }

    /// The port pool backing this manager
    pub fn ports(&self) -> Arc<PortAllocator> {
        Arc::clone(&self.ports)
    }

    fn worker_lock(&self, worker: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.worker_locks
            .entry(worker.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Ensure a working forward to the worker, establishing it on first use.
    ///
    /// Idempotent: if a tunnel already exists for this worker the reference
    /// count is incremented and the existing handle returned. Otherwise the
    /// full setup sequence runs (SSH reachability, remote provisioning,
    /// port checkout, forward spawn, listen verification, one liveness RPC)
    /// with every step bounded and any failure unwinding the port and
    /// process. Setup failures are not retried here.
    pub async fn ensure_tunnel(&self, worker: &str, creds: &Credentials) -> Result<TunnelHandle> {
        let lock = self.worker_lock(worker);
        let _guard = lock.lock().await;

        if let Some(existing) = self.tunnels.get(worker) {
            existing.refs.fetch_add(1, Ordering::AcqRel);
            return Ok(TunnelHandle {
                tunnel: existing.clone(),
            });
        }

        self.ssh
            .check_reachable(creds)
            .await
            .map_err(|e| Error::TunnelSetup {
                stage: "ssh_check".to_string(),
                message: e.to_string(),
            })?;

        let provisioned = self.provisioner.ensure_running(creds).await?;
        if !provisioned {
            return Err(Error::Provisioning {
                host: creds.hostname.clone(),
                message: "remote worker service not running".to_string(),
            });
        }

        let local_port = self.ports.acquire()?;

        let child = match self
            .ssh
            .spawn_forward(creds, local_port, self.config.service_port)
        {
            Ok(child) => child,
            Err(e) => {
                self.ports.release(local_port);
                return Err(Error::TunnelSetup {
                    stage: "spawn_forward".to_string(),
                    message: e.to_string(),
                });
            }
        };

        let pid = child.id().unwrap_or_default();

        if let Err(e) = self.wait_for_listen(local_port).await {
            self.abort_setup(child, local_port).await;
            return Err(Error::TunnelSetup {
                stage: "verify_forward".to_string(),
                message: e.to_string(),
            });
        }

        let addr = format!("localhost:{}", local_port);
        if let Err(e) = check_liveness(&addr, self.config.liveness_timeout).await {
            self.abort_setup(child, local_port).await;
            return Err(Error::TunnelSetup {
                stage: "liveness_rpc".to_string(),
                message: e.to_string(),
            });
        }

        info!(
            worker = worker,
            local_port = local_port,
            pid = pid,
            "SSH tunnel established"
        );

        let tunnel = Arc::new(Tunnel {
            worker: worker.to_string(),
            local_port,
            pid,
            refs: AtomicUsize::new(1),
            child: Mutex::new(Some(child)),
        });
        self.tunnels.insert(worker.to_string(), tunnel.clone());

        Ok(TunnelHandle { tunnel })
    }

    /// Release one reference; tears the tunnel down at zero
    pub async fn release(&self, handle: TunnelHandle) {
        let worker = handle.tunnel.worker.clone();
        let lock = self.worker_lock(&worker);
        let _guard = lock.lock().await;

        let remaining = handle.tunnel.refs.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining > 0 {
            return;
        }

        self.tunnels.remove(&worker);

        let child = handle.tunnel.child.lock().take();
        if let Some(mut child) = child {
            if let Err(e) = child.start_kill() {
                warn!(worker = %worker, error = %e, "Failed to kill tunnel process");
            }
            let _ = child.wait().await;
        }

        self.ports.release(handle.tunnel.local_port);
        info!(
            worker = %worker,
            local_port = handle.tunnel.local_port,
            "SSH tunnel torn down"
        );
    }

    /// (pid, local port) of a worker's live tunnel, without taking a
    /// reference
    pub fn info(&self, worker: &str) -> Option<(u32, u16)> {
        self.tunnels
            .get(worker)
            .map(|t| (t.pid, t.local_port))
    }

    /// Number of live tunnels
    pub fn live_count(&self) -> usize {
        self.tunnels.len()
    }

    async fn wait_for_listen(&self, port: u16) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.config.forward_ready_timeout;

        loop {
            if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Timeout {
                    operation: format!("forward listen on port {}", port),
                    timeout_ms: self.config.forward_ready_timeout.as_millis() as u64,
                });
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    async fn abort_setup(&self, mut child: Child, port: u16) {
        let _ = child.start_kill();
        let _ = child.wait().await;
        self.ports.release(port);
    }
}

#[cfg(test)]
impl TunnelManager {
    /// Insert a processless tunnel for ownership tests
    fn insert_stub(&self, worker: &str) -> Result<TunnelHandle> {
        let local_port = self.ports.acquire()?;
        let tunnel = Arc::new(Tunnel {
            worker: worker.to_string(),
            local_port,
            pid: 0,
            refs: AtomicUsize::new(1),
            child: Mutex::new(None),
        });
        self.tunnels.insert(worker.to_string(), tunnel.clone());
        Ok(TunnelHandle { tunnel })
    }
}
