//! Coordinator-side channel cache
//!
//! One channel per worker, created lazily and cached for the life of the
//! process. Channels carry full model weight vectors, so they are configured
//! with generous message ceilings, and keepalive pings so a silently dead
//! tunnel is detected on the next call rather than hanging.

use std::time::Duration;

use dashmap::DashMap;
use tonic::transport::{Channel, Endpoint};
use tracing::info;

use fleet_core::config::NetworkConfig;
use fleet_core::{Error, Result};

use crate::proto::{executor_client::ExecutorClient, TimeRequest};

/// Cache of open RPC channels, keyed by worker name
pub struct ChannelCache {
    config: NetworkConfig,
    channels: DashMap<String, Channel>,
}

impl ChannelCache {
    /// Create an empty cache with the given channel configuration
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            config,
            channels: DashMap::new(),
        }
    }

    /// Get the cached channel for a worker, creating one if absent.
    ///
    /// Channels connect lazily; the first RPC dials. Creation races resolve
    /// through the map entry, so at most one channel is retained per worker.
    pub fn get_or_create(&self, worker: &str, addr: &str) -> Result<Channel> {
        if let Some(channel) = self.channels.get(worker) {
            return Ok(channel.clone());
        }

        let channel = self.build_channel(addr)?;
        info!(worker = worker, address = addr, "Created RPC channel");

        let entry = self.channels.entry(worker.to_string()).or_insert(channel);
        Ok(entry.clone())
    }

    /// A ready-to-use client for a worker, with message ceilings applied
    pub fn client(&self, worker: &str, addr: &str) -> Result<ExecutorClient<Channel>> {
        let channel = self.get_or_create(worker, addr)?;
        Ok(ExecutorClient::new(channel)
            .max_decoding_message_size(self.config.max_message_size)
            .max_encoding_message_size(self.config.max_message_size))
    }

    /// Drop a worker's channel; only called on explicit worker removal
    pub fn evict(&self, worker: &str) {
        if self.channels.remove(worker).is_some() {
            info!(worker = worker, "Evicted RPC channel");
        }
    }

    /// Number of cached channels
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// True when no channels are cached
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    fn build_channel(&self, addr: &str) -> Result<Channel> {
        let endpoint = Endpoint::from_shared(format!("http://{}", addr))
            .map_err(|e| Error::Transport(format!("invalid address {}: {}", addr, e)))?
            .connect_timeout(self.config.connect_timeout)
            .timeout(self.config.request_timeout)
            .http2_keep_alive_interval(self.config.keepalive_interval)
            .keep_alive_timeout(self.config.keepalive_timeout)
            .keep_alive_while_idle(true);

        Ok(endpoint.connect_lazy())
    }
}

/// One application-level liveness probe: dial `addr` and ask for the server
/// time, all within `timeout`. Returns the reported server time.
pub async fn check_liveness(addr: &str, timeout: Duration) -> Result<i64> {
    let probe = async {
        let endpoint = Endpoint::from_shared(format!("http://{}", addr))
            .map_err(|e| Error::Transport(format!("invalid address {}: {}", addr, e)))?
            .connect_timeout(timeout);

        let channel = endpoint
            .connect()
            .await
            .map_err(|e| Error::Transport(format!("failed to dial {}: {}", addr, e)))?;

        let mut client = ExecutorClient::new(channel);
        let response = client
            .get_server_time(TimeRequest {})
            .await
            .map_err(|e| Error::Rpc(format!("GetServerTime failed: {}", e)))?;

        Ok(response.into_inner().server_time_ms)
    };

    tokio::time::timeout(timeout, probe)
        .await
        .map_err(|_| Error::Timeout {
            operation: "GetServerTime".to_string(),
            timeout_ms: timeout.as_millis() as u64,
        })?
}
