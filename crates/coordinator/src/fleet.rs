//! Fleet context
//!
//! One [`Fleet`] owns the worker registry, tunnel manager, channel cache,
//! and model registry, constructed once and shared by reference. Worker
//! verification, resource discovery, model mirroring, and training dispatch
//! all run through here.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use fleet_core::engine::{DataLoader, EngineFactory, EngineModel};
use fleet_core::registry::{WorkerRegistry, LOCALHOST};
use fleet_core::tensor::{decode_f32s, encode_f32s};
use fleet_core::types::{ComputeResource, ConnectionInfo, ConnectionState, Credentials};
use fleet_core::{Error, FleetConfig, Result};
use tunnel::{RemoteProvisioner, ResourceDiscovery, SshRunner, TunnelHandle, TunnelManager};
use worker_rpc::proto::{ForwardPassRequest, GradientRequest, StoreModelWeightsRequest};
use worker_rpc::{check_liveness, ChannelCache};

use crate::models::ModelRegistry;
use crate::training::{
    extract_shard, partition_batch, reduce_gradients, reduce_losses, StepPhase, StepReport,
    WorkerStepResult,
};

/// Thread-safe handle to a fleet
pub type FleetHandle = Arc<Fleet>;

/// Coordinator context owning all fleet-wide state
pub struct Fleet {
    config: FleetConfig,
    registry: Arc<WorkerRegistry>,
    tunnels: Arc<TunnelManager>,
    channels: Arc<ChannelCache>,
    models: Arc<ModelRegistry>,
    factory: Arc<dyn EngineFactory>,
    discovery: Arc<ResourceDiscovery>,
    /// Live tunnel handle per remote worker; released on worker removal
    tunnel_handles: DashMap<String, TunnelHandle>,
}

impl Fleet {
    /// Construct a fleet and discover the local worker's resources.
    ///
    /// `localhost` exists from the start and is always connected.
    pub async fn new(
        config: FleetConfig,
        factory: Arc<dyn EngineFactory>,
        provisioner: Arc<dyn RemoteProvisioner>,
    ) -> Result<Self> {
        let registry = Arc::new(WorkerRegistry::new());
        let tunnels = Arc::new(TunnelManager::new(config.tunnel.clone(), provisioner));
        let channels = Arc::new(ChannelCache::new(config.network.clone()));
        let ssh = SshRunner::new(config.tunnel.ssh_connect_timeout, config.tunnel.command_timeout);
        let discovery = Arc::new(ResourceDiscovery::new(ssh, config.tunnel.command_timeout));

        let fleet = Self {
            config,
            registry,
            tunnels,
            channels,
            models: Arc::new(ModelRegistry::new()),
            factory,
            discovery,
            tunnel_handles: DashMap::new(),
        };

        let local_resources = fleet.discovery.discover(&Credentials::local()).await;
        fleet.registry.set_resources(LOCALHOST, local_resources)?;

        Ok(fleet)
    }

    /// The worker registry
    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    /// The model registry
    pub fn models(&self) -> &ModelRegistry {
        &self.models
    }

    /// The fleet configuration
    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    /// Add a worker and verify it synchronously: reachability, remote
    /// provisioning, tunnel, liveness, then resource discovery.
    ///
    /// Blocking by design; callers needing background connection handling
    /// wrap this in their own scheduling. Verification failures leave the
    /// worker registered in the `Failed` state and surface the error.
    pub async fn add_worker(&self, name: &str, credentials: Credentials) -> Result<()> {
        if name == LOCALHOST {
            return Err(Error::InvalidConfig {
                message: "localhost is managed by the fleet itself".to_string(),
            });
        }
        if credentials.is_local() {
            return Err(Error::InvalidConfig {
                message: "remote workers need a hostname".to_string(),
            });
        }

        let replaced = self.registry.insert(name, credentials.clone());
        if replaced {
            // Last-write-wins: drop the previous incarnation's connections
            self.channels.evict(name);
            if let Some((_, handle)) = self.tunnel_handles.remove(name) {
                self.tunnels.release(handle).await;
            }
        }

        self.registry.set_state(name, ConnectionState::Connecting)?;

        let verified = self.verify_worker(name, &credentials).await;
        if let Err(e) = verified {
            error!(worker = name, error = %e, "Worker verification failed");
            self.registry.set_state(name, ConnectionState::Failed)?;
            return Err(e);
        }

        self.registry.set_state(name, ConnectionState::Connected)?;

        let resources = if credentials.is_direct() {
            // No SSH session to probe through
            Vec::new()
        } else {
            self.discovery.discover(&credentials).await
        };
        self.registry.set_resources(name, resources)?;

        info!(worker = name, "Worker connected");
        Ok(())
    }

    async fn verify_worker(&self, name: &str, credentials: &Credentials) -> Result<()> {
        if credentials.is_direct() {
            let addr = format!("{}:{}", credentials.hostname, credentials.port);
            check_liveness(&addr, self.config.tunnel.liveness_timeout)
                .await
                .map_err(|e| Error::Connectivity {
                    worker: name.to_string(),
                    message: e.to_string(),
                })?;
            return Ok(());
        }

        let handle = self.tunnels.ensure_tunnel(name, credentials).await?;
        self.tunnel_handles.insert(name.to_string(), handle);
        Ok(())
    }

    /// Remove a worker, releasing its channel and tunnel.
    ///
    /// A no-op for `localhost` and for unknown names.
    pub async fn remove_worker(&self, name: &str) {
        if self.registry.remove(name).is_none() {
            return;
        }

        self.channels.evict(name);
        if let Some((_, handle)) = self.tunnel_handles.remove(name) {
            self.tunnels.release(handle).await;
        }
    }

    /// Worker names in partition order
    pub fn list_workers(&self) -> Vec<String> {
        self.registry.list()
    }

    /// How to reach a worker's RPC service.
    ///
    /// Local workers report process id -1 and the default service port.
    /// Remote workers report their tunnel's pid and local port, falling back
    /// to the default service port when no tunnel is live.
    pub fn connection_info(&self, name: &str) -> Result<ConnectionInfo> {
        let record = self.registry.get(name).ok_or_else(|| Error::WorkerNotFound {
            name: name.to_string(),
        })?;

        if record.is_local {
            return Ok(ConnectionInfo {
                process_id: -1,
                rpc_address: format!("localhost:{}", self.config.tunnel.service_port),
            });
        }

        if record.credentials.is_direct() {
            return Ok(ConnectionInfo {
                process_id: -1,
                rpc_address: format!(
                    "{}:{}",
                    record.credentials.hostname, record.credentials.port
                ),
            });
        }

        Ok(match self.tunnels.info(name) {
            Some((pid, port)) => ConnectionInfo {
                process_id: pid as i32,
                rpc_address: format!("localhost:{}", port),
            },
            None => ConnectionInfo {
                process_id: -1,
                rpc_address: format!("localhost:{}", self.config.tunnel.service_port),
            },
        })
    }

    /// Register a model for distributed execution and mirror its weights to
    /// every connected worker.
    ///
    /// Mirroring failures for individual workers are warnings, not errors:
    /// the model stays usable on whichever workers accepted it, and
    /// `ModelRegistry::mirrored_on` records exactly which those are.
    pub async fn register_model(&self, handle: Arc<dyn EngineModel>) -> Result<u32> {
        let state = handle.serialize_state();
        let index = self.models.append(handle);
        let model_id = format!("model_{}", index);

        info!(
            model_index = index,
            parameters = state.len(),
            "Registering model"
        );

        for worker in self.registry.connected() {
            let Some(record) = self.registry.get(&worker) else {
                continue;
            };

            if record.is_local {
                self.models.mark_mirrored(index, &worker)?;
                continue;
            }

            match self.store_weights_on(&worker, &state, &model_id).await {
                Ok(()) => {
                    self.models.mark_mirrored(index, &worker)?;
                    info!(worker = %worker, model_id = %model_id, "Model mirrored");
                }
                Err(e) => {
                    warn!(worker = %worker, model_id = %model_id, error = %e, "Model mirroring failed");
                }
            }
        }

        Ok(index)
    }

    async fn store_weights_on(&self, worker: &str, state: &[f32], model_id: &str) -> Result<()> {
        let info = self.connection_info(worker)?;
        let mut client = self.channels.client(worker, &info.rpc_address)?;

        let response = client
            .store_model_weights(StoreModelWeightsRequest {
                model_state: encode_f32s(state),
                model_id: model_id.to_string(),
            })
            .await
            .map_err(|e| Error::Rpc(format!("StoreModelWeights failed: {}", e)))?
            .into_inner();

        if !response.success {
            return Err(Error::Rpc(response.error_message));
        }
        Ok(())
    }

    /// Clear all registered models (local bookkeeping only)
    pub fn cleanup_models(&self) {
        self.models.cleanup();
    }

    /// Number of registered models
    pub fn model_count(&self) -> usize {
        self.models.count()
    }

    /// Run one training step: partition the batch over the fleet, dispatch
    /// shards concurrently, collect per-worker results, and reduce.
    ///
    /// `inputs` and `targets` are flattened batches of `batch_size` samples;
    /// both are partitioned with the identical round-robin assignment. A
    /// worker failure poisons only its own result slot; the step succeeds if
    /// at least one worker contributed. A gradient length mismatch during
    /// reduction aborts the step.
    pub async fn train_step(
        &self,
        model_index: u32,
        inputs: &[f32],
        targets: &[f32],
        batch_size: usize,
    ) -> Result<StepReport> {
        if batch_size == 0 {
            return Err(Error::InvalidConfig {
                message: "batch_size must be positive".to_string(),
            });
        }
        if inputs.len() % batch_size != 0 || targets.len() % batch_size != 0 {
            return Err(Error::Protocol {
                message: format!(
                    "batch of {} samples does not evenly divide {} inputs / {} targets",
                    batch_size,
                    inputs.len(),
                    targets.len()
                ),
            });
        }

        let model = self.models.get(model_index)?;
        let state = model.serialize_state();

        let workers = self.registry.list();
        if self.registry.connected().is_empty() {
            error!(phase = %StepPhase::Aborted, "No connected workers");
            return Err(Error::NoConnectedWorkers);
        }

        // The partition is fixed before any dispatch begins
        let partition = partition_batch(&workers, batch_size);
        let input_width = inputs.len() / batch_size;
        let target_width = targets.len() / batch_size;

        info!(
            phase = %StepPhase::Dispatching,
            batch_size = batch_size,
            workers = partition.len(),
            "Dispatching training step"
        );

        let criterion = self
            .factory
            .build_criterion(&self.config.training.criterion_type)?;

        let mut slots: Vec<Option<(WorkerStepResult, Option<Vec<f32>>)>> =
            (0..partition.len()).map(|_| None).collect();
        let mut tasks: JoinSet<(usize, WorkerStepResult, Option<Vec<f32>>)> = JoinSet::new();

        for (position, (worker, indices)) in partition.iter().enumerate() {
            let record = self.registry.get(worker).ok_or_else(|| Error::WorkerNotFound {
                name: worker.clone(),
            })?;

            if !record.state.is_connected() {
                slots[position] = Some((
                    WorkerStepResult::not_connected(worker, record.is_local),
                    None,
                ));
                continue;
            }

            let shard_input = extract_shard(inputs, indices, input_width);
            let shard_target = extract_shard(targets, indices, target_width);
            let worker_name = worker.clone();

            if record.is_local {
                let model = model.clone();
                let criterion = criterion.clone();
                tasks.spawn(async move {
                    let computed = tokio::task::spawn_blocking(move || {
                        model.gradients(&shard_input, &shard_target, criterion.as_ref())
                    })
                    .await
                    .map_err(|e| Error::Engine(format!("local compute panicked: {}", e)))
                    .and_then(|r| r);

                    match computed {
                        Ok((gradients, loss)) => (
                            position,
                            WorkerStepResult::succeeded(&worker_name, true, loss, gradients.len()),
                            Some(gradients),
                        ),
                        Err(e) => (
                            position,
                            WorkerStepResult::failed(&worker_name, true, e.to_string()),
                            None,
                        ),
                    }
                });
            } else {
                // Channel lookup failures are worker-scoped, like any other
                // dispatch failure
                let client = self
                    .connection_info(worker)
                    .and_then(|info| self.channels.client(worker, &info.rpc_address));
                let mut client = match client {
                    Ok(client) => client,
                    Err(e) => {
                        slots[position] = Some((
                            WorkerStepResult::failed(worker, false, e.to_string()),
                            None,
                        ));
                        continue;
                    }
                };

                let request = GradientRequest {
                    model_state: encode_f32s(&state),
                    input_data: encode_f32s(&shard_input),
                    target_data: encode_f32s(&shard_target),
                    model_type: self.config.training.model_type.clone(),
                    criterion_type: self.config.training.criterion_type.clone(),
                };

                tasks.spawn(async move {
                    let outcome = async {
                        let response = client
                            .get_gradients(request)
                            .await
                            .map_err(|e| Error::Rpc(format!("GetGradients failed: {}", e)))?
                            .into_inner();

                        if !response.success {
                            return Err(Error::Rpc(response.error_message));
                        }

                        let gradients = decode_f32s(&response.gradients)?;
                        Ok((gradients, response.loss))
                    }
                    .await;

                    match outcome {
                        Ok((gradients, loss)) => (
                            position,
                            WorkerStepResult::succeeded(&worker_name, false, loss, gradients.len()),
                            Some(gradients),
                        ),
                        Err(e) => (
                            position,
                            WorkerStepResult::failed(&worker_name, false, e.to_string()),
                            None,
                        ),
                    }
                });
            }
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((position, result, gradients)) => {
                    slots[position] = Some((result, gradients));
                }
                Err(e) => {
                    // A panicked dispatch task loses its slot attribution;
                    // surface it loudly rather than silently dropping work.
                    error!(error = %e, "Dispatch task panicked");
                }
            }
        }

        let mut per_worker = Vec::with_capacity(slots.len());
        let mut gradient_sets = Vec::new();
        let mut losses = Vec::new();

        for slot in slots.into_iter().flatten() {
            let (result, gradients) = slot;
            if result.success {
                if let (Some(g), Some(l)) = (gradients, result.loss) {
                    gradient_sets.push(g);
                    losses.push(l);
                }
            } else {
                warn!(
                    worker = %result.worker,
                    error = result.error.as_deref().unwrap_or(""),
                    "Worker shard failed"
                );
            }
            per_worker.push(result);
        }

        let participants = gradient_sets.len();
        let reduced = reduce_gradients(&gradient_sets)?;

        let report = StepReport {
            total_workers: per_worker.len(),
            participants,
            loss: if participants > 0 {
                Some(reduce_losses(&losses))
            } else {
                None
            },
            gradients: if participants > 0 { Some(reduced) } else { None },
            per_worker,
        };

        info!(
            phase = %StepPhase::Reporting,
            participants = report.participants,
            total_workers = report.total_workers,
            loss = report.loss,
            "Training step complete"
        );

        Ok(report)
    }

    /// Run a distributed forward pass: split the batch over connected
    /// workers, execute each shard (in-process or via `ForwardPass` RPC
    /// against the mirrored model), and reassemble outputs in sample order.
    ///
    /// Unlike a training step there is no partial-success contract: a batch
    /// output with holes is useless, so any shard failure fails the call.
    pub async fn forward(
        &self,
        model_index: u32,
        inputs: &[f32],
        batch_size: usize,
    ) -> Result<Vec<f32>> {
        if batch_size == 0 {
            return Err(Error::InvalidConfig {
                message: "batch_size must be positive".to_string(),
            });
        }
        if inputs.len() % batch_size != 0 {
            return Err(Error::Protocol {
                message: format!(
                    "batch of {} samples does not evenly divide {} inputs",
                    batch_size,
                    inputs.len()
                ),
            });
        }

        let model = self.models.get(model_index)?;
        let connected = self.registry.connected();
        if connected.is_empty() {
            return Err(Error::NoConnectedWorkers);
        }

        let partition = partition_batch(&connected, batch_size);
        let input_width = inputs.len() / batch_size;

        let mut tasks: JoinSet<Result<(usize, Vec<f32>)>> = JoinSet::new();

        for (position, (worker, indices)) in partition.iter().enumerate() {
            let record = self.registry.get(worker).ok_or_else(|| Error::WorkerNotFound {
                name: worker.clone(),
            })?;
            let shard = extract_shard(inputs, indices, input_width);

            if record.is_local {
                let model = model.clone();
                tasks.spawn(async move {
                    let output = tokio::task::spawn_blocking(move || model.forward(&shard))
                        .await
                        .map_err(|e| Error::Engine(format!("local forward panicked: {}", e)))
                        .and_then(|r| r)?;
                    Ok((position, output))
                });
            } else {
                let info = self.connection_info(worker)?;
                let mut client = self.channels.client(worker, &info.rpc_address)?;
                let worker_name = worker.clone();
                let request = ForwardPassRequest {
                    input_data: encode_f32s(&shard),
                    model_index,
                };

                tasks.spawn(async move {
                    let response = client
                        .forward_pass(request)
                        .await
                        .map_err(|e| Error::Rpc(format!("ForwardPass failed: {}", e)))?
                        .into_inner();

                    if !response.success {
                        return Err(Error::Connectivity {
                            worker: worker_name,
                            message: response.error_message,
                        });
                    }
                    Ok((position, decode_f32s(&response.output)?))
                });
            }
        }

        let mut shard_outputs: Vec<Option<Vec<f32>>> = vec![None; partition.len()];
        while let Some(joined) = tasks.join_next().await {
            let (position, output) = joined
                .map_err(|e| Error::Engine(format!("forward task panicked: {}", e)))??;
            shard_outputs[position] = Some(output);
        }

        // Scatter shard outputs back into sample order. Output width is
        // derived per shard; all shards must agree.
        let mut per_sample: Vec<Option<Vec<f32>>> = vec![None; batch_size];
        for ((_, indices), output) in partition.iter().zip(shard_outputs) {
            let output = output.ok_or_else(|| Error::Protocol {
                message: "missing shard output".to_string(),
            })?;
            if indices.is_empty() || output.len() % indices.len() != 0 {
                return Err(Error::Protocol {
                    message: format!(
                        "shard output of {} values does not evenly cover {} samples",
                        output.len(),
                        indices.len()
                    ),
                });
            }
            let width = output.len() / indices.len();
            for (slot, chunk) in indices.iter().zip(output.chunks_exact(width)) {
                per_sample[*slot] = Some(chunk.to_vec());
            }
        }

        let mut result = Vec::with_capacity(inputs.len());
        for sample in per_sample {
            result.extend(sample.ok_or_else(|| Error::Protocol {
                message: "batch output has uncovered samples".to_string(),
            })?);
        }
        Ok(result)
    }

    /// Drive training over a data loader: `epochs` passes, one training step
    /// per batch. Returns per-epoch mean losses and the final step report.
    pub async fn train(
        &self,
        model_index: u32,
        loader: &dyn DataLoader,
        epochs: usize,
        batch_size: usize,
    ) -> Result<TrainingSummary> {
        let mut epoch_losses = Vec::with_capacity(epochs);
        let mut last_report = None;

        for epoch in 0..epochs {
            let mut losses = Vec::with_capacity(loader.len());

            for batch_index in 0..loader.len() {
                let (inputs, targets) = loader.get_batch(batch_index)?;
                let report = self
                    .train_step(model_index, &inputs, &targets, batch_size)
                    .await?;

                if let Some(loss) = report.loss {
                    losses.push(loss);
                }
                last_report = Some(report);
            }

            let mean_loss = reduce_losses(&losses);
            info!(epoch = epoch, mean_loss = mean_loss, "Epoch complete");
            epoch_losses.push(mean_loss);
        }

        Ok(TrainingSummary {
            epoch_losses,
            last_report,
        })
    }

    /// Snapshot of the fleet for the status API
    pub fn status(&self) -> FleetStatus {
        let workers = self
            .registry
            .list()
            .into_iter()
            .filter_map(|name| self.registry.get(&name))
            .map(|record| WorkerStatusEntry {
                name: record.name.clone(),
                is_local: record.is_local,
                state: format!("{:?}", record.state),
                resources: record.resources.clone(),
                registered_at: record.registered_at,
                last_verified: record.last_verified,
            })
            .collect();

        FleetStatus {
            workers,
            model_count: self.models.count(),
            live_tunnels: self.tunnels.live_count(),
        }
    }
}

/// One worker's row in the fleet status snapshot
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatusEntry {
    pub name: String,
    pub is_local: bool,
    pub state: String,
    pub resources: Vec<ComputeResource>,
    pub registered_at: DateTime<Utc>,
    pub last_verified: Option<DateTime<Utc>>,
}

/// Snapshot of the whole fleet
#[derive(Debug, Clone, Serialize)]
pub struct FleetStatus {
    pub workers: Vec<WorkerStatusEntry>,
    pub model_count: usize,
    pub live_tunnels: usize,
}

/// Result of a multi-epoch training run
#[derive(Debug, Clone, Serialize)]
pub struct TrainingSummary {
    /// Mean reduced loss per epoch
    pub epoch_losses: Vec<f32>,

    /// Report of the final training step
    pub last_report: Option<StepReport>,
}
