//! End-to-end distributed training tests
//!
//! Spins up real worker servers on loopback ports and drives full training
//! steps through a fleet: registration, model mirroring, partitioned
//! dispatch over real channels, reduction, and partial failure when a
//! worker dies mid-run.

use anyhow::Result;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

use coordinator::{reduce_gradients, Fleet};
use fleet_core::engine::linear::{LinearFactory, LinearModel, MseCriterion};
use fleet_core::engine::EngineModel;
use fleet_core::types::{ConnectionState, Credentials};
use fleet_core::FleetConfig;
use tunnel::StaticProvisioner;
use worker_rpc::{ExecutorGrpcServer, ExecutorService};

async fn start_worker() -> Result<(u16, tokio::sync::oneshot::Sender<()>)> {
    let service = ExecutorService::new(Arc::new(LinearFactory));

    let port = portpicker::pick_unused_port().expect("No ports free");
    let addr = SocketAddr::from_str(&format!("127.0.0.1:{}", port))?;

    let (tx, rx) = tokio::sync::oneshot::channel();
    let svc = ExecutorGrpcServer::new(service)
        .max_decoding_message_size(64 * 1024 * 1024)
        .max_encoding_message_size(64 * 1024 * 1024);

    let server = tonic::transport::Server::builder()
        .add_service(svc)
        .serve_with_shutdown(addr, async {
            rx.await.ok();
        });

    tokio::spawn(server);
    sleep(Duration::from_millis(100)).await;

    Ok((port, tx))
}

async fn fleet() -> Result<Fleet> {
    Ok(Fleet::new(
        FleetConfig::default(),
        Arc::new(LinearFactory),
        Arc::new(StaticProvisioner),
    )
    .await?)
}

fn linear(state: &[f32]) -> Arc<dyn EngineModel> {
    Arc::new(LinearModel::from_state(state).unwrap())
}

#[tokio::test]
async fn test_three_worker_training_step() -> Result<()> {
    let (port1, _shutdown1) = start_worker().await?;
    let (port2, _shutdown2) = start_worker().await?;

    let fleet = fleet().await?;
    fleet
        .add_worker("w1", Credentials::direct("127.0.0.1", port1))
        .await?;
    fleet
        .add_worker("w2", Credentials::direct("127.0.0.1", port2))
        .await?;

    assert_eq!(
        fleet.registry().connected(),
        vec!["localhost".to_string(), "w1".to_string(), "w2".to_string()]
    );

    // Model y = 2x + 1, mirrored onto all three workers
    let index = fleet.register_model(linear(&[2.0, 1.0])).await?;
    assert_eq!(index, 0);
    let mirrored = fleet.models().mirrored_on(0)?;
    assert_eq!(mirrored.len(), 3);
    assert!(mirrored.contains("w1") && mirrored.contains("w2"));

    // Batch of 12 scalar samples: x_i = i, t_i = i (so the model is wrong)
    let inputs: Vec<f32> = (0..12).map(|i| i as f32).collect();
    let targets: Vec<f32> = (0..12).map(|i| i as f32).collect();

    let report = fleet.train_step(index, &inputs, &targets, 12).await?;

    assert_eq!(report.total_workers, 3);
    assert_eq!(report.participants, 3);
    assert!(report.per_worker.iter().all(|r| r.success));

    // Re-derive the expectation: round-robin shards over
    // [localhost, w1, w2], each shard computed independently, then
    // sum-then-average.
    let model = linear(&[2.0, 1.0]);
    let mut shard_grads = Vec::new();
    let mut shard_losses = Vec::new();
    for offset in 0..3 {
        let shard_in: Vec<f32> = (0..12)
            .filter(|i| i % 3 == offset)
            .map(|i| i as f32)
            .collect();
        let shard_t = shard_in.clone();
        let (g, l) = model.gradients(&shard_in, &shard_t, &MseCriterion).unwrap();
        shard_grads.push(g);
        shard_losses.push(l);
    }
    let expected_grads = reduce_gradients(&shard_grads).unwrap();
    let expected_loss = shard_losses.iter().sum::<f32>() / 3.0;

    let got = report.gradients.as_ref().unwrap();
    assert_eq!(got.len(), expected_grads.len());
    for (g, e) in got.iter().zip(&expected_grads) {
        assert!((g - e).abs() < 1e-5, "gradient mismatch: {} vs {}", g, e);
    }
    assert!((report.loss.unwrap() - expected_loss).abs() < 1e-5);

    Ok(())
}

#[tokio::test]
async fn test_distributed_forward_preserves_sample_order() -> Result<()> {
    let (port1, _shutdown1) = start_worker().await?;
    let (port2, _shutdown2) = start_worker().await?;

    let fleet = fleet().await?;
    fleet
        .add_worker("w1", Credentials::direct("127.0.0.1", port1))
        .await?;
    fleet
        .add_worker("w2", Credentials::direct("127.0.0.1", port2))
        .await?;

    // y = 2x + 1, mirrored everywhere so remote ForwardPass can find it
    let index = fleet.register_model(linear(&[2.0, 1.0])).await?;

    let inputs: Vec<f32> = (0..9).map(|i| i as f32).collect();
    let output = fleet.forward(index, &inputs, 9).await?;

    // Shards ran on three different workers, but the reassembled output
    // must match a plain whole-batch forward exactly
    let expected = linear(&[2.0, 1.0]).forward(&inputs).unwrap();
    assert_eq!(output, expected);

    Ok(())
}

#[tokio::test]
async fn test_worker_dying_mid_run_is_partial_failure() -> Result<()> {
    let (port1, _shutdown1) = start_worker().await?;
    let (port2, shutdown2) = start_worker().await?;

    let fleet = fleet().await?;
    fleet
        .add_worker("w1", Credentials::direct("127.0.0.1", port1))
        .await?;
    fleet
        .add_worker("w2", Credentials::direct("127.0.0.1", port2))
        .await?;

    let index = fleet.register_model(linear(&[1.0, 0.0])).await?;

    let inputs: Vec<f32> = (0..6).map(|i| i as f32).collect();
    let targets = vec![0.0f32; 6];

    // First step: everyone participates
    let report = fleet.train_step(index, &inputs, &targets, 6).await?;
    assert_eq!(report.participants, 3);

    // Kill w2 and step again: w2's RPC fails, the step still succeeds over
    // the remaining two workers
    shutdown2.send(()).ok();
    sleep(Duration::from_millis(200)).await;

    let report = fleet.train_step(index, &inputs, &targets, 6).await?;
    assert_eq!(report.total_workers, 3);
    assert_eq!(report.participants, 2);

    let w2 = report.per_worker.iter().find(|r| r.worker == "w2").unwrap();
    assert!(!w2.success);
    assert!(w2.error.is_some());

    let succeeded: Vec<&str> = report
        .per_worker
        .iter()
        .filter(|r| r.success)
        .map(|r| r.worker.as_str())
        .collect();
    assert_eq!(succeeded, vec!["localhost", "w1"]);

    Ok(())
}

#[tokio::test]
async fn test_unreachable_ssh_worker_fails_and_stays_failed() -> Result<()> {
    let mut config = FleetConfig::default();
    config.tunnel.ssh_connect_timeout = Duration::from_secs(1);
    config.tunnel.command_timeout = Duration::from_secs(3);

    let fleet = Fleet::new(
        config,
        Arc::new(LinearFactory),
        Arc::new(StaticProvisioner),
    )
    .await?;

    // TEST-NET-1 address: guaranteed unreachable
    let result = fleet
        .add_worker("gpu1", Credentials::new("nobody", "192.0.2.1", 22, None))
        .await;
    assert!(result.is_err());

    let record = fleet.registry().get("gpu1").unwrap();
    assert_eq!(record.state, ConnectionState::Failed);

    // The failed worker still owns a shard slot but contributes nothing
    let index = fleet.register_model(linear(&[1.0, 0.0])).await?;
    let report = fleet
        .train_step(index, &[1.0, 2.0], &[1.0, 2.0], 2)
        .await?;
    assert_eq!(report.total_workers, 2);
    assert_eq!(report.participants, 1);

    Ok(())
}

#[tokio::test]
async fn test_remove_worker_cleans_up() -> Result<()> {
    let (port1, _shutdown1) = start_worker().await?;

    let fleet = fleet().await?;
    fleet
        .add_worker("w1", Credentials::direct("127.0.0.1", port1))
        .await?;
    assert!(fleet.registry().contains("w1"));

    fleet.remove_worker("w1").await;
    assert!(!fleet.registry().contains("w1"));

    // localhost is untouchable
    fleet.remove_worker("localhost").await;
    assert!(fleet.registry().contains("localhost"));

    Ok(())
}

#[tokio::test]
async fn test_model_registered_before_workers_mirrors_locally_only() -> Result<()> {
    let (port1, _shutdown1) = start_worker().await?;

    let fleet = fleet().await?;
    let index = fleet.register_model(linear(&[1.0, 0.0])).await?;

    // Registered before w1 joined: mirrored on localhost only. The stale
    // mirror set is observable, not silently patched.
    fleet
        .add_worker("w1", Credentials::direct("127.0.0.1", port1))
        .await?;
    let mirrored = fleet.models().mirrored_on(index)?;
    assert_eq!(mirrored.len(), 1);
    assert!(mirrored.contains("localhost"));

    // Training still succeeds everywhere: gradient requests carry the model
    // state inline
    let report = fleet
        .train_step(index, &[1.0, 2.0], &[1.0, 2.0], 2)
        .await?;
    assert_eq!(report.participants, 2);

    Ok(())
}
