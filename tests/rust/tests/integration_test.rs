use anyhow::Result;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

use fleet_core::config::NetworkConfig;
use fleet_core::engine::linear::LinearFactory;
use fleet_core::tensor::{decode_f32s, encode_f32s};
use worker_rpc::proto::{
    ForwardPassRequest, GradientRequest, StoreModelWeightsRequest, TimeRequest,
};
use worker_rpc::{check_liveness, ChannelCache, ExecutorClient, ExecutorGrpcServer, ExecutorService};

// Helper to start a worker server on a random port and return the address +
// shutdown sender
async fn start_worker() -> Result<(String, tokio::sync::oneshot::Sender<()>)> {
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

    // Give it a moment to start
    sleep(Duration::from_millis(100)).await;

    Ok((format!("127.0.0.1:{}", port), tx))
}

#[tokio::test]
async fn test_full_rpc_flow() -> Result<()> {
    let (addr, _shutdown) = start_worker().await?;
    let mut client = ExecutorClient::connect(format!("http://{}", addr)).await?;

    // 1. Liveness
    let resp = client.get_server_time(TimeRequest {}).await?;
    assert!(resp.get_ref().server_time_ms > 0);

    // 2. Store weights for y = 3x - 1
    let resp = client
        .store_model_weights(StoreModelWeightsRequest {
            model_state: encode_f32s(&[3.0, -1.0]),
            model_id: "model_0".to_string(),
        })
        .await?;
    assert!(resp.get_ref().success, "{}", resp.get_ref().error_message);
    assert_eq!(resp.get_ref().model_id, "model_0");

    // 3. Forward pass against the stored model
    let resp = client
        .forward_pass(ForwardPassRequest {
            input_data: encode_f32s(&[2.0, 0.0]),
            model_index: 0,
        })
        .await?;
    assert!(resp.get_ref().success);
    assert_eq!(decode_f32s(&resp.get_ref().output)?, vec![5.0, -1.0]);

    // 4. Gradients with the model state inline
    let resp = client
        .get_gradients(GradientRequest {
            model_state: encode_f32s(&[1.0, 0.0]),
            input_data: encode_f32s(&[1.0, 2.0]),
            target_data: encode_f32s(&[0.0, 0.0]),
            model_type: "linear".to_string(),
            criterion_type: "mse".to_string(),
        })
        .await?;
    let grad_resp = resp.get_ref();
    assert!(grad_resp.success, "{}", grad_resp.error_message);
    let grads = decode_f32s(&grad_resp.gradients)?;
    assert!((grads[0] - 5.0).abs() < 1e-5);
    assert!((grads[1] - 3.0).abs() < 1e-5);
    assert!((grad_resp.loss - 2.5).abs() < 1e-5);

    Ok(())
}

#[tokio::test]
async fn test_forward_against_missing_model_is_soft_failure() -> Result<()> {
    let (addr, _shutdown) = start_worker().await?;
    let mut client = ExecutorClient::connect(format!("http://{}", addr)).await?;

    // Application-level failure, not a gRPC status error
    let resp = client
        .forward_pass(ForwardPassRequest {
            input_data: encode_f32s(&[1.0]),
            model_index: 5,
        })
        .await?;
    assert!(!resp.get_ref().success);
    assert!(resp.get_ref().error_message.contains("not found"));

    Ok(())
}

#[tokio::test]
async fn test_channel_cache_against_live_server() -> Result<()> {
    let (addr, _shutdown) = start_worker().await?;
    let cache = ChannelCache::new(NetworkConfig::default());

    let mut client = cache.client("w1", &addr)?;
    let resp = client.get_server_time(TimeRequest {}).await?;
    assert!(resp.get_ref().server_time_ms > 0);

    // Same worker reuses the cached channel
    let _again = cache.client("w1", &addr)?;
    assert_eq!(cache.len(), 1);

    cache.evict("w1");
    assert!(cache.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_liveness_probe() -> Result<()> {
    let (addr, shutdown) = start_worker().await?;

    let time = check_liveness(&addr, Duration::from_secs(5)).await?;
    assert!(time > 0);

    // After shutdown the probe fails instead of hanging
    shutdown.send(()).ok();
    sleep(Duration::from_millis(100)).await;
    assert!(check_liveness(&addr, Duration::from_secs(2)).await.is_err());

    Ok(())
}

#[tokio::test]
async fn test_large_weight_vector_roundtrip() -> Result<()> {
    let (addr, _shutdown) = start_worker().await?;
    let mut client = ExecutorClient::connect(format!("http://{}", addr)).await?;

    // ~4MB of weights: above tonic's default 4MB decode ceiling, so this
    // only passes because the server raises its message limits
    let state: Vec<f32> = (0..1_000_000).map(|i| (i % 97) as f32).collect();
    let resp = client
        .store_model_weights(StoreModelWeightsRequest {
            model_state: encode_f32s(&state),
            model_id: "model_big".to_string(),
        })
        .await?;
    assert!(resp.get_ref().success, "{}", resp.get_ref().error_message);

    Ok(())
}
