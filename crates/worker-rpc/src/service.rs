//! Worker-side gRPC service implementation
//!
//! Implements the four methods defined in worker.proto against the engine
//! seam. Application-level failures (bad payloads, unknown models) are
//! reported through the `success`/`error_message` response fields rather
//! than gRPC status codes, so a partially working worker stays reachable.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

use fleet_core::engine::{EngineFactory, EngineModel};
use fleet_core::tensor::{decode_f32s, encode_f32s};

use crate::proto::{
    executor_server::Executor, ForwardPassRequest, ForwardPassResponse, GradientRequest,
    GradientResponse, StoreModelWeightsRequest, StoreModelWeightsResponse, TimeRequest,
    TimeResponse,
};

/// A model mirrored onto this worker
struct StoredModel {
    /// Flat parameter state as received
    state: Vec<f32>,

    /// Live engine handle built from the state
    model: Arc<dyn EngineModel>,
}

/// Worker execution service
#[derive(Clone)]
pub struct ExecutorService {
    /// Engine seam used to build models and criteria from wire type names
    factory: Arc<dyn EngineFactory>,

    /// Stored models keyed by model id (`model_<index>`)
    models: Arc<DashMap<String, StoredModel>>,
}

impl ExecutorService {
    /// Create a service around an engine factory
    pub fn new(factory: Arc<dyn EngineFactory>) -> Self {
        Self {
            factory,
            models: Arc::new(DashMap::new()),
        }
    }

    /// True if a model is stored under this id
    pub fn has_model(&self, model_id: &str) -> bool {
        self.models.contains_key(model_id)
    }

    /// Fetch a stored model handle
    pub fn get_model(&self, model_id: &str) -> Option<Arc<dyn EngineModel>> {
        self.models.get(model_id).map(|m| m.model.clone())
    }

    /// Drop a stored model
    pub fn remove_model(&self, model_id: &str) {
        self.models.remove(model_id);
    }

    /// Ids of all stored models
    pub fn stored_model_ids(&self) -> Vec<String> {
        self.models.iter().map(|e| e.key().clone()).collect()
    }
}

#[tonic::async_trait]
impl Executor for ExecutorService {
    async fn get_server_time(
        &self,
        _request: Request<TimeRequest>,
    ) -> Result<Response<TimeResponse>, Status> {
        Ok(Response::new(TimeResponse {
            server_time_ms: Utc::now().timestamp_millis(),
        }))
    }

    async fn store_model_weights(
        &self,
        request: Request<StoreModelWeightsRequest>,
    ) -> Result<Response<StoreModelWeightsResponse>, Status> {
        let req = request.into_inner();
        let model_id = req.model_id.clone();

        let fail = |message: String| {
            Ok(Response::new(StoreModelWeightsResponse {
                success: false,
                error_message: message,
                model_id: req.model_id.clone(),
            }))
        };

        let state = match decode_f32s(&req.model_state) {
            Ok(state) => state,
            Err(e) => return fail(e.to_string()),
        };

        let model = match self.factory.build_model("", &state) {
            Ok(model) => model,
            Err(e) => return fail(e.to_string()),
        };

        info!(
            model_id = %model_id,
            parameters = state.len(),
            "Stored model weights"
        );

        self.models.insert(model_id.clone(), StoredModel { state, model });

        Ok(Response::new(StoreModelWeightsResponse {
            success: true,
            error_message: String::new(),
            model_id,
        }))
    }

    async fn forward_pass(
        &self,
        request: Request<ForwardPassRequest>,
    ) -> Result<Response<ForwardPassResponse>, Status> {
        let req = request.into_inner();
        let model_id = format!("model_{}", req.model_index);

        let fail = |message: String| {
            warn!(model_id = %model_id, error = %message, "Forward pass failed");
            Ok(Response::new(ForwardPassResponse {
                success: false,
                error_message: message,
                output: Vec::new(),
            }))
        };

        let Some(entry) = self.models.get(&model_id) else {
            return fail(format!("model with index {} not found", req.model_index));
        };
        let model = entry.model.clone();
        drop(entry);

        if req.input_data.is_empty() {
            return fail("no input data provided".to_string());
        }

        let input = match decode_f32s(&req.input_data) {
            Ok(input) => input,
            Err(e) => return fail(e.to_string()),
        };

        let output = match model.forward(&input) {
            Ok(output) => output,
            Err(e) => return fail(e.to_string()),
        };

        debug!(
            model_id = %model_id,
            inputs = input.len(),
            outputs = output.len(),
            "Forward pass complete"
        );

        Ok(Response::new(ForwardPassResponse {
            success: true,
            error_message: String::new(),
            output: encode_f32s(&output),
        }))
    }

    async fn get_gradients(
        &self,
        request: Request<GradientRequest>,
    ) -> Result<Response<GradientResponse>, Status> {
        let req = request.into_inner();

        let fail = |message: String| {
            warn!(error = %message, "Gradient computation failed");
            Ok(Response::new(GradientResponse {
                gradients: Vec::new(),
                loss: 0.0,
                success: false,
                error_message: message,
            }))
        };

        let state = match decode_f32s(&req.model_state) {
            Ok(state) => state,
            Err(e) => return fail(e.to_string()),
        };
        let input = match decode_f32s(&req.input_data) {
            Ok(input) => input,
            Err(e) => return fail(e.to_string()),
        };
        let target = match decode_f32s(&req.target_data) {
            Ok(target) => target,
            Err(e) => return fail(e.to_string()),
        };

        let model = match self.factory.build_model(&req.model_type, &state) {
            Ok(model) => model,
            Err(e) => return fail(e.to_string()),
        };
        let criterion = match self.factory.build_criterion(&req.criterion_type) {
            Ok(criterion) => criterion,
            Err(e) => return fail(e.to_string()),
        };

        let (gradients, loss) = match model.gradients(&input, &target, criterion.as_ref()) {
            Ok(result) => result,
            Err(e) => return fail(e.to_string()),
        };

        debug!(
            parameters = state.len(),
            samples = target.len(),
            loss = loss,
            "Gradients computed"
        );

        Ok(Response::new(GradientResponse {
            gradients: encode_f32s(&gradients),
            loss,
            success: true,
            error_message: String::new(),
        }))
    }
}
