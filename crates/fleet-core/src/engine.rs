//! Engine and data-loader seams
//!
//! The tensor/autograd runtime is an external collaborator. The coordinator
//! only needs forward passes, gradient computation, and flat float32
//! (de)serialization of parameter state, so those operations are the whole
//! trait surface. Parameter state moves across the RPC boundary as an
//! ordered flat vector; ordering is `state_dict` order.

use crate::{Error, Result};
use std::sync::Arc;

/// An opaque model handle usable for distributed execution.
///
/// Implementations must be internally synchronized: `load_state` may race
/// with `forward` from concurrently dispatched shards.
pub trait EngineModel: Send + Sync {
    /// Run a forward pass over a flattened input batch
    fn forward(&self, input: &[f32]) -> Result<Vec<f32>>;

    /// Compute flat parameter gradients and the loss for one input/target
    /// shard under the given criterion
    fn gradients(&self, input: &[f32], target: &[f32], criterion: &dyn Criterion)
        -> Result<(Vec<f32>, f32)>;

    /// Ordered named parameters
    fn state_dict(&self) -> Vec<(String, Vec<f32>)>;

    /// Flatten the parameter state, in `state_dict` order
    fn serialize_state(&self) -> Vec<f32>;

    /// Replace the parameter state from a flat vector; the length must match
    fn load_state(&self, state: &[f32]) -> Result<()>;

    /// Total number of scalar parameters
    fn parameter_len(&self) -> usize;
}

/// Loss criterion seam
pub trait Criterion: Send + Sync {
    /// Criterion type name, matching the wire contract's `criterion_type`
    fn name(&self) -> &str;

    /// Loss over a flattened output/target pair
    fn loss(&self, output: &[f32], target: &[f32]) -> f32;
}

/// Builds models and criteria from the wire contract's type names.
///
/// The worker-side RPC service uses this to reconstruct a model from an
/// inline flat state vector.
pub trait EngineFactory: Send + Sync {
    /// Instantiate a model of `model_type` (empty string selects the
    /// factory default) with the given flat parameter state
    fn build_model(&self, model_type: &str, state: &[f32]) -> Result<Arc<dyn EngineModel>>;

    /// Instantiate a criterion by type name (empty string selects the
    /// factory default)
    fn build_criterion(&self, criterion_type: &str) -> Result<Arc<dyn Criterion>>;
}

/// Opaque host data loader: an indexable sequence of (input, target) batches
pub trait DataLoader: Send + Sync {
    /// Number of batches
    fn len(&self) -> usize;

    /// True when the loader holds no batches
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fetch one batch as flattened (input, target) vectors
    fn get_batch(&self, index: usize) -> Result<(Vec<f32>, Vec<f32>)>;
}

/// In-memory data loader over pre-flattened batches
pub struct InMemoryLoader {
    batches: Vec<(Vec<f32>, Vec<f32>)>,
}

impl InMemoryLoader {
    /// Wrap a list of (input, target) batches
    pub fn new(batches: Vec<(Vec<f32>, Vec<f32>)>) -> Self {
        Self { batches }
    }
}

impl DataLoader for InMemoryLoader {
    fn len(&self) -> usize {
        self.batches.len()
    }

    fn get_batch(&self, index: usize) -> Result<(Vec<f32>, Vec<f32>)> {
        self.batches
            .get(index)
            .cloned()
            .ok_or_else(|| Error::Engine(format!("batch index {} out of range", index)))
    }
}

pub mod linear {
    //! Deterministic linear-regression reference engine.
    //!
    //! Small enough to compute gradients analytically, which makes
    //! distributed reductions verifiable by hand in tests. Also the default
    //! engine of the `worker` binary.

    use super::{Criterion, EngineFactory, EngineModel};
    use crate::{Error, Result};
    use parking_lot::RwLock;
    use std::sync::Arc;

    /// `y = w·x + b` over `in_dim` features, trained with squared error
    pub struct LinearModel {
        in_dim: usize,
        /// `in_dim` weights followed by one bias
        params: RwLock<Vec<f32>>,
    }

    impl LinearModel {
        /// Build from a flat state of `in_dim` weights plus a bias
        pub fn from_state(state: &[f32]) -> Result<Self> {
            if state.len() < 2 {
                return Err(Error::Engine(format!(
                    "linear state needs at least 2 parameters, got {}",
                    state.len()
                )));
            }
            Ok(Self {
                in_dim: state.len() - 1,
                params: RwLock::new(state.to_vec()),
            })
        }

        fn split_samples<'a>(&self, input: &'a [f32]) -> Result<Vec<&'a [f32]>> {
            if input.is_empty() || input.len() % self.in_dim != 0 {
                return Err(Error::Engine(format!(
                    "input length {} is not a non-empty multiple of in_dim {}",
                    input.len(),
                    self.in_dim
                )));
            }
            Ok(input.chunks_exact(self.in_dim).collect())
        }
    }

    impl EngineModel for LinearModel {
        fn forward(&self, input: &[f32]) -> Result<Vec<f32>> {
            let samples = self.split_samples(input)?;
            let params = self.params.read();
            let (weights, bias) = params.split_at(self.in_dim);

            Ok(samples
                .iter()
                .map(|x| {
                    x.iter()
                        .zip(weights)
                        .map(|(xi, wi)| xi * wi)
                        .sum::<f32>()
                        + bias[0]
                })
                .collect())
        }

        fn gradients(
            &self,
            input: &[f32],
            target: &[f32],
            criterion: &dyn Criterion,
        ) -> Result<(Vec<f32>, f32)> {
            if criterion.name() != "mse" {
                return Err(Error::Engine(format!(
                    "linear engine only differentiates mse, got {}",
                    criterion.name()
                )));
            }

            let samples = self.split_samples(input)?;
            if samples.len() != target.len() {
                return Err(Error::Engine(format!(
                    "target length {} does not match {} samples",
                    target.len(),
                    samples.len()
                )));
            }

            let outputs = self.forward(input)?;
            let n = samples.len() as f32;

            let mut grads = vec![0.0f32; self.in_dim + 1];
            for (x, (y, t)) in samples.iter().zip(outputs.iter().zip(target)) {
                let err = y - t;
                for (g, xi) in grads[..self.in_dim].iter_mut().zip(*x) {
                    *g += 2.0 * err * xi / n;
                }
                grads[self.in_dim] += 2.0 * err / n;
            }

            let loss = criterion.loss(&outputs, target);
            Ok((grads, loss))
        }

        fn state_dict(&self) -> Vec<(String, Vec<f32>)> {
            let params = self.params.read();
            let (weights, bias) = params.split_at(self.in_dim);
            vec![
                ("weight".to_string(), weights.to_vec()),
                ("bias".to_string(), bias.to_vec()),
            ]
        }

        fn serialize_state(&self) -> Vec<f32> {
            self.params.read().clone()
        }

        fn load_state(&self, state: &[f32]) -> Result<()> {
            let mut params = self.params.write();
            if state.len() != params.len() {
                return Err(Error::Engine(format!(
                    "state length {} does not match parameter count {}",
                    state.len(),
                    params.len()
                )));
            }
            params.copy_from_slice(state);
            Ok(())
        }

        fn parameter_len(&self) -> usize {
            self.in_dim + 1
        }
    }

    /// Mean-squared-error criterion
    pub struct MseCriterion;

    impl Criterion for MseCriterion {
        fn name(&self) -> &str {
            "mse"
        }

        fn loss(&self, output: &[f32], target: &[f32]) -> f32 {
            if output.is_empty() {
                return 0.0;
            }
            let sum: f32 = output
                .iter()
                .zip(target)
                .map(|(y, t)| (y - t) * (y - t))
                .sum();
            sum / output.len() as f32
        }
    }

    /// Factory for the linear reference engine
    pub struct LinearFactory;

    impl EngineFactory for LinearFactory {
        fn build_model(&self, model_type: &str, state: &[f32]) -> Result<Arc<dyn EngineModel>> {
            match model_type {
                "" | "linear" => Ok(Arc::new(LinearModel::from_state(state)?)),
                other => Err(Error::Engine(format!("unknown model type: {}", other))),
            }
        }

        fn build_criterion(&self, criterion_type: &str) -> Result<Arc<dyn Criterion>> {
            match criterion_type {
                "" | "mse" => Ok(Arc::new(MseCriterion)),
                other => Err(Error::Engine(format!("unknown criterion type: {}", other))),
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_forward() {
            // y = 2*x0 - 1*x1 + 0.5
            let model = LinearModel::from_state(&[2.0, -1.0, 0.5]).unwrap();
            let out = model.forward(&[1.0, 1.0, 3.0, 0.0]).unwrap();
            assert_eq!(out, vec![1.5, 6.5]);
        }

        #[test]
        fn test_gradients_hand_computed() {
            // y = w*x + b with w=1, b=0; samples x=[1, 2], targets [0, 0]
            // outputs [1, 2], errors [1, 2]
            // dw = 2*(1*1 + 2*2)/2 = 5, db = 2*(1 + 2)/2 = 3, loss = (1+4)/2
            let model = LinearModel::from_state(&[1.0, 0.0]).unwrap();
            let (grads, loss) = model
                .gradients(&[1.0, 2.0], &[0.0, 0.0], &MseCriterion)
                .unwrap();
            assert!((grads[0] - 5.0).abs() < 1e-6);
            assert!((grads[1] - 3.0).abs() < 1e-6);
            assert!((loss - 2.5).abs() < 1e-6);
        }

        #[test]
        fn test_load_state_length_mismatch() {
            let model = LinearModel::from_state(&[1.0, 2.0, 3.0]).unwrap();
            assert!(model.load_state(&[1.0]).is_err());
            assert!(model.load_state(&[4.0, 5.0, 6.0]).is_ok());
            assert_eq!(model.serialize_state(), vec![4.0, 5.0, 6.0]);
        }

        #[test]
        fn test_factory_rejects_unknown_types() {
            let factory = LinearFactory;
            assert!(factory.build_model("linear", &[1.0, 0.0]).is_ok());
            assert!(factory.build_model("resnet50", &[1.0, 0.0]).is_err());
            assert!(factory.build_criterion("mse").is_ok());
            assert!(factory.build_criterion("hinge").is_err());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_loader() {
        let loader = InMemoryLoader::new(vec![
            (vec![1.0, 2.0], vec![0.5]),
            (vec![3.0, 4.0], vec![1.5]),
        ]);
        assert_eq!(loader.len(), 2);
        assert!(!loader.is_empty());

        let (input, target) = loader.get_batch(1).unwrap();
        assert_eq!(input, vec![3.0, 4.0]);
        assert_eq!(target, vec![1.5]);

        assert!(loader.get_batch(2).is_err());
    }
}
