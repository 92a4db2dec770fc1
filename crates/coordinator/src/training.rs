//! Training-step algorithms: partitioning and reduction
//!
//! Pure functions shared by the dispatch path and its tests. Partitioning
//! must be bit-for-bit deterministic: inputs and targets are split
//! independently in places and rely on deriving the identical assignment.

use serde::Serialize;

use fleet_core::{Error, Result};

/// Phase of one training step; terminal failure is `Aborted`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepPhase {
    Idle,
    PartitioningBatch,
    Dispatching,
    Collecting,
    Reducing,
    Reporting,
    Aborted,
}

impl std::fmt::Display for StepPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StepPhase::Idle => "idle",
            StepPhase::PartitioningBatch => "partitioning_batch",
            StepPhase::Dispatching => "dispatching",
            StepPhase::Collecting => "collecting",
            StepPhase::Reducing => "reducing",
            StepPhase::Reporting => "reporting",
            StepPhase::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Assign each sample index in `[0, batch_size)` to a worker, round-robin
/// over the given worker order (`sample_i -> workers[i % n]`).
///
/// Workers appear in the result in order of their first assigned sample, so
/// the output order matches the input worker order. Deterministic: the same
/// worker list and batch size always produce the same shards.
pub fn partition_batch(workers: &[String], batch_size: usize) -> Vec<(String, Vec<usize>)> {
    let mut distribution: Vec<(String, Vec<usize>)> = Vec::new();
    if workers.is_empty() {
        return distribution;
    }

    for i in 0..batch_size {
        let worker = &workers[i % workers.len()];
        match distribution.iter_mut().find(|(name, _)| name == worker) {
            Some((_, indices)) => indices.push(i),
            None => distribution.push((worker.clone(), vec![i])),
        }
    }

    distribution
}

/// Gather the flattened samples at `indices` from a batch where every
/// sample spans `sample_width` consecutive floats
pub fn extract_shard(data: &[f32], indices: &[usize], sample_width: usize) -> Vec<f32> {
    let mut shard = Vec::with_capacity(indices.len() * sample_width);
    for &i in indices {
        shard.extend_from_slice(&data[i * sample_width..(i + 1) * sample_width]);
    }
    shard
}

/// Element-wise sum of all gradient vectors, divided by the participant
/// count. All vectors must have equal length; a mismatch would silently
/// corrupt training if averaged, so it aborts the step instead.
pub fn reduce_gradients(gradients: &[Vec<f32>]) -> Result<Vec<f32>> {
    let Some(first) = gradients.first() else {
        return Ok(Vec::new());
    };

    let expected = first.len();
    let mut sum = vec![0.0f32; expected];

    for grad in gradients {
        if grad.len() != expected {
            return Err(Error::Reduce {
                expected,
                actual: grad.len(),
            });
        }
        for (acc, g) in sum.iter_mut().zip(grad) {
            *acc += g;
        }
    }

    let count = gradients.len() as f32;
    for acc in &mut sum {
        *acc /= count;
    }
    Ok(sum)
}

/// Sum-then-average over per-worker losses
pub fn reduce_losses(losses: &[f32]) -> f32 {
    if losses.is_empty() {
        return 0.0;
    }
    losses.iter().sum::<f32>() / losses.len() as f32
}

/// Outcome of one worker's shard within a training step
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStepResult {
    /// Worker name
    pub worker: String,

    /// True for the in-process local worker
    pub is_local: bool,

    /// Connection state at dispatch time
    pub is_connected: bool,

    /// Whether the shard produced gradients
    pub success: bool,

    /// Shard loss, when successful
    pub loss: Option<f32>,

    /// Gradient vector length, when successful
    pub gradient_len: Option<usize>,

    /// Failure description, when unsuccessful
    pub error: Option<String>,
}

impl WorkerStepResult {
    /// Result slot for a worker skipped because it was not connected
    pub fn not_connected(worker: &str, is_local: bool) -> Self {
        Self {
            worker: worker.to_string(),
            is_local,
            is_connected: false,
            success: false,
            loss: None,
            gradient_len: None,
            error: Some("not connected".to_string()),
        }
    }

    /// Result slot for a failed dispatch
    pub fn failed(worker: &str, is_local: bool, error: String) -> Self {
        Self {
            worker: worker.to_string(),
            is_local,
            is_connected: true,
            success: false,
            loss: None,
            gradient_len: None,
            error: Some(error),
        }
    }

    /// Result slot for a successful shard
    pub fn succeeded(worker: &str, is_local: bool, loss: f32, gradient_len: usize) -> Self {
        Self {
            worker: worker.to_string(),
            is_local,
            is_connected: true,
            success: true,
            loss: Some(loss),
            gradient_len: Some(gradient_len),
            error: None,
        }
    }
}

/// Aggregate result of one training step
#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    /// One entry per partitioned worker, in partition order
    pub per_worker: Vec<WorkerStepResult>,

    /// Total workers the batch was partitioned over
    pub total_workers: usize,

    /// Number of workers whose gradients entered the reduction
    pub participants: usize,

    /// Reduced loss over the participants, if any succeeded
    pub loss: Option<f32>,

    /// Reduced gradient vector over the participants
    #[serde(skip)]
    pub gradients: Option<Vec<f32>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_partition_round_robin() {
        let workers = names(&["localhost", "gpu1"]);
        let partition = partition_batch(&workers, 10);

        assert_eq!(partition.len(), 2);
        assert_eq!(partition[0].0, "localhost");
        assert_eq!(partition[0].1, vec![0, 2, 4, 6, 8]);
        assert_eq!(partition[1].0, "gpu1");
        assert_eq!(partition[1].1, vec![1, 3, 5, 7, 9]);
    }

    #[test]
    fn test_partition_is_deterministic_and_covers_batch() {
        let workers = names(&["a", "b", "c"]);
        let first = partition_batch(&workers, 11);
        let second = partition_batch(&workers, 11);
        assert_eq!(first, second);

        let assigned: usize = first.iter().map(|(_, indices)| indices.len()).sum();
        assert_eq!(assigned, 11);

        // Every index appears exactly once
        let mut all: Vec<usize> = first.iter().flat_map(|(_, i)| i.clone()).collect();
        all.sort();
        assert_eq!(all, (0..11).collect::<Vec<_>>());
    }

    #[test]
    fn test_partition_fewer_samples_than_workers() {
        let workers = names(&["a", "b", "c"]);
        let partition = partition_batch(&workers, 2);

        assert_eq!(partition.len(), 2);
        assert_eq!(partition[0], ("a".to_string(), vec![0]));
        assert_eq!(partition[1], ("b".to_string(), vec![1]));
    }

    #[test]
    fn test_extract_shard_keeps_sample_layout() {
        // 3 samples of width 2
        let data = [0.0, 0.1, 1.0, 1.1, 2.0, 2.1];
        let shard = extract_shard(&data, &[0, 2], 2);
        assert_eq!(shard, vec![0.0, 0.1, 2.0, 2.1]);
    }

    #[test]
    fn test_reduce_is_sum_then_average() {
        let gradients = vec![vec![1.0, 2.0, 3.0], vec![3.0, 4.0, 5.0]];
        let reduced = reduce_gradients(&gradients).unwrap();

        for (r, expected) in reduced.iter().zip([2.0, 3.0, 4.0]) {
            assert!((r - expected).abs() < 1e-5);
        }
    }

    #[test]
    fn test_reduce_single_worker_is_exact() {
        let gradients = vec![vec![0.25, -1.5, 7.0]];
        // Single participant: average must be bit-identical to the input
        assert_eq!(reduce_gradients(&gradients).unwrap(), gradients[0]);
    }

    #[test]
    fn test_reduce_length_mismatch_is_fatal() {
        let gradients = vec![vec![1.0, 2.0], vec![1.0, 2.0, 3.0]];
        assert!(matches!(
            reduce_gradients(&gradients),
            Err(Error::Reduce {
                expected: 2,
                actual: 3
            })
        ));
    }

    #[test]
    fn test_reduce_empty() {
        assert!(reduce_gradients(&[]).unwrap().is_empty());
        assert_eq!(reduce_losses(&[]), 0.0);
    }

    #[test]
    fn test_reduce_losses() {
        assert!((reduce_losses(&[1.0, 2.0]) - 1.5).abs() < 1e-6);
        assert_eq!(reduce_losses(&[0.75]), 0.75);
    }

    #[test]
    fn test_step_phase_display() {
        assert_eq!(StepPhase::PartitioningBatch.to_string(), "partitioning_batch");
        assert_eq!(StepPhase::Aborted.to_string(), "aborted");
    }
}
