//! Shard providers
//!
//! A shard provider materializes one model shard per rank coordinate. It owns
//! checkpoint I/O and model construction; the loader only looks tensors up by
//! storage path and reads the consumed-sample counters each shard reports.
//!
//! ## Implementations
//!
//! - [`CborShardProvider`]: reads a checkpoint directory of CBOR shard files
//! - [`MockShardProvider`]: fabricates a deterministic reference model and
//!   serves tensor/pipeline/expert-parallel slices of it

pub mod cbor;
pub mod mock;

pub use cbor::{write_checkpoint, CborShardProvider};
pub use mock::{MockModelConfig, MockShardProvider};

use crate::checkpoint::CheckpointArgs;
use crate::errors::{LoaderError, Result};
use crate::tensor::Tensor;
use crate::validation::SyntheticBatch;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Rank coordinate of one materialized shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardCoordinate {
    pub tp_rank: usize,
    pub pp_rank: usize,
    pub vp_rank: usize,
    /// Present only for expert-parallel checkpoints
    pub ep_rank: Option<usize>,
}

impl ShardCoordinate {
    pub fn new(tp_rank: usize, pp_rank: usize, vp_rank: usize, ep_rank: Option<usize>) -> Self {
        Self {
            tp_rank,
            pp_rank,
            vp_rank,
            ep_rank,
        }
    }
}

impl fmt::Display for ShardCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tp={} pp={} vp={}", self.tp_rank, self.pp_rank, self.vp_rank)?;
        if let Some(ep) = self.ep_rank {
            write!(f, " ep={}", ep)?;
        }
        Ok(())
    }
}

/// Training progress counters stored with every shard
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumedSamples {
    pub train: u64,
    pub valid: u64,
}

/// One loaded model shard: tensors keyed by storage path
#[derive(Debug, Clone)]
pub struct ModelShard {
    pub coordinate: ShardCoordinate,
    pub consumed: ConsumedSamples,
    tensors: BTreeMap<String, Tensor>,
}

impl ModelShard {
    pub fn new(
        coordinate: ShardCoordinate,
        consumed: ConsumedSamples,
        tensors: BTreeMap<String, Tensor>,
    ) -> Self {
        Self {
            coordinate,
            consumed,
            tensors,
        }
    }

    /// Look up a tensor by storage path
    pub fn tensor(&self, path: &str) -> Option<&Tensor> {
        self.tensors.get(path)
    }

    /// All storage paths held by this shard, in sorted order
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    /// Number of tensors held
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    /// Check if the shard holds no tensors
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Resident bytes of all tensor buffers
    pub fn memory_usage(&self) -> usize {
        self.tensors.values().map(Tensor::size_bytes).sum()
    }

    /// Consume the shard, returning its tensors
    pub fn into_tensors(self) -> BTreeMap<String, Tensor> {
        self.tensors
    }
}

/// Source of model shards (file-backed or mock)
#[async_trait]
pub trait ShardProvider: Send + Sync {
    /// Checkpoint-time arguments, read once before any shard is loaded
    async fn checkpoint_args(&self) -> Result<CheckpointArgs>;

    /// Materialize the shard at `coordinate`
    ///
    /// Must fail with a distinguishable error when a required checkpoint
    /// field is absent.
    async fn load(&self, coordinate: ShardCoordinate) -> Result<ModelShard>;

    /// Run a forward pass of a fully materialized (unsharded) model on a
    /// fabricated batch, returning the logits
    async fn forward(&self, shard: &ModelShard, _batch: &SyntheticBatch) -> Result<Tensor> {
        Err(LoaderError::Unsupported(format!(
            "provider cannot run a forward pass for shard {}",
            shard.coordinate
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coordinate_display() {
        let dense = ShardCoordinate::new(1, 2, 0, None);
        assert_eq!(dense.to_string(), "tp=1 pp=2 vp=0");
        let moe = ShardCoordinate::new(0, 0, 1, Some(0));
        assert_eq!(moe.to_string(), "tp=0 pp=0 vp=1 ep=0");
    }

    #[test]
    fn test_model_shard_lookup() {
        let mut tensors = BTreeMap::new();
        tensors.insert(
            "embedding.word_embeddings.weight".to_string(),
            Tensor::zeros(vec![8, 4]),
        );
        let shard = ModelShard::new(
            ShardCoordinate::new(0, 0, 0, None),
            ConsumedSamples { train: 10, valid: 2 },
            tensors,
        );

        assert_eq!(shard.len(), 1);
        assert!(!shard.is_empty());
        assert!(shard.tensor("embedding.word_embeddings.weight").is_some());
        assert!(shard.tensor("output_layer.weight").is_none());
        assert_eq!(shard.memory_usage(), 8 * 4 * 4);
        assert_eq!(shard.paths().count(), 1);
    }
}
