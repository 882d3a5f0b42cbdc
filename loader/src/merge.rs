//! Merge engine
//!
//! Reduces the per-tensor-parallel-rank copies of one role into the logical
//! tensor, following the rule the role declares:
//!
//! - [`MergeRule::RowParallel`]: concatenate along the output-feature axis (0)
//! - [`MergeRule::ColumnParallel`]: concatenate along the input-feature axis (1)
//! - [`MergeRule::Replicated`]: keep the rank-0 copy
//!
//! Gated projections (`fc1` when the MLP uses a gated activation) are split
//! into gate and value halves per rank before concatenation.

use crate::errors::{LoaderError, Result};
use crate::schema::{LayerRole, MergeRule};
use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// What to do with tensor-parallel copies of replicated parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaPolicy {
    /// Keep rank 0, drop the rest unchecked
    #[default]
    Discard,
    /// Keep rank 0 after checking every other rank holds identical values
    Verify,
}

/// Result of merging one role
#[derive(Debug, Clone, PartialEq)]
pub enum Merged {
    Single(Tensor),
    Gated { gate: Tensor, value: Tensor },
}

/// Concatenate row-parallel shards (and vocabulary tables) along axis 0
///
/// Vocabulary tables keep their padding; trimming to the true vocabulary
/// size is left to the consumer.
pub fn merge_row_parallel<T: AsRef<Tensor>>(shards: &[T]) -> Result<Tensor> {
    Tensor::cat(shards, 0)
}

/// Concatenate column-parallel shards along axis 1
pub fn merge_column_parallel<T: AsRef<Tensor>>(shards: &[T]) -> Result<Tensor> {
    Tensor::cat(shards, 1)
}

/// Keep the rank-0 copy of a replicated parameter
pub fn merge_replicated<T: AsRef<Tensor>>(
    shards: &[T],
    policy: ReplicaPolicy,
    label: &str,
) -> Result<Tensor> {
    let first = shards
        .first()
        .ok_or_else(|| LoaderError::Shape(format!("no shards supplied for '{}'", label)))?
        .as_ref();

    if policy == ReplicaPolicy::Verify {
        for (rank, shard) in shards.iter().enumerate().skip(1) {
            if shard.as_ref() != first {
                warn!(label, rank, "Replicated parameter differs from rank 0");
                return Err(LoaderError::Consistency(format!(
                    "replicated parameter '{}' on tensor-parallel rank {} differs from rank 0",
                    label, rank
                )));
            }
        }
    }

    Ok(first.clone())
}

/// Split every shard into (gate, value) halves along axis 0, then
/// concatenate the gate halves and the value halves separately
pub fn merge_gated<T: AsRef<Tensor>>(shards: &[T]) -> Result<(Tensor, Tensor)> {
    let mut gates = Vec::with_capacity(shards.len());
    let mut values = Vec::with_capacity(shards.len());
    for shard in shards {
        let mut halves = shard.as_ref().chunk(2, 0)?.into_iter();
        if let (Some(gate), Some(value)) = (halves.next(), halves.next()) {
            gates.push(gate);
            values.push(value);
        }
    }
    Ok((Tensor::cat(&gates, 0)?, Tensor::cat(&values, 0)?))
}

/// Merge all tensor-parallel copies of `role`
pub fn merge_role<T: AsRef<Tensor>>(
    role: LayerRole,
    shards: &[T],
    gated: bool,
    policy: ReplicaPolicy,
) -> Result<Merged> {
    if gated && role.is_gated_projection() {
        let (gate, value) = merge_gated(shards)?;
        return Ok(Merged::Gated { gate, value });
    }

    let merged = match role.merge_rule() {
        MergeRule::RowParallel => merge_row_parallel(shards)?,
        MergeRule::ColumnParallel => merge_column_parallel(shards)?,
        MergeRule::Replicated => merge_replicated(shards, policy, &role.key())?,
    };
    Ok(Merged::Single(merged))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arange(shape: Vec<usize>) -> Tensor {
        let len: usize = shape.iter().product();
        Tensor::new((0..len).map(|i| i as f32 * 0.5).collect(), shape).unwrap()
    }

    #[test]
    fn test_row_parallel_round_trip() {
        let full = arange(vec![12, 4]);
        for tp in [1, 2, 3, 4] {
            let shards = full.chunk(tp, 0).unwrap();
            assert_eq!(merge_row_parallel(&shards).unwrap(), full, "tp={}", tp);
        }
    }

    #[test]
    fn test_column_parallel_round_trip() {
        let full = arange(vec![4, 12]);
        let shards = full.chunk(3, 1).unwrap();
        assert_eq!(merge_column_parallel(&shards).unwrap(), full);
    }

    #[test]
    fn test_gated_round_trip() {
        let gate = arange(vec![8, 3]);
        let value = Tensor::new(gate.data.iter().map(|x| -x).collect(), vec![8, 3]).unwrap();

        // Each tensor-parallel rank stores [gate slice; value slice]
        let tp = 2;
        let gate_parts = gate.chunk(tp, 0).unwrap();
        let value_parts = value.chunk(tp, 0).unwrap();
        let shards: Vec<Tensor> = gate_parts
            .iter()
            .zip(&value_parts)
            .map(|(g, v)| Tensor::cat(&[g, v], 0).unwrap())
            .collect();

        let (merged_gate, merged_value) = merge_gated(&shards).unwrap();
        assert_eq!(merged_gate, gate);
        assert_eq!(merged_value, value);
    }

    #[test]
    fn test_gated_bias_round_trip() {
        let gate = arange(vec![6]);
        let value = Tensor::new(vec![9.0; 6], vec![6]).unwrap();
        let shards: Vec<Tensor> = (0..3)
            .map(|r| {
                Tensor::cat(
                    &[gate.narrow(0, r * 2, 2).unwrap(), value.narrow(0, r * 2, 2).unwrap()],
                    0,
                )
                .unwrap()
            })
            .collect();

        match merge_role(LayerRole::MlpFc1Bias, &shards, true, ReplicaPolicy::Discard).unwrap() {
            Merged::Gated { gate: g, value: v } => {
                assert_eq!(g, gate);
                assert_eq!(v, value);
            }
            other => panic!("expected gated merge, got {:?}", other),
        }
    }

    #[test]
    fn test_gated_rejects_odd_rows() {
        let shards = vec![arange(vec![3, 2])];
        assert!(matches!(merge_gated(&shards), Err(LoaderError::Shape(_))));
    }

    #[test]
    fn test_column_parallel_bias_single_copy() {
        let bias = arange(vec![4]);
        for tp in [1, 2, 8] {
            let shards: Vec<&Tensor> = (0..tp).map(|_| &bias).collect();
            let merged =
                merge_role(LayerRole::SelfAttnProjBias, &shards, false, ReplicaPolicy::Discard)
                    .unwrap();
            assert_eq!(merged, Merged::Single(bias.clone()));
        }
    }

    #[test]
    fn test_replica_policy_verify_detects_divergence() {
        let a = arange(vec![4]);
        let mut b = a.clone();
        b.data[2] += 1.0;

        assert_eq!(
            merge_replicated(&[&a, &b], ReplicaPolicy::Discard, "mlp_norm_weight").unwrap(),
            a
        );
        assert!(merge_replicated(&[&a, &a], ReplicaPolicy::Verify, "mlp_norm_weight").is_ok());
        assert!(matches!(
            merge_replicated(&[&a, &b], ReplicaPolicy::Verify, "mlp_norm_weight"),
            Err(LoaderError::Consistency(_))
        ));
    }

    #[test]
    fn test_merge_role_uses_declared_axis() {
        let full = arange(vec![4, 6]);
        let by_cols = full.chunk(2, 1).unwrap();
        let merged =
            merge_role(LayerRole::MlpFc2Weight, &by_cols, true, ReplicaPolicy::Discard).unwrap();
        assert_eq!(merged, Merged::Single(full.clone()));

        let by_rows = full.chunk(2, 0).unwrap();
        let merged =
            merge_role(LayerRole::SelfAttnQkvWeight, &by_rows, false, ReplicaPolicy::Discard)
                .unwrap();
        assert_eq!(merged, Merged::Single(full));
    }
}
