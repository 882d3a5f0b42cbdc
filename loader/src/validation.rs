//! Fabricated input for output-parity checks
//!
//! When requested, the loader runs one forward pass of the unsharded model on
//! a deterministic synthetic batch and ships inputs and logits downstream, so
//! a converter can run the same batch through the converted model and compare.

use crate::checkpoint::ModelMetadata;
use crate::errors::{LoaderError, Result};
use crate::schema::ModelKind;
use crate::tensor::Tensor;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Sequences per synthetic batch
pub const BATCH_SIZE: usize = 4;

/// Token ids are drawn from `[0, VOCAB_SIZE)`
pub const VOCAB_SIZE: usize = 1024;

/// Seed of the synthetic batch generator
pub const SEED: u64 = 0;

/// Token ids, positions and causal mask for one forward pass
#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticBatch {
    /// `[batch, seq]` token ids stored as f32
    pub tokens: Tensor,
    /// `[batch, seq]` positions `0..seq`
    pub position_ids: Tensor,
    /// `[1, 1, seq, seq]`, 1.0 where attention is masked (future positions)
    pub attention_mask: Tensor,
}

impl SyntheticBatch {
    /// Build a batch of `seq_length` tokens from `seed`
    pub fn fabricate(seq_length: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);

        let tokens: Vec<f32> = (0..BATCH_SIZE * seq_length)
            .map(|_| rng.gen_range(0..VOCAB_SIZE) as f32)
            .collect();

        let position_ids: Vec<f32> = (0..BATCH_SIZE)
            .flat_map(|_| (0..seq_length).map(|p| p as f32))
            .collect();

        let mut mask = Tensor::zeros(vec![1, 1, seq_length, seq_length]);
        for i in 0..seq_length {
            for j in (i + 1)..seq_length {
                mask.data[i * seq_length + j] = 1.0;
            }
        }

        Self {
            tokens: Tensor {
                data: tokens,
                shape: vec![BATCH_SIZE, seq_length],
            },
            position_ids: Tensor {
                data: position_ids,
                shape: vec![BATCH_SIZE, seq_length],
            },
            attention_mask: mask,
        }
    }
}

/// Check that a parity batch can be produced for this checkpoint
///
/// The forward pass runs on a single shard, so the checkpoint must be
/// unsharded, and only decoder models are supported.
pub fn check_supported(md: &ModelMetadata) -> Result<()> {
    if md.model_type != ModelKind::Gpt {
        return Err(LoaderError::Config(format!(
            "logits check is only supported for GPT models, got {}",
            md.model_type
        )));
    }
    let sizes = (
        md.previous_tensor_parallel_size,
        md.previous_pipeline_parallel_size,
        md.previous_virtual_pipeline_parallel_size,
    );
    if sizes != (1, 1, 1) {
        return Err(LoaderError::Config(format!(
            "logits check requires tp = pp = vp = 1, got tp={} pp={} vp={}",
            sizes.0, sizes.1, sizes.2
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::metadata::tests::complete_args;
    use crate::config::LoaderConfig;

    #[test]
    fn test_batch_shapes() {
        let batch = SyntheticBatch::fabricate(6, SEED);
        assert_eq!(batch.tokens.shape, vec![BATCH_SIZE, 6]);
        assert_eq!(batch.position_ids.shape, vec![BATCH_SIZE, 6]);
        assert_eq!(batch.attention_mask.shape, vec![1, 1, 6, 6]);
        assert!(batch.tokens.data.iter().all(|&t| t >= 0.0 && t < VOCAB_SIZE as f32));
        assert_eq!(&batch.position_ids.data[6..12], &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_mask_is_causal() {
        let batch = SyntheticBatch::fabricate(3, SEED);
        assert_eq!(
            batch.attention_mask.data,
            vec![0.0, 1.0, 1.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0]
        );
    }

    #[test]
    fn test_fabricate_is_deterministic() {
        assert_eq!(SyntheticBatch::fabricate(8, 7), SyntheticBatch::fabricate(8, 7));
        assert_ne!(
            SyntheticBatch::fabricate(8, 7).tokens,
            SyntheticBatch::fabricate(8, 8).tokens
        );
    }

    #[test]
    fn test_check_supported() {
        let mut args = complete_args();
        args.tensor_model_parallel_size = Some(1);
        let md = ModelMetadata::from_checkpoint(&args, &LoaderConfig::default(), None).unwrap();
        assert!(check_supported(&md).is_ok());

        args.tensor_model_parallel_size = Some(2);
        let md = ModelMetadata::from_checkpoint(&args, &LoaderConfig::default(), None).unwrap();
        assert!(matches!(check_supported(&md), Err(LoaderError::Config(_))));

        let bert = LoaderConfig {
            model_type: ModelKind::Bert,
            ..Default::default()
        };
        args.tensor_model_parallel_size = Some(1);
        let md = ModelMetadata::from_checkpoint(&args, &bert, None).unwrap();
        assert!(check_supported(&md).is_err());
    }
}
