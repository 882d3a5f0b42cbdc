//! Model metadata sent ahead of the tensor stream

use crate::config::LoaderConfig;
use crate::errors::{LoaderError, Result};
use crate::provider::ConsumedSamples;
use crate::schema::ModelKind;
use serde::{Deserialize, Serialize};
use tracing::error;

use super::args::{CheckpointArgs, ParamsDtype, PositionEmbeddingType};

/// Scalar description of the model and the layout it was saved with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub model_type: ModelKind,
    pub num_layers: usize,
    pub hidden_size: usize,
    pub seq_length: usize,
    pub num_attention_heads: usize,
    pub max_position_embeddings: usize,
    pub position_embedding_type: PositionEmbeddingType,
    pub tokenizer_type: String,
    pub iteration: u64,
    pub params_dtype: ParamsDtype,
    pub bert_binary_head: bool,
    /// Embeddings and output projection are untied
    pub output_layer: bool,
    pub linear_bias: bool,
    pub qkv_bias: bool,
    pub norm_has_bias: bool,
    pub swiglu: bool,
    pub xielu: bool,
    pub num_experts: usize,
    pub previous_tensor_parallel_size: usize,
    pub previous_pipeline_parallel_size: usize,
    pub previous_virtual_pipeline_parallel_size: usize,
    pub previous_expert_parallel_size: usize,
    /// Unpadded vocabulary size; the emitted tables keep their padding
    pub true_vocab_size: Option<usize>,
    pub make_vocab_size_divisible_by: usize,
    pub consumed_train_samples: u64,
    pub consumed_valid_samples: u64,
    pub checkpoint_args: CheckpointArgs,
}

fn required<T: Clone>(value: &Option<T>, name: &str) -> Result<T> {
    value.clone().ok_or_else(|| {
        error!(argument = name, "Checkpoint does not specify a required argument");
        LoaderError::Config(format!(
            "checkpoint does not specify the argument {}",
            name
        ))
    })
}

impl ModelMetadata {
    /// Build metadata from checkpoint arguments and the run configuration
    ///
    /// Consumed-sample counters start at zero and are filled in once the
    /// first pipeline stage has been loaded.
    pub fn from_checkpoint(
        args: &CheckpointArgs,
        config: &LoaderConfig,
        true_vocab_size: Option<usize>,
    ) -> Result<Self> {
        let previous_tensor_parallel_size =
            required(&args.tensor_model_parallel_size, "tensor_model_parallel_size")?;
        let previous_pipeline_parallel_size =
            required(&args.pipeline_model_parallel_size, "pipeline_model_parallel_size")?;
        let num_layers = required(&args.num_layers, "num_layers")?;
        let hidden_size = required(&args.hidden_size, "hidden_size")?;
        let seq_length = required(&args.seq_length, "seq_length")?;
        let num_attention_heads = required(&args.num_attention_heads, "num_attention_heads")?;
        let max_position_embeddings =
            required(&args.max_position_embeddings, "max_position_embeddings")?;
        let position_embedding_type = required(
            &args
                .position_embedding_type
                .or(Some(config.position_embedding_type)),
            "position_embedding_type",
        )?;
        let tokenizer_type = required(&args.tokenizer_type, "tokenizer_type")?;
        let iteration = required(&args.iteration, "iteration")?;
        let bert_binary_head = required(&args.bert_binary_head, "bert_binary_head")?;
        let params_dtype = required(&args.params_dtype, "params_dtype")?;

        // LayerNorm has a bias; RMSNorm does not. Older checkpoints only
        // supported LayerNorm.
        let norm_has_bias = args
            .normalization
            .as_deref()
            .map(|n| n == "LayerNorm")
            .unwrap_or(true);

        Ok(Self {
            model_type: config.model_type,
            num_layers,
            hidden_size,
            seq_length,
            num_attention_heads,
            max_position_embeddings,
            position_embedding_type,
            tokenizer_type,
            iteration,
            params_dtype,
            bert_binary_head,
            output_layer: args.untie_embeddings_and_output_weights.unwrap_or(false),
            linear_bias: args.add_bias_linear.unwrap_or(true),
            qkv_bias: args.add_qkv_bias.unwrap_or(false),
            norm_has_bias,
            swiglu: args.swiglu.unwrap_or(false),
            xielu: args.xielu.unwrap_or(false),
            num_experts: args.num_experts.unwrap_or(0),
            previous_tensor_parallel_size,
            previous_pipeline_parallel_size,
            previous_virtual_pipeline_parallel_size: args
                .virtual_pipeline_model_parallel_size
                .unwrap_or(1),
            previous_expert_parallel_size: args.expert_model_parallel_size.unwrap_or(1),
            true_vocab_size,
            make_vocab_size_divisible_by: args.make_vocab_size_divisible_by.unwrap_or(128),
            consumed_train_samples: 0,
            consumed_valid_samples: 0,
            checkpoint_args: args.clone(),
        })
    }

    /// Record the authoritative consumed-sample counters
    pub fn set_consumed(&mut self, consumed: ConsumedSamples) {
        self.consumed_train_samples = consumed.train;
        self.consumed_valid_samples = consumed.valid;
    }
}
