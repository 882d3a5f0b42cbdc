//! Checkpoint-time training arguments as reported by a shard provider

use serde::{Deserialize, Serialize};
use std::fmt;

/// Positional encoding scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionEmbeddingType {
    /// Learned absolute position table stored with the embeddings
    #[default]
    LearnedAbsolute,
    /// Rotary embeddings; no position table exists
    Rope,
}

impl fmt::Display for PositionEmbeddingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionEmbeddingType::LearnedAbsolute => write!(f, "learned_absolute"),
            PositionEmbeddingType::Rope => write!(f, "rope"),
        }
    }
}

/// Parameter dtype the model was trained in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamsDtype {
    Float32,
    Float16,
    Bfloat16,
}

/// Arguments stored with the checkpoint
///
/// Every field is optional: older checkpoints omit fields that newer
/// training code writes. Which fields are required and which have defaults
/// is decided when building [`ModelMetadata`](super::ModelMetadata).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointArgs {
    pub tensor_model_parallel_size: Option<usize>,
    pub pipeline_model_parallel_size: Option<usize>,
    pub virtual_pipeline_model_parallel_size: Option<usize>,
    pub expert_model_parallel_size: Option<usize>,
    pub num_experts: Option<usize>,
    pub num_layers: Option<usize>,
    pub hidden_size: Option<usize>,
    pub seq_length: Option<usize>,
    pub num_attention_heads: Option<usize>,
    pub max_position_embeddings: Option<usize>,
    pub position_embedding_type: Option<PositionEmbeddingType>,
    pub tokenizer_type: Option<String>,
    pub iteration: Option<u64>,
    pub bert_binary_head: Option<bool>,
    pub add_bias_linear: Option<bool>,
    pub add_qkv_bias: Option<bool>,
    pub params_dtype: Option<ParamsDtype>,
    pub swiglu: Option<bool>,
    pub xielu: Option<bool>,
    /// "LayerNorm" or "RMSNorm"
    pub normalization: Option<String>,
    pub untie_embeddings_and_output_weights: Option<bool>,
    pub make_vocab_size_divisible_by: Option<usize>,
}
