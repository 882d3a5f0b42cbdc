//! Schema registry
//!
//! Maps logical parameter roles to storage paths inside a single-rank model
//! object. One [`Schema`] is resolved per run from the checkpoint's
//! architecture flags and never changes afterwards.
//!
//! ## Variants
//!
//! ```text
//!                    ┌───────────────┬───────────────────────────────┐
//!                    │ GPT (decoder) │ BERT (encoder)                │
//! ┌──────────────────┼───────────────┼───────────────────────────────┤
//! │ dense, local     │ decoder.layers│ encoder.layers                │
//! │ dense, te        │ decoder.layers│ encoder.layers                │
//! │ moe, te          │ decoder.layers│ encoder.layers (+ experts)    │
//! └──────────────────┴───────────────┴───────────────────────────────┘
//! ```
//!
//! Expert roles are generated once per local expert index when the schema
//! is built.

pub mod roles;
pub mod variant;

pub use roles::{LayerRole, MergeRule, Section};
pub use variant::{ArchitectureVariant, LayerLayout, ModelKind, TransformerImpl};

use crate::errors::{LoaderError, Result};
use crate::provider::{ModelShard, ShardCoordinate};
use crate::tensor::Tensor;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;

/// Tensors of one schema section or layer, resolved against one shard
///
/// Every declared key is present; its tensor is `None` when the shard does
/// not hold the storage path.
#[derive(Debug)]
pub struct TensorLookup<'a, K> {
    coordinate: ShardCoordinate,
    entries: BTreeMap<K, (String, Option<&'a Tensor>)>,
}

/// Lookup result for a non-layer section
pub type SectionTensors<'a> = TensorLookup<'a, &'static str>;

/// Lookup result for one transformer layer
pub type LayerTensors<'a> = TensorLookup<'a, LayerRole>;

impl<'a, K: Ord + Copy + Display> TensorLookup<'a, K> {
    /// Tensor for `key`, if declared and present
    pub fn get(&self, key: K) -> Option<&'a Tensor> {
        self.entries.get(&key).and_then(|(_, tensor)| *tensor)
    }

    /// Tensor for `key`; absence is a fault
    pub fn require(&self, key: K) -> Result<&'a Tensor> {
        match self.entries.get(&key) {
            Some((_, Some(tensor))) => Ok(*tensor),
            Some((path, None)) => Err(LoaderError::MissingTensor {
                path: path.clone(),
                coordinate: self.coordinate.to_string(),
            }),
            None => Err(LoaderError::Config(format!(
                "role '{}' is not declared by the resolved schema",
                key
            ))),
        }
    }

    /// Storage path declared for `key`
    pub fn path(&self, key: K) -> Option<&str> {
        self.entries.get(&key).map(|(path, _)| path.as_str())
    }

    /// Declared keys, in order
    pub fn keys(&self) -> impl Iterator<Item = K> + '_ {
        self.entries.keys().copied()
    }
}

/// Immutable role → storage path table for one architecture variant
#[derive(Debug, Clone)]
pub struct Schema {
    variant: ArchitectureVariant,
    layer_prefix: String,
    layer: Vec<(LayerRole, String)>,
    sections: BTreeMap<Section, Vec<(&'static str, String)>>,
}

/// Resolve the schema for a checkpoint
///
/// Mixture-of-experts checkpoints (`num_experts > 0`) are only readable with
/// the fused-kernel implementation.
pub fn resolve(
    kind: ModelKind,
    transformer_impl: TransformerImpl,
    num_experts: usize,
    expert_parallel_size: usize,
) -> Result<Schema> {
    let layout = if num_experts > 0 {
        if transformer_impl != TransformerImpl::TransformerEngine {
            return Err(LoaderError::Consistency(format!(
                "mixture-of-experts checkpoints ({} experts) require the transformer_engine \
                 implementation, got {}",
                num_experts, transformer_impl
            )));
        }
        if expert_parallel_size == 0 || num_experts % expert_parallel_size != 0 {
            return Err(LoaderError::Config(format!(
                "num_experts {} is not divisible by expert_model_parallel_size {}",
                num_experts, expert_parallel_size
            )));
        }
        LayerLayout::MoeFused {
            num_local_experts: num_experts / expert_parallel_size,
        }
    } else {
        match transformer_impl {
            TransformerImpl::Local => LayerLayout::DenseReference,
            TransformerImpl::TransformerEngine => LayerLayout::DenseFused,
        }
    };

    Ok(Schema::new(ArchitectureVariant { kind, layout }))
}

/// Attention and norm roles shared by every layout, except the input norm
fn attention_roles() -> Vec<(LayerRole, &'static str)> {
    vec![
        (LayerRole::SelfAttnQkvWeight, "self_attention.linear_qkv.weight"),
        (LayerRole::SelfAttnQkvBias, "self_attention.linear_qkv.bias"),
        (LayerRole::SelfAttnProjWeight, "self_attention.linear_proj.weight"),
        (LayerRole::SelfAttnProjBias, "self_attention.linear_proj.bias"),
        (LayerRole::SelfAttnQLayernormWeight, "self_attention.q_layernorm.weight"),
        (LayerRole::SelfAttnQLayernormBias, "self_attention.q_layernorm.bias"),
        (LayerRole::SelfAttnKLayernormWeight, "self_attention.k_layernorm.weight"),
        (LayerRole::SelfAttnKLayernormBias, "self_attention.k_layernorm.bias"),
        (LayerRole::MlpNormWeight, "pre_mlp_layernorm.weight"),
        (LayerRole::MlpNormBias, "pre_mlp_layernorm.bias"),
    ]
}

fn dense_layer_table() -> Vec<(LayerRole, String)> {
    let mut table = vec![
        (LayerRole::SelfAttnNormWeight, "input_layernorm.weight"),
        (LayerRole::SelfAttnNormBias, "input_layernorm.bias"),
    ];
    table.extend(attention_roles());
    table.extend([
        (LayerRole::MlpFc1Weight, "mlp.linear_fc1.weight"),
        (LayerRole::MlpFc1Bias, "mlp.linear_fc1.bias"),
        (LayerRole::MlpFc2Weight, "mlp.linear_fc2.weight"),
        (LayerRole::MlpFc2Bias, "mlp.linear_fc2.bias"),
        (LayerRole::MlpXieluAlphaP, "mlp.activation_func.alpha_p"),
        (LayerRole::MlpXieluAlphaN, "mlp.activation_func.alpha_n"),
    ]);
    table
        .into_iter()
        .map(|(role, path)| (role, path.to_string()))
        .collect()
}

fn moe_layer_table(num_local_experts: usize) -> Vec<(LayerRole, String)> {
    // The fused qkv module carries the input norm.
    let mut table: Vec<(LayerRole, String)> = vec![
        (
            LayerRole::SelfAttnNormWeight,
            "self_attention.linear_qkv.layer_norm_weight".to_string(),
        ),
        (
            LayerRole::SelfAttnNormBias,
            "self_attention.linear_qkv.layer_norm_bias".to_string(),
        ),
    ];
    table.extend(
        attention_roles()
            .into_iter()
            .map(|(role, path)| (role, path.to_string())),
    );
    table.push((LayerRole::RouterWeight, "mlp.router.weight".to_string()));

    for i in 0..num_local_experts {
        let expert = format!("mlp.experts.local_experts.{}", i);
        table.push((LayerRole::ExpertFc1Weight(i), format!("{}.linear_fc1.weight", expert)));
        table.push((LayerRole::ExpertFc2Weight(i), format!("{}.linear_fc2.weight", expert)));
        table.push((
            LayerRole::ExpertXieluAlphaP(i),
            format!("{}.activation_func.alpha_p.weight", expert),
        ));
        table.push((
            LayerRole::ExpertXieluAlphaN(i),
            format!("{}.activation_func.alpha_n.weight", expert),
        ));
    }
    table
}

fn section_table(block_key: &str) -> BTreeMap<Section, Vec<(&'static str, String)>> {
    let mut sections = BTreeMap::new();
    sections.insert(
        Section::Embeddings,
        vec![
            ("pos", "embedding.position_embeddings.weight".to_string()),
            ("word", "embedding.word_embeddings.weight".to_string()),
        ],
    );
    sections.insert(
        Section::FinalNorm,
        vec![
            ("weight", format!("{}.final_layernorm.weight", block_key)),
            ("bias", format!("{}.final_layernorm.bias", block_key)),
        ],
    );
    sections.insert(
        Section::OutputLayer,
        vec![("weight", "output_layer.weight".to_string())],
    );
    sections.insert(
        Section::Pooler,
        vec![
            ("weight", "pooler.dense.weight".to_string()),
            ("bias", "pooler.dense.bias".to_string()),
        ],
    );
    sections.insert(
        Section::LmHead,
        vec![
            ("dense_weight", "lm_head.dense.weight".to_string()),
            ("dense_bias", "lm_head.dense.bias".to_string()),
            ("norm_weight", "lm_head.layer_norm.weight".to_string()),
            ("norm_bias", "lm_head.layer_norm.bias".to_string()),
        ],
    );
    sections.insert(
        Section::BinaryHead,
        vec![
            ("weight", "binary_head.weight".to_string()),
            ("bias", "binary_head.bias".to_string()),
        ],
    );
    sections
}

impl Schema {
    /// Build the tables for a variant
    pub fn new(variant: ArchitectureVariant) -> Self {
        let block_key = variant.kind.block_key();
        let layer = match variant.layout {
            LayerLayout::DenseReference | LayerLayout::DenseFused => dense_layer_table(),
            LayerLayout::MoeFused { num_local_experts } => moe_layer_table(num_local_experts),
        };

        Self {
            variant,
            layer_prefix: format!("{}.layers", block_key),
            layer,
            sections: section_table(block_key),
        }
    }

    pub fn variant(&self) -> ArchitectureVariant {
        self.variant
    }

    /// Prefix under which layer `i` lives as `{prefix}.{i}.`
    pub fn layer_prefix(&self) -> &str {
        &self.layer_prefix
    }

    /// Declared layer roles, in table order
    pub fn layer_roles(&self) -> impl Iterator<Item = LayerRole> + '_ {
        self.layer.iter().map(|(role, _)| *role)
    }

    /// Storage path of `role` in local layer `layer_index`
    pub fn layer_path(&self, layer_index: usize, role: LayerRole) -> Option<String> {
        self.layer
            .iter()
            .find(|(r, _)| *r == role)
            .map(|(_, suffix)| format!("{}.{}.{}", self.layer_prefix, layer_index, suffix))
    }

    /// Storage paths declared for a non-layer section
    pub fn section_paths(&self, section: Section) -> &[(&'static str, String)] {
        self.sections
            .get(&section)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Resolve a non-layer section against a shard
    pub fn get<'a>(&self, section: Section, shard: &'a ModelShard) -> SectionTensors<'a> {
        let entries = self
            .section_paths(section)
            .iter()
            .map(|(field, path)| (*field, (path.clone(), shard.tensor(path))))
            .collect();
        TensorLookup {
            coordinate: shard.coordinate,
            entries,
        }
    }

    /// Resolve local layer `layer_index` against a shard
    pub fn get_layer<'a>(&self, shard: &'a ModelShard, layer_index: usize) -> LayerTensors<'a> {
        let entries = self
            .layer
            .iter()
            .map(|(role, suffix)| {
                let path = format!("{}.{}.{}", self.layer_prefix, layer_index, suffix);
                let tensor = shard.tensor(&path);
                (*role, (path, tensor))
            })
            .collect();
        TensorLookup {
            coordinate: shard.coordinate,
            entries,
        }
    }

    /// Number of transformer layers held by a shard
    pub fn get_num_layers(&self, shard: &ModelShard) -> usize {
        let prefix = format!("{}.", self.layer_prefix);
        shard
            .paths()
            .filter_map(|path| path.strip_prefix(&prefix))
            .filter_map(|rest| rest.split('.').next())
            .filter_map(|index| index.parse::<usize>().ok())
            .collect::<BTreeSet<_>>()
            .len()
    }
}
