//! # Mock Shard Provider
//!
//! Fabricates a deterministic, unsharded reference model and serves the
//! slice each rank coordinate would hold in a real checkpoint. Used to
//! exercise the loader across tensor, pipeline, virtual-pipeline and expert
//! parallel layouts without checkpoint files, and by `ckpt-loader fabricate`
//! to write such files.
//!
//! ## Slicing
//!
//! | Parameter | Held by | Split |
//! |-----------|---------|-------|
//! | word embeddings, output layer | first / last stage | rows (vocab) |
//! | qkv, fc1 (+ biases) | owning stage | rows |
//! | fc1 with a gated activation | owning stage | rows of gate and value separately |
//! | proj, fc2 weights | owning stage | columns |
//! | norms, proj/fc2 biases, router, heads | owning stage | replicated |
//!
//! Weights use Xavier-uniform initialization from a seeded generator, so two
//! providers built with the same config and seed serve identical tensors.

use crate::checkpoint::{CheckpointArgs, ParamsDtype, PositionEmbeddingType};
use crate::errors::{LoaderError, Result};
use crate::schema::{ModelKind, TransformerImpl};
use crate::tensor::Tensor;
use crate::validation::SyntheticBatch;
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use super::{ConsumedSamples, ModelShard, ShardCoordinate, ShardProvider};

/// Shape and layout of the fabricated model
#[derive(Debug, Clone)]
pub struct MockModelConfig {
    pub model_type: ModelKind,
    pub transformer_impl: TransformerImpl,
    pub num_layers: usize,
    pub hidden_size: usize,
    pub ffn_hidden_size: usize,
    pub num_attention_heads: usize,
    pub seq_length: usize,
    /// Vocabulary rows including padding
    pub padded_vocab_size: usize,
    pub tensor_parallel_size: usize,
    pub pipeline_parallel_size: usize,
    pub virtual_pipeline_parallel_size: Option<usize>,
    pub expert_parallel_size: usize,
    pub num_experts: usize,
    pub position_embedding_type: PositionEmbeddingType,
    /// "LayerNorm" (with bias) or "RMSNorm"
    pub normalization: String,
    pub add_bias_linear: bool,
    pub add_qkv_bias: bool,
    pub swiglu: bool,
    pub xielu: bool,
    pub qk_layernorm: bool,
    pub untie_embeddings_and_output_weights: bool,
    pub bert_binary_head: bool,
    pub iteration: u64,
    pub consumed: ConsumedSamples,
}

impl Default for MockModelConfig {
    fn default() -> Self {
        Self {
            model_type: ModelKind::Gpt,
            transformer_impl: TransformerImpl::TransformerEngine,
            num_layers: 4,
            hidden_size: 8,
            ffn_hidden_size: 16,
            num_attention_heads: 2,
            seq_length: 16,
            padded_vocab_size: 32,
            tensor_parallel_size: 1,
            pipeline_parallel_size: 1,
            virtual_pipeline_parallel_size: None,
            expert_parallel_size: 1,
            num_experts: 0,
            position_embedding_type: PositionEmbeddingType::LearnedAbsolute,
            normalization: "LayerNorm".to_string(),
            add_bias_linear: true,
            add_qkv_bias: false,
            swiglu: false,
            xielu: false,
            qk_layernorm: false,
            untie_embeddings_and_output_weights: false,
            bert_binary_head: false,
            iteration: 100,
            consumed: ConsumedSamples {
                train: 1024,
                valid: 64,
            },
        }
    }
}

impl MockModelConfig {
    fn vp_size(&self) -> usize {
        self.virtual_pipeline_parallel_size.unwrap_or(1)
    }

    fn norm_has_bias(&self) -> bool {
        self.normalization == "LayerNorm"
    }

    fn num_local_experts(&self) -> usize {
        if self.num_experts == 0 {
            0
        } else {
            self.num_experts / self.expert_parallel_size
        }
    }

    fn validate(&self) -> Result<()> {
        let tp = self.tensor_parallel_size;
        let stages = self.pipeline_parallel_size * self.vp_size();
        if tp == 0 || stages == 0 || self.expert_parallel_size == 0 {
            return Err(LoaderError::Config("parallel sizes must be positive".to_string()));
        }
        for (name, size) in [
            ("hidden_size", self.hidden_size),
            ("ffn_hidden_size", self.ffn_hidden_size),
            ("padded_vocab_size", self.padded_vocab_size),
        ] {
            if size == 0 || size % tp != 0 {
                return Err(LoaderError::Config(format!(
                    "{} {} is not divisible by tensor_parallel_size {}",
                    name, size, tp
                )));
            }
        }
        if self.num_attention_heads == 0 || self.hidden_size % self.num_attention_heads != 0 {
            return Err(LoaderError::Config(format!(
                "hidden_size {} is not divisible by num_attention_heads {}",
                self.hidden_size, self.num_attention_heads
            )));
        }
        if self.num_layers == 0 || self.num_layers % stages != 0 {
            return Err(LoaderError::Config(format!(
                "num_layers {} cannot be split over {} stages",
                self.num_layers, stages
            )));
        }
        if self.num_experts % self.expert_parallel_size != 0 {
            return Err(LoaderError::Config(format!(
                "num_experts {} is not divisible by expert_parallel_size {}",
                self.num_experts, self.expert_parallel_size
            )));
        }
        if self.num_experts > 0 && self.transformer_impl != TransformerImpl::TransformerEngine {
            return Err(LoaderError::Config(
                "expert layers are only fabricated with transformer_engine".to_string(),
            ));
        }
        Ok(())
    }

    /// Checkpoint arguments a training run with this layout would have saved
    pub fn checkpoint_args(&self) -> CheckpointArgs {
        let tokenizer = match self.model_type {
            ModelKind::Gpt => "GPT2BPETokenizer",
            ModelKind::Bert => "BertWordPieceLowerCase",
        };
        CheckpointArgs {
            tensor_model_parallel_size: Some(self.tensor_parallel_size),
            pipeline_model_parallel_size: Some(self.pipeline_parallel_size),
            virtual_pipeline_model_parallel_size: self.virtual_pipeline_parallel_size,
            expert_model_parallel_size: Some(self.expert_parallel_size),
            num_experts: Some(self.num_experts),
            num_layers: Some(self.num_layers),
            hidden_size: Some(self.hidden_size),
            seq_length: Some(self.seq_length),
            num_attention_heads: Some(self.num_attention_heads),
            max_position_embeddings: Some(self.seq_length),
            position_embedding_type: Some(self.position_embedding_type),
            tokenizer_type: Some(tokenizer.to_string()),
            iteration: Some(self.iteration),
            bert_binary_head: Some(self.bert_binary_head),
            add_bias_linear: Some(self.add_bias_linear),
            add_qkv_bias: Some(self.add_qkv_bias),
            params_dtype: Some(ParamsDtype::Float32),
            swiglu: Some(self.swiglu),
            xielu: Some(self.xielu),
            normalization: Some(self.normalization.clone()),
            untie_embeddings_and_output_weights: Some(self.untie_embeddings_and_output_weights),
            make_vocab_size_divisible_by: None,
        }
    }
}

/// How a reference tensor is divided over tensor-parallel ranks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Split {
    Rows,
    Cols,
    /// `[gate; value]` halves split by rows independently
    GatedRows,
    Replicated,
}

/// Which shards hold a reference tensor
#[derive(Debug, Clone)]
enum Placement {
    FirstStage,
    LastStage,
    Layer { layer: usize, suffix: String },
    Expert { layer: usize, expert: usize, suffix: String },
}

#[derive(Debug, Clone)]
struct Param {
    placement: Placement,
    split: Split,
    tensor: Tensor,
}

/// Xavier-uniform tensor; 1-D tensors use their length for both fans
fn xavier(rng: &mut StdRng, shape: Vec<usize>) -> Tensor {
    let fan_out = shape[0];
    let fan_in = *shape.last().unwrap_or(&fan_out);
    let limit = (6.0 / (fan_in + fan_out) as f32).sqrt();
    let len: usize = shape.iter().product();
    let data = (0..len).map(|_| rng.gen_range(-limit..limit)).collect();
    Tensor { data, shape }
}

/// Builds the reference parameter table in a fixed order
struct ReferenceBuilder {
    rng: StdRng,
    layer_prefix: String,
    params: BTreeMap<String, Param>,
}

impl ReferenceBuilder {
    fn add(&mut self, path: String, placement: Placement, split: Split, shape: Vec<usize>) {
        let tensor = xavier(&mut self.rng, shape);
        self.params.insert(
            path,
            Param {
                placement,
                split,
                tensor,
            },
        );
    }

    fn layer(&mut self, layer: usize, suffix: &str, split: Split, shape: Vec<usize>) {
        let path = format!("{}.{}.{}", self.layer_prefix, layer, suffix);
        let placement = Placement::Layer {
            layer,
            suffix: suffix.to_string(),
        };
        self.add(path, placement, split, shape);
    }

    fn expert(
        &mut self,
        layer: usize,
        expert: usize,
        suffix: &str,
        split: Split,
        shape: Vec<usize>,
    ) {
        let path = format!(
            "{}.{}.mlp.experts.local_experts.{}.{}",
            self.layer_prefix, layer, expert, suffix
        );
        let placement = Placement::Expert {
            layer,
            expert,
            suffix: suffix.to_string(),
        };
        self.add(path, placement, split, shape);
    }
}

fn build_reference(config: &MockModelConfig, seed: u64) -> BTreeMap<String, Param> {
    let h = config.hidden_size;
    let f = config.ffn_hidden_size;
    let v = config.padded_vocab_size;
    let head_dim = h / config.num_attention_heads;
    let fc1_rows = if config.swiglu { 2 * f } else { f };
    let fc1_split = if config.swiglu { Split::GatedRows } else { Split::Rows };
    let norm_bias = config.norm_has_bias();
    let moe = config.num_experts > 0;
    let block = config.model_type.block_key();

    let mut b = ReferenceBuilder {
        rng: StdRng::seed_from_u64(seed),
        layer_prefix: format!("{}.layers", block),
        params: BTreeMap::new(),
    };

    b.add(
        "embedding.word_embeddings.weight".to_string(),
        Placement::FirstStage,
        Split::Rows,
        vec![v, h],
    );
    if config.position_embedding_type == PositionEmbeddingType::LearnedAbsolute {
        b.add(
            "embedding.position_embeddings.weight".to_string(),
            Placement::FirstStage,
            Split::Replicated,
            vec![config.seq_length, h],
        );
    }

    let input_norm = if moe {
        "self_attention.linear_qkv.layer_norm_"
    } else {
        "input_layernorm."
    };

    for layer in 0..config.num_layers {
        b.layer(
            layer,
            &format!("{}weight", input_norm),
            Split::Replicated,
            vec![h],
        );
        if norm_bias {
            b.layer(
                layer,
                &format!("{}bias", input_norm),
                Split::Replicated,
                vec![h],
            );
        }
        b.layer(
            layer,
            "self_attention.linear_qkv.weight",
            Split::Rows,
            vec![3 * h, h],
        );
        if config.add_qkv_bias {
            b.layer(
                layer,
                "self_attention.linear_qkv.bias",
                Split::Rows,
                vec![3 * h],
            );
        }
        b.layer(
            layer,
            "self_attention.linear_proj.weight",
            Split::Cols,
            vec![h, h],
        );
        if config.add_bias_linear {
            b.layer(
                layer,
                "self_attention.linear_proj.bias",
                Split::Replicated,
                vec![h],
            );
        }
        if config.qk_layernorm {
            for which in ["q", "k"] {
                let norm = format!("self_attention.{}_layernorm", which);
                b.layer(
                    layer,
                    &format!("{}.weight", norm),
                    Split::Replicated,
                    vec![head_dim],
                );
                if norm_bias {
                    b.layer(
                        layer,
                        &format!("{}.bias", norm),
                        Split::Replicated,
                        vec![head_dim],
                    );
                }
            }
        }
        b.layer(
            layer,
            "pre_mlp_layernorm.weight",
            Split::Replicated,
            vec![h],
        );
        if norm_bias {
            b.layer(layer, "pre_mlp_layernorm.bias", Split::Replicated, vec![h]);
        }

        if moe {
            b.layer(
                layer,
                "mlp.router.weight",
                Split::Replicated,
                vec![config.num_experts, h],
            );
            for expert in 0..config.num_experts {
                b.expert(
                    layer,
                    expert,
                    "linear_fc1.weight",
                    fc1_split,
                    vec![fc1_rows, h],
                );
                b.expert(layer, expert, "linear_fc2.weight", Split::Cols, vec![h, f]);
                if config.xielu {
                    b.expert(
                        layer,
                        expert,
                        "activation_func.alpha_p.weight",
                        Split::Replicated,
                        vec![1],
                    );
                    b.expert(
                        layer,
                        expert,
                        "activation_func.alpha_n.weight",
                        Split::Replicated,
                        vec![1],
                    );
                }
            }
        } else {
            b.layer(layer, "mlp.linear_fc1.weight", fc1_split, vec![fc1_rows, h]);
            if config.add_bias_linear {
                b.layer(layer, "mlp.linear_fc1.bias", fc1_split, vec![fc1_rows]);
            }
            b.layer(layer, "mlp.linear_fc2.weight", Split::Cols, vec![h, f]);
            if config.add_bias_linear {
                b.layer(layer, "mlp.linear_fc2.bias", Split::Replicated, vec![h]);
            }
            if config.xielu {
                b.layer(
                    layer,
                    "mlp.activation_func.alpha_p",
                    Split::Replicated,
                    vec![1],
                );
                b.layer(
                    layer,
                    "mlp.activation_func.alpha_n",
                    Split::Replicated,
                    vec![1],
                );
            }
        }
    }

    let last = |b: &mut ReferenceBuilder, path: &str, split: Split, shape: Vec<usize>| {
        b.add(path.to_string(), Placement::LastStage, split, shape)
    };
    last(
        &mut b,
        &format!("{}.final_layernorm.weight", block),
        Split::Replicated,
        vec![h],
    );
    if norm_bias {
        last(
            &mut b,
            &format!("{}.final_layernorm.bias", block),
            Split::Replicated,
            vec![h],
        );
    }
    if config.untie_embeddings_and_output_weights {
        last(&mut b, "output_layer.weight", Split::Rows, vec![v, h]);
    }
    if config.model_type == ModelKind::Bert {
        last(&mut b, "pooler.dense.weight", Split::Replicated, vec![h, h]);
        last(&mut b, "pooler.dense.bias", Split::Replicated, vec![h]);
        last(
            &mut b,
            "lm_head.dense.weight",
            Split::Replicated,
            vec![h, h],
        );
        last(&mut b, "lm_head.dense.bias", Split::Replicated, vec![h]);
        last(
            &mut b,
            "lm_head.layer_norm.weight",
            Split::Replicated,
            vec![h],
        );
        last(
            &mut b,
            "lm_head.layer_norm.bias",
            Split::Replicated,
            vec![h],
        );
        if config.bert_binary_head {
            last(&mut b, "binary_head.weight", Split::Replicated, vec![2, h]);
            last(&mut b, "binary_head.bias", Split::Replicated, vec![2]);
        }
    }

    b.params
}

/// Mock provider serving slices of a fabricated reference model
pub struct MockShardProvider {
    config: MockModelConfig,
    reference: BTreeMap<String, Param>,
    consumed_overrides: HashMap<ShardCoordinate, ConsumedSamples>,
    tensor_overrides: BTreeMap<(ShardCoordinate, String), Tensor>,
    removed: BTreeSet<(ShardCoordinate, String)>,
    load_log: Arc<RwLock<Vec<ShardCoordinate>>>,
}

impl MockShardProvider {
    /// Fabricate the reference model for `config` from `seed`
    pub fn new(config: MockModelConfig, seed: u64) -> Result<Self> {
        config.validate()?;
        let reference = build_reference(&config, seed);
        debug!(
            tensors = reference.len(),
            layers = config.num_layers,
            seed,
            "Fabricated mock reference model"
        );
        Ok(Self {
            config,
            reference,
            consumed_overrides: HashMap::new(),
            tensor_overrides: BTreeMap::new(),
            removed: BTreeSet::new(),
            load_log: Arc::new(RwLock::new(Vec::new())),
        })
    }

    /// Report different consumed-sample counters from one shard
    pub fn with_consumed(mut self, coordinate: ShardCoordinate, consumed: ConsumedSamples) -> Self {
        self.consumed_overrides.insert(coordinate, consumed);
        self
    }

    /// Replace (or add) the tensor at `path` in one shard
    pub fn with_tensor(mut self, coordinate: ShardCoordinate, path: &str, tensor: Tensor) -> Self {
        self.tensor_overrides
            .insert((coordinate, path.to_string()), tensor);
        self
    }

    /// Drop the tensor at `path` from one shard
    pub fn without_tensor(mut self, coordinate: ShardCoordinate, path: &str) -> Self {
        self.removed.insert((coordinate, path.to_string()));
        self
    }

    pub fn config(&self) -> &MockModelConfig {
        &self.config
    }

    /// Unsharded reference tensor by logical path (global layer and expert
    /// indices), e.g. `decoder.layers.5.self_attention.linear_qkv.weight`
    pub fn reference(&self, path: &str) -> Option<&Tensor> {
        self.reference.get(path).map(|p| &p.tensor)
    }

    /// Every coordinate a checkpoint of this layout contains
    pub fn coordinates(&self) -> Vec<ShardCoordinate> {
        let ep_ranks: Vec<Option<usize>> = if self.config.num_experts > 0 {
            (0..self.config.expert_parallel_size).map(Some).collect()
        } else {
            vec![None]
        };
        let mut coordinates = Vec::new();
        for tp in 0..self.config.tensor_parallel_size {
            for pp in 0..self.config.pipeline_parallel_size {
                for &ep in &ep_ranks {
                    for vp in 0..self.config.vp_size() {
                        coordinates.push(ShardCoordinate::new(tp, pp, vp, ep));
                    }
                }
            }
        }
        coordinates
    }

    /// Coordinates served so far, in request order
    pub async fn load_log(&self) -> Vec<ShardCoordinate> {
        self.load_log.read().await.clone()
    }

    /// (vp, pp, local index) of a global layer
    fn locate_layer(&self, layer: usize) -> (usize, usize, usize) {
        let pp_size = self.config.pipeline_parallel_size;
        let per_stage = self.config.num_layers / (pp_size * self.config.vp_size());
        let chunk = layer / per_stage;
        (chunk / pp_size, chunk % pp_size, layer % per_stage)
    }

    /// Storage path of `param` inside the shard at `coordinate`, if held there
    fn shard_path(&self, path: &str, param: &Param, c: &ShardCoordinate) -> Option<String> {
        let is_first = c.pp_rank == 0 && c.vp_rank == 0;
        let is_last = c.pp_rank + 1 == self.config.pipeline_parallel_size
            && c.vp_rank + 1 == self.config.vp_size();
        let prefix = format!("{}.layers", self.config.model_type.block_key());

        match &param.placement {
            Placement::FirstStage => is_first.then(|| path.to_string()),
            Placement::LastStage => is_last.then(|| path.to_string()),
            Placement::Layer { layer, suffix } => {
                let (vp, pp, local) = self.locate_layer(*layer);
                (vp == c.vp_rank && pp == c.pp_rank)
                    .then(|| format!("{}.{}.{}", prefix, local, suffix))
            }
            Placement::Expert {
                layer,
                expert,
                suffix,
            } => {
                let (vp, pp, local) = self.locate_layer(*layer);
                let per_rank = self.config.num_local_experts();
                let ep_rank = c.ep_rank.unwrap_or(0);
                let held = vp == c.vp_rank && pp == c.pp_rank && expert / per_rank == ep_rank;
                held.then(|| {
                    format!(
                        "{}.{}.mlp.experts.local_experts.{}.{}",
                        prefix,
                        local,
                        expert % per_rank,
                        suffix
                    )
                })
            }
        }
    }

    fn slice(&self, param: &Param, tp_rank: usize) -> Result<Tensor> {
        let tp = self.config.tensor_parallel_size;
        let pick = |mut parts: Vec<Tensor>| parts.swap_remove(tp_rank);
        match param.split {
            Split::Replicated => Ok(param.tensor.clone()),
            Split::Rows => Ok(pick(param.tensor.chunk(tp, 0)?)),
            Split::Cols => Ok(pick(param.tensor.chunk(tp, 1)?)),
            Split::GatedRows => {
                let halves = param.tensor.chunk(2, 0)?;
                let gate = pick(halves[0].chunk(tp, 0)?);
                let value = pick(halves[1].chunk(tp, 0)?);
                Tensor::cat(&[gate, value], 0)
            }
        }
    }
}

#[async_trait]
impl ShardProvider for MockShardProvider {
    async fn checkpoint_args(&self) -> Result<CheckpointArgs> {
        Ok(self.config.checkpoint_args())
    }

    async fn load(&self, coordinate: ShardCoordinate) -> Result<ModelShard> {
        let c = &self.config;
        let in_range = coordinate.tp_rank < c.tensor_parallel_size
            && coordinate.pp_rank < c.pipeline_parallel_size
            && coordinate.vp_rank < c.vp_size()
            && match coordinate.ep_rank {
                Some(ep) => c.num_experts > 0 && ep < c.expert_parallel_size,
                None => c.num_experts == 0,
            };
        if !in_range {
            return Err(LoaderError::Config(format!(
                "no shard at {} in a tp={} pp={} vp={} ep={} checkpoint",
                coordinate,
                c.tensor_parallel_size,
                c.pipeline_parallel_size,
                c.vp_size(),
                c.expert_parallel_size
            )));
        }

        let mut tensors = BTreeMap::new();
        for (path, param) in &self.reference {
            if let Some(shard_path) = self.shard_path(path, param, &coordinate) {
                tensors.insert(shard_path, self.slice(param, coordinate.tp_rank)?);
            }
        }
        for ((coord, path), tensor) in &self.tensor_overrides {
            if *coord == coordinate {
                tensors.insert(path.clone(), tensor.clone());
            }
        }
        self.removed
            .iter()
            .filter(|(coord, _)| *coord == coordinate)
            .for_each(|(_, path)| {
                tensors.remove(path);
            });

        let consumed = self
            .consumed_overrides
            .get(&coordinate)
            .copied()
            .unwrap_or(c.consumed);

        self.load_log.write().await.push(coordinate);
        debug!(%coordinate, tensors = tensors.len(), "Served mock shard");

        Ok(ModelShard::new(coordinate, consumed, tensors))
    }

    /// Embedding lookup (plus learned positions) projected back onto the
    /// vocabulary through the output layer, or the tied embedding table
    async fn forward(&self, shard: &ModelShard, batch: &SyntheticBatch) -> Result<Tensor> {
        let word = shard
            .tensor("embedding.word_embeddings.weight")
            .ok_or_else(|| LoaderError::MissingTensor {
                path: "embedding.word_embeddings.weight".to_string(),
                coordinate: shard.coordinate.to_string(),
            })?;
        let positions = shard.tensor("embedding.position_embeddings.weight");
        let output = shard.tensor("output_layer.weight").unwrap_or(word);

        let vocab = word.dim(0)?;
        let hidden = word.dim(1)?;
        let batch_size = batch.tokens.dim(0)?;
        let seq = batch.tokens.dim(1)?;

        let mut logits: Vec<f32> = Vec::with_capacity(batch_size * seq * vocab);
        let mut state = vec![0.0f32; hidden];
        for (i, token) in batch.tokens.data.iter().enumerate() {
            let row = (*token as usize) % vocab;
            state.copy_from_slice(&word.data[row * hidden..(row + 1) * hidden]);
            if let Some(pos) = positions {
                let p = (batch.position_ids.data[i] as usize) % pos.dim(0)?;
                for (s, x) in state.iter_mut().zip(&pos.data[p * hidden..(p + 1) * hidden]) {
                    *s += x;
                }
            }
            for out_row in output.data.chunks(hidden) {
                logits.push(state.iter().zip(out_row).map(|(a, b)| a * b).sum());
            }
        }

        Tensor::new(logits, vec![batch_size, seq, output.dim(0)?])
    }
}
