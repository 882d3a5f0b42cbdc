//! Builds and sends the ordered message sequence

use crate::checkpoint::{ModelMetadata, PositionEmbeddingType};
use crate::config::LoaderConfig;
use crate::errors::{LoaderError, Result};
use crate::merge::{merge_replicated, merge_role, merge_row_parallel, Merged, ReplicaPolicy};
use crate::provider::{ModelShard, ShardProvider};
use crate::schema::{self, LayerLayout, LayerRole, LayerTensors, Schema, Section};
use crate::tensor::Tensor;
use crate::validation::{self, SyntheticBatch};
use crate::walker::{RankGeometry, RankWalker};
use tracing::{error, info, warn};

use super::{LoaderMessage, MessageSender, NamedTensors};

/// Load a checkpoint through `provider` and stream it into `tx`
///
/// On any fault an `Exit` marker is pushed before the error is returned;
/// otherwise the stream ends with `Done`.
pub async fn load_checkpoint<P: ShardProvider + ?Sized>(
    provider: &P,
    config: &LoaderConfig,
    tx: &MessageSender,
) -> Result<()> {
    match stream_checkpoint(provider, config, tx).await {
        Ok(()) => {
            info!("Checkpoint stream complete");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Loading failed, aborting stream");
            if let Err(send_err) = tx.exit(e.to_string()).await {
                warn!(error = %send_err, "Exit marker not delivered");
            }
            Err(e)
        }
    }
}

async fn stream_checkpoint<P: ShardProvider + ?Sized>(
    provider: &P,
    config: &LoaderConfig,
    tx: &MessageSender,
) -> Result<()> {
    config.validate()?;
    let true_vocab_size = config.resolve_true_vocab_size()?;
    let args = provider.checkpoint_args().await?;
    let mut md = ModelMetadata::from_checkpoint(&args, config, true_vocab_size)?;

    let schema = schema::resolve(
        md.model_type,
        config.transformer_impl,
        md.num_experts,
        md.previous_expert_parallel_size,
    )?;
    let geometry = RankGeometry::from_metadata(&md, schema.variant().num_local_experts())?;
    if config.test_logits {
        validation::check_supported(&md)?;
    }
    info!(
        variant = %schema.variant(),
        tp = geometry.tp_size,
        pp = geometry.pp_size,
        vp = geometry.vp_size,
        ep = geometry.ep_size,
        layers = geometry.num_layers,
        "Resolved checkpoint layout"
    );

    let mut walker = RankWalker::new(provider, geometry);
    walker.load_stage(0).await?;
    let consumed = walker.consumed().ok_or_else(|| {
        LoaderError::Internal("first pipeline stage loaded no shards".to_string())
    })?;
    md.set_consumed(consumed);
    tx.send(LoaderMessage::Metadata(Box::new(md.clone()))).await?;

    let emitter = Emitter::new(schema, md, config.replica_policy, tx);
    let mut last_group: Option<Vec<ModelShard>> = None;
    for (vp_rank, pp_rank) in geometry.stage_order() {
        // release the previous group before the next stage is read
        drop(last_group.take());
        let group = walker.take_group(pp_rank, vp_rank).await?;
        if (vp_rank, pp_rank) == (0, 0) {
            emitter.emit_embeddings(&group).await?;
        }
        emitter.emit_layers(&group, &geometry, vp_rank, pp_rank).await?;
        last_group = Some(group);
    }

    let group = last_group
        .ok_or_else(|| LoaderError::Internal("checkpoint has no pipeline stages".to_string()))?;
    emitter.emit_final_sections(&group).await?;
    if config.test_logits {
        emitter.emit_logits_check(provider, &group).await?;
    }
    tx.done().await
}

/// Collect `role` from every rank; absence on any rank is a fault
fn gather<'s>(layers: &[LayerTensors<'s>], role: LayerRole) -> Result<Vec<&'s Tensor>> {
    layers.iter().map(|layer| layer.require(role)).collect()
}

fn insert_merged(msg: &mut NamedTensors, label: &str, suffix: &str, merged: Merged) {
    match merged {
        Merged::Single(tensor) => msg.insert(format!("{}{}", label, suffix), tensor),
        Merged::Gated { gate, value } => {
            msg.insert(format!("{} W{}", label, suffix), gate);
            msg.insert(format!("{} V{}", label, suffix), value);
        }
    }
}

/// Turns shard groups into named messages for one resolved schema
pub struct Emitter<'a> {
    schema: Schema,
    md: ModelMetadata,
    policy: ReplicaPolicy,
    tx: &'a MessageSender,
}

impl<'a> Emitter<'a> {
    pub fn new(
        schema: Schema,
        md: ModelMetadata,
        policy: ReplicaPolicy,
        tx: &'a MessageSender,
    ) -> Self {
        Self {
            schema,
            md,
            policy,
            tx,
        }
    }

    fn first<'g>(&self, group: &'g [ModelShard]) -> Result<&'g ModelShard> {
        group
            .first()
            .ok_or_else(|| LoaderError::Internal("empty shard group".to_string()))
    }

    /// Rank-0 copy of a replicated role, compared against the other ranks
    /// under [`ReplicaPolicy::Verify`]
    fn replicated(&self, layers: &[LayerTensors<'_>], role: LayerRole) -> Result<Tensor> {
        let ranks = match self.policy {
            ReplicaPolicy::Discard => &layers[..layers.len().min(1)],
            ReplicaPolicy::Verify => layers,
        };
        merge_replicated(&gather(ranks, role)?, self.policy, &role.key())
    }

    fn merged(&self, layers: &[LayerTensors<'_>], role: LayerRole) -> Result<Merged> {
        merge_role(role, &gather(layers, role)?, self.md.swiglu, self.policy)
    }

    /// `embeddings`: word table (all ranks) and learned positions (rank 0)
    pub async fn emit_embeddings(&self, group: &[ModelShard]) -> Result<()> {
        let sections: Vec<_> = group
            .iter()
            .map(|shard| self.schema.get(Section::Embeddings, shard))
            .collect();
        let first = sections
            .first()
            .ok_or_else(|| LoaderError::Internal("empty shard group".to_string()))?;

        let mut msg = NamedTensors::new("embeddings");
        let word = sections
            .iter()
            .map(|s| s.require("word"))
            .collect::<Result<Vec<_>>>()?;
        msg.insert("word embeddings", merge_row_parallel(&word)?);

        match self.md.position_embedding_type {
            PositionEmbeddingType::LearnedAbsolute => {
                msg.insert("position embeddings", first.require("pos")?.clone());
            }
            other => {
                if first.get("pos").is_some() {
                    return Err(LoaderError::Consistency(format!(
                        "checkpoint holds a position embedding table but uses {} positions",
                        other
                    )));
                }
            }
        }

        self.tx.send_tensors(msg).await
    }

    /// One `transformer layer N` message per local layer of the group
    pub async fn emit_layers(
        &self,
        group: &[ModelShard],
        geometry: &RankGeometry,
        vp_rank: usize,
        pp_rank: usize,
    ) -> Result<()> {
        let expected = geometry.layers_per_stage();
        for shard in group {
            let found = self.schema.get_num_layers(shard);
            if found != expected {
                return Err(LoaderError::Consistency(format!(
                    "shard {} holds {} layers, expected {} per stage",
                    shard.coordinate, found, expected
                )));
            }
        }

        for local in 0..expected {
            let global = geometry.global_layer_index(vp_rank, pp_rank, local);
            let msg = self.layer_message(group, local, global)?;
            self.tx.send_tensors(msg).await?;
        }
        Ok(())
    }

    /// Merge local layer `local` of every rank into `transformer layer {global}`
    pub fn layer_message(
        &self,
        group: &[ModelShard],
        local: usize,
        global: usize,
    ) -> Result<NamedTensors> {
        let layers: Vec<LayerTensors<'_>> = group
            .iter()
            .map(|shard| self.schema.get_layer(shard, local))
            .collect();
        let first = layers
            .first()
            .ok_or_else(|| LoaderError::Internal("empty shard group".to_string()))?;
        let md = &self.md;
        let rep = |role: LayerRole| self.replicated(&layers, role);
        let merged = |role: LayerRole| self.merged(&layers, role);
        let mut msg = NamedTensors::new(format!("transformer layer {}", global));

        msg.insert("input norm weight", rep(LayerRole::SelfAttnNormWeight)?);
        msg.insert("post norm weight", rep(LayerRole::MlpNormWeight)?);
        if md.norm_has_bias {
            msg.insert("input norm bias", rep(LayerRole::SelfAttnNormBias)?);
            msg.insert("post norm bias", rep(LayerRole::MlpNormBias)?);
        }

        // q/k norms exist only when the model was trained with qk-layernorm
        for (label, weight, bias) in [
            (
                "q norm",
                LayerRole::SelfAttnQLayernormWeight,
                LayerRole::SelfAttnQLayernormBias,
            ),
            (
                "k norm",
                LayerRole::SelfAttnKLayernormWeight,
                LayerRole::SelfAttnKLayernormBias,
            ),
        ] {
            if first.get(weight).is_some() {
                msg.insert(format!("{} weight", label), rep(weight)?);
                if md.norm_has_bias {
                    msg.insert(format!("{} bias", label), rep(bias)?);
                }
            }
        }

        let qkv = merged(LayerRole::SelfAttnQkvWeight)?;
        insert_merged(&mut msg, "qkv weight", "", qkv);
        if md.qkv_bias {
            let qkv_bias = merged(LayerRole::SelfAttnQkvBias)?;
            insert_merged(&mut msg, "qkv bias", "", qkv_bias);
        }
        let dense = merged(LayerRole::SelfAttnProjWeight)?;
        insert_merged(&mut msg, "dense weight", "", dense);
        if md.linear_bias {
            msg.insert("dense bias", rep(LayerRole::SelfAttnProjBias)?);
        }

        match self.schema.variant().layout {
            LayerLayout::DenseReference | LayerLayout::DenseFused => {
                let fc1 = merged(LayerRole::MlpFc1Weight)?;
                insert_merged(&mut msg, "mlp l0 weight", "", fc1);
                let fc2 = merged(LayerRole::MlpFc2Weight)?;
                insert_merged(&mut msg, "mlp l1 weight", "", fc2);
                if md.linear_bias {
                    let fc1_bias = merged(LayerRole::MlpFc1Bias)?;
                    insert_merged(&mut msg, "mlp l0 bias", "", fc1_bias);
                    msg.insert("mlp l1 bias", rep(LayerRole::MlpFc2Bias)?);
                }
                if md.xielu {
                    msg.insert("mlp xielu alpha p", rep(LayerRole::MlpXieluAlphaP)?);
                    msg.insert("mlp xielu alpha n", rep(LayerRole::MlpXieluAlphaN)?);
                }
            }
            LayerLayout::MoeFused { num_local_experts } => {
                msg.insert("router weight", rep(LayerRole::RouterWeight)?);
                for i in 0..num_local_experts {
                    let suffix = format!(".{}", i);
                    let fc1 = merged(LayerRole::ExpertFc1Weight(i))?;
                    insert_merged(&mut msg, "mlp l0 weight", &suffix, fc1);
                    let fc2 = merged(LayerRole::ExpertFc2Weight(i))?;
                    insert_merged(&mut msg, "mlp l1 weight", &suffix, fc2);
                    if md.xielu {
                        let alpha_p = rep(LayerRole::ExpertXieluAlphaP(i))?;
                        msg.insert(format!("mlp xielu alpha p{}", suffix), alpha_p);
                        let alpha_n = rep(LayerRole::ExpertXieluAlphaN(i))?;
                        msg.insert(format!("mlp xielu alpha n{}", suffix), alpha_n);
                    }
                }
            }
        }

        Ok(msg)
    }

    /// `final norm`, `output layer` (untied only) and the BERT heads, all
    /// read from the last pipeline stage
    pub async fn emit_final_sections(&self, group: &[ModelShard]) -> Result<()> {
        let first = self.first(group)?;

        let norm = self.schema.get(Section::FinalNorm, first);
        let mut msg = NamedTensors::new("final norm");
        msg.insert("weight", norm.require("weight")?.clone());
        if self.md.norm_has_bias {
            msg.insert("bias", norm.require("bias")?.clone());
        }
        self.tx.send_tensors(msg).await?;

        if self.md.output_layer {
            let weights = group
                .iter()
                .map(|shard| self.schema.get(Section::OutputLayer, shard).require("weight"))
                .collect::<Result<Vec<_>>>()?;
            let mut msg = NamedTensors::new("output layer");
            msg.insert("weight", merge_row_parallel(&weights)?);
            self.tx.send_tensors(msg).await?;
        }

        if self.md.model_type.is_encoder() {
            let pooler = self.schema.get(Section::Pooler, first);
            let mut msg = NamedTensors::new("pooler");
            msg.insert("weight", pooler.require("weight")?.clone());
            msg.insert("bias", pooler.require("bias")?.clone());
            self.tx.send_tensors(msg).await?;

            let head = self.schema.get(Section::LmHead, first);
            let mut msg = NamedTensors::new("lm head");
            msg.insert("dense weight", head.require("dense_weight")?.clone());
            msg.insert("dense bias", head.require("dense_bias")?.clone());
            msg.insert("norm weight", head.require("norm_weight")?.clone());
            if self.md.norm_has_bias {
                msg.insert("norm bias", head.require("norm_bias")?.clone());
            }
            self.tx.send_tensors(msg).await?;

            if self.md.bert_binary_head {
                let binary = self.schema.get(Section::BinaryHead, first);
                let mut msg = NamedTensors::new("binary head");
                msg.insert("weight", binary.require("weight")?.clone());
                msg.insert("bias", binary.require("bias")?.clone());
                self.tx.send_tensors(msg).await?;
            }
        }

        Ok(())
    }

    /// `logits_check`: a synthetic batch and the logits the unsharded model
    /// produces for it
    pub async fn emit_logits_check<P: ShardProvider + ?Sized>(
        &self,
        provider: &P,
        group: &[ModelShard],
    ) -> Result<()> {
        let shard = self.first(group)?;
        let batch = SyntheticBatch::fabricate(self.md.seq_length, validation::SEED);
        let output = provider.forward(shard, &batch).await?;

        let mut msg = NamedTensors::new("logits_check");
        msg.insert("tokens", batch.tokens);
        msg.insert("position_ids", batch.position_ids);
        msg.insert("attention_mask", batch.attention_mask);
        msg.insert("output", output);
        self.tx.send_tensors(msg).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{MockModelConfig, MockShardProvider, ShardCoordinate};
    use crate::schema::ModelKind;
    use crate::stream::channel;

    async fn emitter_parts(
        config: MockModelConfig,
    ) -> (MockShardProvider, Schema, ModelMetadata, Vec<ModelShard>) {
        let provider = MockShardProvider::new(config, 21).unwrap();
        let args = provider.checkpoint_args().await.unwrap();
        let md = ModelMetadata::from_checkpoint(&args, &LoaderConfig::default(), None).unwrap();
        let schema = schema::resolve(
            md.model_type,
            provider.config().transformer_impl,
            md.num_experts,
            md.previous_expert_parallel_size,
        )
        .unwrap();
        let geometry = RankGeometry::from_metadata(&md, schema.variant().num_local_experts())
            .unwrap();
        let mut group = Vec::new();
        for tp in 0..geometry.tp_size {
            group.push(provider.load(geometry.coordinate(tp, 0, 0)).await.unwrap());
        }
        (provider, schema, md, group)
    }

    fn labels(msg: &NamedTensors) -> Vec<&str> {
        msg.labels().collect()
    }

    #[tokio::test]
    async fn test_gated_layer_labels_and_values() {
        let config = MockModelConfig {
            tensor_parallel_size: 2,
            swiglu: true,
            qk_layernorm: true,
            xielu: true,
            add_qkv_bias: true,
            ..Default::default()
        };
        let (provider, schema, md, group) = emitter_parts(config).await;
        let (tx, _rx) = channel(1);
        let emitter = Emitter::new(schema, md, ReplicaPolicy::Verify, &tx);

        let msg = emitter.layer_message(&group, 1, 1).unwrap();
        assert_eq!(msg.name, "transformer layer 1");
        assert_eq!(
            labels(&msg),
            vec![
                "dense bias",
                "dense weight",
                "input norm bias",
                "input norm weight",
                "k norm bias",
                "k norm weight",
                "mlp l0 bias V",
                "mlp l0 bias W",
                "mlp l0 weight V",
                "mlp l0 weight W",
                "mlp l1 bias",
                "mlp l1 weight",
                "mlp xielu alpha n",
                "mlp xielu alpha p",
                "post norm bias",
                "post norm weight",
                "q norm bias",
                "q norm weight",
                "qkv bias",
                "qkv weight",
            ]
        );

        let fc1 = provider.reference("decoder.layers.1.mlp.linear_fc1.weight").unwrap();
        assert_eq!(msg.get("mlp l0 weight W"), Some(&fc1.narrow(0, 0, 16).unwrap()));
        assert_eq!(msg.get("mlp l0 weight V"), Some(&fc1.narrow(0, 16, 16).unwrap()));
        assert_eq!(
            msg.get("dense weight"),
            provider.reference("decoder.layers.1.self_attention.linear_proj.weight")
        );
    }

    #[tokio::test]
    async fn test_rms_norm_layers_omit_biases() {
        let config = MockModelConfig {
            normalization: "RMSNorm".to_string(),
            add_bias_linear: false,
            ..Default::default()
        };
        let (_provider, schema, md, group) = emitter_parts(config).await;
        let (tx, _rx) = channel(1);
        let emitter = Emitter::new(schema, md, ReplicaPolicy::Discard, &tx);

        let msg = emitter.layer_message(&group, 0, 0).unwrap();
        assert_eq!(
            labels(&msg),
            vec![
                "dense weight",
                "input norm weight",
                "mlp l0 weight",
                "mlp l1 weight",
                "post norm weight",
                "qkv weight",
            ]
        );
    }

    #[tokio::test]
    async fn test_expert_layer_labels() {
        let config = MockModelConfig {
            num_experts: 4,
            expert_parallel_size: 2,
            num_layers: 2,
            tensor_parallel_size: 2,
            swiglu: true,
            ..Default::default()
        };
        let (provider, schema, md, group) = emitter_parts(config).await;
        let (tx, _rx) = channel(1);
        let emitter = Emitter::new(schema, md, ReplicaPolicy::Discard, &tx);

        let msg = emitter.layer_message(&group, 0, 0).unwrap();
        for i in 0..2 {
            assert!(msg.get(&format!("mlp l0 weight W.{}", i)).is_some());
            assert!(msg.get(&format!("mlp l0 weight V.{}", i)).is_some());
            assert!(msg.get(&format!("mlp l1 weight.{}", i)).is_some());
        }
        assert!(msg.get("mlp l1 weight.2").is_none());
        assert!(msg.get("mlp l1 bias").is_none());
        assert_eq!(
            msg.get("router weight"),
            provider.reference("decoder.layers.0.mlp.router.weight")
        );
        assert_eq!(
            msg.get("mlp l1 weight.1"),
            provider.reference("decoder.layers.0.mlp.experts.local_experts.1.linear_fc2.weight")
        );
    }

    #[tokio::test]
    async fn test_missing_layer_tensor_is_reported() {
        let config = MockModelConfig::default();
        let provider = MockShardProvider::new(config, 0).unwrap().without_tensor(
            ShardCoordinate::new(0, 0, 0, None),
            "decoder.layers.0.mlp.linear_fc2.weight",
        );
        let args = provider.checkpoint_args().await.unwrap();
        let md = ModelMetadata::from_checkpoint(&args, &LoaderConfig::default(), None).unwrap();
        let schema = schema::resolve(ModelKind::Gpt, Default::default(), 0, 1).unwrap();
        let group = vec![provider.load(ShardCoordinate::new(0, 0, 0, None)).await.unwrap()];
        let (tx, _rx) = channel(1);
        let emitter = Emitter::new(schema, md, ReplicaPolicy::Discard, &tx);

        match emitter.layer_message(&group, 0, 0) {
            Err(LoaderError::MissingTensor { path, .. }) => {
                assert_eq!(path, "decoder.layers.0.mlp.linear_fc2.weight")
            }
            other => panic!("expected MissingTensor, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rope_with_position_table_is_fatal() {
        let config = MockModelConfig::default();
        let (_provider, schema, mut md, group) = emitter_parts(config).await;
        md.position_embedding_type = PositionEmbeddingType::Rope;
        let (tx, _rx) = channel(1);
        let emitter = Emitter::new(schema, md, ReplicaPolicy::Discard, &tx);

        assert!(matches!(
            emitter.emit_embeddings(&group).await,
            Err(LoaderError::Consistency(_))
        ));
    }
}
