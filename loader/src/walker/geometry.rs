//! Parallel layout of a checkpoint and the layer numbering it implies

use crate::checkpoint::ModelMetadata;
use crate::errors::{LoaderError, Result};
use crate::provider::ShardCoordinate;

/// Sizes of every parallel dimension the checkpoint was saved with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RankGeometry {
    pub tp_size: usize,
    pub pp_size: usize,
    /// 1 when virtual pipelining is disabled
    pub vp_size: usize,
    /// 1 when expert parallelism is disabled
    pub ep_size: usize,
    pub num_local_experts: usize,
    pub num_layers: usize,
}

impl RankGeometry {
    /// Derive the geometry from checkpoint metadata
    ///
    /// Layers must split evenly over every (pipeline, virtual-pipeline) pair.
    pub fn from_metadata(md: &ModelMetadata, num_local_experts: usize) -> Result<Self> {
        let geometry = Self {
            tp_size: md.previous_tensor_parallel_size,
            pp_size: md.previous_pipeline_parallel_size,
            vp_size: md.previous_virtual_pipeline_parallel_size,
            ep_size: md.previous_expert_parallel_size,
            num_local_experts,
            num_layers: md.num_layers,
        };
        geometry.validate()?;
        Ok(geometry)
    }

    fn validate(&self) -> Result<()> {
        if self.tp_size == 0 || self.pp_size == 0 || self.vp_size == 0 || self.ep_size == 0 {
            return Err(LoaderError::Config(format!(
                "parallel sizes must be positive: tp={} pp={} vp={} ep={}",
                self.tp_size, self.pp_size, self.vp_size, self.ep_size
            )));
        }
        let stages = self.pp_size * self.vp_size;
        if self.num_layers == 0 || self.num_layers % stages != 0 {
            return Err(LoaderError::Config(format!(
                "num_layers {} cannot be split evenly over {} pipeline x {} virtual stages",
                self.num_layers, self.pp_size, self.vp_size
            )));
        }
        Ok(())
    }

    /// Layers held by one (pipeline, virtual-pipeline) sub-model
    pub fn layers_per_stage(&self) -> usize {
        self.num_layers / (self.pp_size * self.vp_size)
    }

    /// Global index of local layer `local` in sub-model (`pp_rank`, `vp_rank`)
    ///
    /// Each virtual-pipeline pass walks every pipeline stage before the next
    /// pass begins.
    pub fn global_layer_index(&self, vp_rank: usize, pp_rank: usize, local: usize) -> usize {
        let per_stage = self.layers_per_stage();
        vp_rank * self.pp_size * per_stage + pp_rank * per_stage + local
    }

    /// Whether the checkpoint holds mixture-of-experts layers
    pub fn is_moe(&self) -> bool {
        self.num_local_experts > 0
    }

    /// Coordinate of a shard; MoE shards are read at expert rank 0
    pub fn coordinate(&self, tp_rank: usize, pp_rank: usize, vp_rank: usize) -> ShardCoordinate {
        let ep_rank = if self.is_moe() { Some(0) } else { None };
        ShardCoordinate::new(tp_rank, pp_rank, vp_rank, ep_rank)
    }

    /// (vp_rank, pp_rank) pairs in emission order
    pub fn stage_order(&self) -> impl Iterator<Item = (usize, usize)> {
        let pp_size = self.pp_size;
        (0..self.vp_size).flat_map(move |vp| (0..pp_size).map(move |pp| (vp, pp)))
    }
}
