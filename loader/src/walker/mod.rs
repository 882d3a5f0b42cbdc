//! Rank walker
//!
//! Enumerates the rank coordinates of a checkpoint, asks the shard provider
//! for each shard exactly once, and hands out groups of shards (one per
//! tensor-parallel rank) for every (pipeline, virtual-pipeline) position.
//!
//! ```text
//! stage pp loaded lazily:
//!   for tp in 0..tp_size
//!     for vp in 0..vp_size
//!       provider.load(tp, pp, vp, ep=0 if MoE)
//!
//! groups[(pp, vp)] = [shard(tp=0), shard(tp=1), ...]
//! ```
//!
//! Every loaded shard must report the same consumed-sample counters; the
//! first shard's counters become authoritative.
//!
//! A group is moved out of the walker when taken, so the emitter owns it and
//! drops it after its layers are emitted.

pub mod geometry;

pub use geometry::RankGeometry;

use crate::errors::{LoaderError, Result};
use crate::provider::{ConsumedSamples, ModelShard, ShardProvider};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, error, info};

/// Lazily loads shards and tracks where the walk currently is
pub struct RankWalker<'p, P: ShardProvider + ?Sized> {
    provider: &'p P,
    geometry: RankGeometry,
    /// (pp_rank, vp_rank) -> shards ordered by tp rank
    groups: BTreeMap<(usize, usize), Vec<ModelShard>>,
    loaded_stages: BTreeSet<usize>,
    consumed_train: Option<u64>,
    consumed_valid: Option<u64>,
    /// Last (pp_rank, vp_rank) handed out
    cursor: Option<(usize, usize)>,
}

impl<'p, P: ShardProvider + ?Sized> RankWalker<'p, P> {
    pub fn new(provider: &'p P, geometry: RankGeometry) -> Self {
        Self {
            provider,
            geometry,
            groups: BTreeMap::new(),
            loaded_stages: BTreeSet::new(),
            consumed_train: None,
            consumed_valid: None,
            cursor: None,
        }
    }

    pub fn geometry(&self) -> &RankGeometry {
        &self.geometry
    }

    /// Authoritative counters, once any shard has been loaded
    pub fn consumed(&self) -> Option<ConsumedSamples> {
        match (self.consumed_train, self.consumed_valid) {
            (Some(train), Some(valid)) => Some(ConsumedSamples { train, valid }),
            _ => None,
        }
    }

    /// Groups loaded and not yet taken
    pub fn resident_groups(&self) -> usize {
        self.groups.len()
    }

    /// Last (pp_rank, vp_rank) handed out
    pub fn cursor(&self) -> Option<(usize, usize)> {
        self.cursor
    }

    /// Load every shard of pipeline stage `pp_rank`; no-op once loaded
    pub async fn load_stage(&mut self, pp_rank: usize) -> Result<()> {
        if self.loaded_stages.contains(&pp_rank) {
            return Ok(());
        }
        if pp_rank >= self.geometry.pp_size {
            return Err(LoaderError::Internal(format!(
                "pipeline rank {} out of range (pp_size {})",
                pp_rank, self.geometry.pp_size
            )));
        }

        for tp_rank in 0..self.geometry.tp_size {
            for vp_rank in 0..self.geometry.vp_size {
                let coordinate = self.geometry.coordinate(tp_rank, pp_rank, vp_rank);
                let shard = self.provider.load(coordinate).await.map_err(|e| {
                    error!(
                        %coordinate,
                        last_group = ?self.cursor,
                        error = %e,
                        "Failed to load shard"
                    );
                    e
                })?;
                debug!(
                    %coordinate,
                    tensors = shard.len(),
                    memory_bytes = shard.memory_usage(),
                    "Loaded shard"
                );
                self.record_consumed(&shard)?;
                self.groups
                    .entry((pp_rank, vp_rank))
                    .or_default()
                    .push(shard);
            }
        }

        self.loaded_stages.insert(pp_rank);
        info!(
            pp_rank,
            shards = self.geometry.tp_size * self.geometry.vp_size,
            "Loaded pipeline stage"
        );
        Ok(())
    }

    fn record_consumed(&mut self, shard: &ModelShard) -> Result<()> {
        let check = |slot: &mut Option<u64>, value: u64, kind: &str| -> Result<()> {
            match *slot {
                None => {
                    *slot = Some(value);
                    Ok(())
                }
                Some(expected) if expected == value => Ok(()),
                Some(expected) => {
                    error!(
                        coordinate = %shard.coordinate,
                        kind,
                        expected,
                        found = value,
                        "Consumed-sample counters diverge between shards"
                    );
                    Err(LoaderError::Consistency(format!(
                        "shard {} reports {} consumed {} samples, expected {}",
                        shard.coordinate, value, kind, expected
                    )))
                }
            }
        };
        check(&mut self.consumed_train, shard.consumed.train, "train")?;
        check(&mut self.consumed_valid, shard.consumed.valid, "valid")
    }

    /// Move the group at (`pp_rank`, `vp_rank`) out of the walker, loading
    /// its stage first if needed
    ///
    /// A group can be taken once; asking again is an internal fault since
    /// shards are never reloaded.
    pub async fn take_group(&mut self, pp_rank: usize, vp_rank: usize) -> Result<Vec<ModelShard>> {
        self.load_stage(pp_rank).await?;
        let group = self.groups.remove(&(pp_rank, vp_rank)).ok_or_else(|| {
            LoaderError::Internal(format!(
                "shard group pp={} vp={} was already released",
                pp_rank, vp_rank
            ))
        })?;
        self.cursor = Some((pp_rank, vp_rank));
        Ok(group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{MockModelConfig, MockShardProvider, ShardCoordinate};

    fn geometry_of(config: &MockModelConfig) -> RankGeometry {
        let num_local_experts = if config.num_experts > 0 {
            config.num_experts / config.expert_parallel_size
        } else {
            0
        };
        RankGeometry {
            tp_size: config.tensor_parallel_size,
            pp_size: config.pipeline_parallel_size,
            vp_size: config.virtual_pipeline_parallel_size.unwrap_or(1),
            ep_size: config.expert_parallel_size,
            num_local_experts,
            num_layers: config.num_layers,
        }
    }

    #[tokio::test]
    async fn test_stage_loaded_once_in_tp_then_vp_order() {
        let config = MockModelConfig {
            tensor_parallel_size: 2,
            pipeline_parallel_size: 2,
            virtual_pipeline_parallel_size: Some(2),
            num_layers: 8,
            ..Default::default()
        };
        let geometry = geometry_of(&config);
        let provider = MockShardProvider::new(config, 0).unwrap();
        let mut walker = RankWalker::new(&provider, geometry);

        walker.load_stage(0).await.unwrap();
        walker.load_stage(0).await.unwrap();
        assert_eq!(
            provider.load_log().await,
            vec![
                ShardCoordinate::new(0, 0, 0, None),
                ShardCoordinate::new(0, 0, 1, None),
                ShardCoordinate::new(1, 0, 0, None),
                ShardCoordinate::new(1, 0, 1, None),
            ]
        );
        assert_eq!(walker.resident_groups(), 2);

        let group = walker.take_group(0, 1).await.unwrap();
        assert_eq!(group.len(), 2);
        assert_eq!(group[1].coordinate, ShardCoordinate::new(1, 0, 1, None));
        assert_eq!(walker.cursor(), Some((0, 1)));
        assert_eq!(walker.resident_groups(), 1);
    }

    #[tokio::test]
    async fn test_group_taken_twice_is_internal_fault() {
        let config = MockModelConfig::default();
        let geometry = geometry_of(&config);
        let provider = MockShardProvider::new(config, 0).unwrap();
        let mut walker = RankWalker::new(&provider, geometry);

        walker.take_group(0, 0).await.unwrap();
        assert!(matches!(
            walker.take_group(0, 0).await,
            Err(LoaderError::Internal(_))
        ));
        assert_eq!(provider.load_log().await.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_stage_keeps_cursor() {
        let config = MockModelConfig::default();
        // two stages expected, the checkpoint only has one
        let geometry = RankGeometry {
            pp_size: 2,
            ..geometry_of(&config)
        };
        let provider = MockShardProvider::new(config, 0).unwrap();
        let mut walker = RankWalker::new(&provider, geometry);

        walker.take_group(0, 0).await.unwrap();
        assert!(matches!(
            walker.take_group(1, 0).await,
            Err(LoaderError::Config(_))
        ));
        assert_eq!(walker.cursor(), Some((0, 0)));
        assert_eq!(walker.resident_groups(), 0);
    }

    #[tokio::test]
    async fn test_lazy_stage_load_on_take() {
        let config = MockModelConfig {
            pipeline_parallel_size: 2,
            ..Default::default()
        };
        let geometry = geometry_of(&config);
        let provider = MockShardProvider::new(config, 0).unwrap();
        let mut walker = RankWalker::new(&provider, geometry);

        walker.load_stage(0).await.unwrap();
        assert_eq!(provider.load_log().await.len(), 1);
        walker.take_group(1, 0).await.unwrap();
        assert_eq!(provider.load_log().await.len(), 2);
    }

    #[tokio::test]
    async fn test_diverging_counters_rejected() {
        let config = MockModelConfig {
            tensor_parallel_size: 2,
            ..Default::default()
        };
        let geometry = geometry_of(&config);
        let provider = MockShardProvider::new(config, 0)
            .unwrap()
            .with_consumed(
                ShardCoordinate::new(1, 0, 0, None),
                ConsumedSamples {
                    train: 1024,
                    valid: 65,
                },
            );
        let mut walker = RankWalker::new(&provider, geometry);

        let err = walker.load_stage(0).await.unwrap_err();
        assert!(matches!(err, LoaderError::Consistency(_)));
        assert!(err.to_string().contains("valid"));
    }

    #[tokio::test]
    async fn test_expert_checkpoints_walk_expert_rank_zero() {
        let config = MockModelConfig {
            num_experts: 4,
            expert_parallel_size: 2,
            num_layers: 2,
            tensor_parallel_size: 2,
            ..Default::default()
        };
        let geometry = geometry_of(&config);
        let provider = MockShardProvider::new(config, 0).unwrap();
        let mut walker = RankWalker::new(&provider, geometry);

        walker.take_group(0, 0).await.unwrap();
        assert!(provider
            .load_log()
            .await
            .iter()
            .all(|c| c.ep_rank == Some(0)));
        assert_eq!(
            walker.consumed(),
            Some(ConsumedSamples {
                train: 1024,
                valid: 64
            })
        );
    }
}
