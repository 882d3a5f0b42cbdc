//! File-backed shard provider
//!
//! Checkpoint directory layout:
//!
//! ```text
//! <root>/
//!   args.cbor                        CheckpointArgs
//!   mp_rank_00_000/model_vp0.cbor    tp=0 pp=0 vp=0
//!   mp_rank_01_000/model_vp0.cbor    tp=1 pp=0 vp=0
//!   mp_rank_00_000_001/model_vp0.cbor  tp=0 pp=0 ep=1 (expert-parallel)
//! ```
//!
//! Each shard file is one CBOR document holding the consumed-sample
//! counters and the tensors keyed by storage path.

use crate::checkpoint::CheckpointArgs;
use crate::errors::{LoaderError, Result};
use crate::tensor::Tensor;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::{ConsumedSamples, ModelShard, ShardCoordinate, ShardProvider};

/// Name of the checkpoint arguments file
pub const ARGS_FILE: &str = "args.cbor";

#[derive(Debug, Serialize, Deserialize)]
struct ShardFile {
    consumed: ConsumedSamples,
    tensors: BTreeMap<String, Tensor>,
}

/// Directory holding the shard of `coordinate`, relative to the root
pub fn shard_dir_name(coordinate: &ShardCoordinate) -> String {
    match coordinate.ep_rank {
        Some(ep) => format!(
            "mp_rank_{:02}_{:03}_{:03}",
            coordinate.tp_rank, coordinate.pp_rank, ep
        ),
        None => format!("mp_rank_{:02}_{:03}", coordinate.tp_rank, coordinate.pp_rank),
    }
}

/// Full path of the shard file of `coordinate`
pub fn shard_file_path(root: &Path, coordinate: &ShardCoordinate) -> PathBuf {
    root.join(shard_dir_name(coordinate))
        .join(format!("model_vp{}.cbor", coordinate.vp_rank))
}

async fn read_cbor<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = tokio::fs::read(path).await?;
    Ok(ciborium::from_reader(&bytes[..])?)
}

async fn write_cbor<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf)?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, &buf).await?;
    Ok(())
}

/// Reads shards from a checkpoint directory
#[derive(Debug, Clone)]
pub struct CborShardProvider {
    root: PathBuf,
}

impl CborShardProvider {
    /// Open a checkpoint directory; the arguments file must exist
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.join(ARGS_FILE).is_file() {
            return Err(LoaderError::Config(format!(
                "{} is not a checkpoint directory (missing {})",
                root.display(),
                ARGS_FILE
            )));
        }
        info!(root = %root.display(), "Opened checkpoint directory");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl ShardProvider for CborShardProvider {
    async fn checkpoint_args(&self) -> Result<CheckpointArgs> {
        read_cbor(&self.root.join(ARGS_FILE)).await
    }

    async fn load(&self, coordinate: ShardCoordinate) -> Result<ModelShard> {
        let path = shard_file_path(&self.root, &coordinate);
        if !path.is_file() {
            return Err(LoaderError::Config(format!(
                "checkpoint has no shard file for {} (expected {})",
                coordinate,
                path.display()
            )));
        }
        let file: ShardFile = read_cbor(&path).await?;
        debug!(
            %coordinate,
            path = %path.display(),
            tensors = file.tensors.len(),
            "Read shard file"
        );
        Ok(ModelShard::new(coordinate, file.consumed, file.tensors))
    }
}

/// Write every shard `provider` serves for `coordinates` under `root`,
/// together with the arguments file
///
/// Returns the number of shard files written.
pub async fn write_checkpoint<P: ShardProvider + ?Sized>(
    provider: &P,
    root: &Path,
    coordinates: &[ShardCoordinate],
) -> Result<usize> {
    let args = provider.checkpoint_args().await?;
    write_cbor(&root.join(ARGS_FILE), &args).await?;

    for coordinate in coordinates {
        let shard = provider.load(*coordinate).await?;
        let file = ShardFile {
            consumed: shard.consumed,
            tensors: shard.into_tensors(),
        };
        write_cbor(&shard_file_path(root, coordinate), &file).await?;
    }

    info!(
        root = %root.display(),
        shards = coordinates.len(),
        "Wrote checkpoint"
    );
    Ok(coordinates.len())
}
