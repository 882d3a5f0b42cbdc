//! Sharded checkpoint loader
//!
//! Reads a model checkpoint saved under tensor, pipeline, virtual-pipeline
//! and expert parallelism, merges the per-rank shards back into logical
//! tensors, and streams them to a consumer in a fixed order.
//!
//! ```text
//! ShardProvider ──► RankWalker ──► merge ──► Emitter ──► channel ──► Sink
//!   (cbor/mock)      (groups)     (TP axes)   (messages)   (bounded)   (cbor/log)
//! ```

pub mod checkpoint;
pub mod config;
pub mod errors;
pub mod merge;
pub mod observability;
pub mod provider;
pub mod schema;
pub mod stream;
pub mod tensor;
pub mod validation;
pub mod walker;

pub use checkpoint::{CheckpointArgs, ModelMetadata, ParamsDtype, PositionEmbeddingType};
pub use config::LoaderConfig;
pub use errors::{LoaderError, Result};
pub use merge::{Merged, ReplicaPolicy};
pub use observability::{init_production_logging, init_simple_logging};
pub use provider::{
    write_checkpoint, CborShardProvider, ConsumedSamples, MockModelConfig, MockShardProvider,
    ModelShard, ShardCoordinate, ShardProvider,
};
pub use schema::{ArchitectureVariant, LayerLayout, LayerRole, ModelKind, Schema, TransformerImpl};
pub use stream::{
    channel, drain, load_checkpoint, CborStreamSink, CollectSink, LoaderMessage, MessageReceiver,
    MessageSender, NamedTensors, Sink, StreamSummary, SummarySink,
};
pub use tensor::Tensor;
pub use walker::{RankGeometry, RankWalker};
