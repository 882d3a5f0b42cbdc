//! Checkpoint arguments and the metadata record derived from them
//!
//! ```text
//! ShardProvider::checkpoint_args()
//!         │
//!         ▼
//! ┌───────────────────┐     required fields checked,
//! │  CheckpointArgs   │     defaults applied
//! └───────────────────┘
//!         │
//!         ▼
//! ┌───────────────────┐
//! │   ModelMetadata   │ ──► first message of the stream
//! └───────────────────┘
//! ```

pub mod args;
pub mod metadata;

pub use args::{CheckpointArgs, ParamsDtype, PositionEmbeddingType};
pub use metadata::ModelMetadata;
