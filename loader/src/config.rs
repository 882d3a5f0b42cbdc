//! Loader run configuration
//!
//! One immutable [`LoaderConfig`] is built before a run and passed by
//! reference to every component that needs it. It can be loaded from a TOML
//! file; every field has a default.

use crate::checkpoint::PositionEmbeddingType;
use crate::errors::{LoaderError, Result};
use crate::merge::ReplicaPolicy;
use crate::schema::{ModelKind, TransformerImpl};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Resolved loader options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Model family to read the checkpoint as
    pub model_type: ModelKind,

    /// Transformer implementation the checkpoint was saved with
    pub transformer_impl: TransformerImpl,

    /// Position embedding scheme, used when the checkpoint does not record one
    pub position_embedding_type: PositionEmbeddingType,

    /// Original (unpadded) vocabulary size
    pub true_vocab_size: Option<usize>,

    /// JSON vocabulary file whose entry count gives the true vocabulary size
    pub vocab_file: Option<PathBuf>,

    /// Emit a `logits_check` message computed on fabricated input
    pub test_logits: bool,

    /// Treatment of tensor-parallel copies of replicated parameters
    pub replica_policy: ReplicaPolicy,

    /// Capacity of the producer → sink channel
    pub channel_capacity: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            model_type: ModelKind::Gpt,
            transformer_impl: TransformerImpl::TransformerEngine,
            position_embedding_type: PositionEmbeddingType::LearnedAbsolute,
            true_vocab_size: None,
            vocab_file: None,
            test_logits: false,
            replica_policy: ReplicaPolicy::Discard,
            channel_capacity: 1,
        }
    }
}

impl LoaderConfig {
    /// Get default configuration file path: `~/.ckpt-loader/loader.toml`
    pub fn default_path() -> Result<PathBuf> {
        let home = dirs::home_dir()
            .ok_or_else(|| LoaderError::Config("Could not determine home directory".to_string()))?;
        Ok(home.join(".ckpt-loader").join("loader.toml"))
    }

    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        tracing::info!(path = %path.display(), "Loading configuration");

        let content = std::fs::read_to_string(path).map_err(|e| {
            tracing::error!(path = %path.display(), error = %e, "Failed to read config file");
            e
        })?;

        let config: LoaderConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        tracing::info!(path = %path.display(), "Configuration saved");
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.channel_capacity == 0 {
            return Err(LoaderError::Config(
                "channel_capacity must be at least 1".into(),
            ));
        }
        if self.true_vocab_size == Some(0) {
            return Err(LoaderError::Config(
                "true_vocab_size must be positive when set".into(),
            ));
        }
        Ok(())
    }

    /// Resolve the true (unpadded) vocabulary size
    ///
    /// An explicit size wins; otherwise the vocab file's entry count is used.
    /// Supplying both with different sizes is a configuration fault.
    pub fn resolve_true_vocab_size(&self) -> Result<Option<usize>> {
        let from_file = match &self.vocab_file {
            Some(path) => Some(vocab_file_size(path)?),
            None => None,
        };

        match (self.true_vocab_size, from_file) {
            (Some(explicit), Some(file)) if explicit != file => Err(LoaderError::Config(format!(
                "true_vocab_size {} does not match vocab file size {}",
                explicit, file
            ))),
            (Some(explicit), _) => Ok(Some(explicit)),
            (None, file) => Ok(file),
        }
    }
}

/// Number of entries in a JSON vocabulary (token → id) file
fn vocab_file_size(path: &Path) -> Result<usize> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        tracing::error!(path = %path.display(), error = %e, "Failed to read vocab file");
        e
    })?;
    let vocab: HashMap<String, serde_json::Value> = serde_json::from_str(&content)?;
    Ok(vocab.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_vocab(dir: &TempDir, entries: usize) -> PathBuf {
        let vocab: HashMap<String, usize> =
            (0..entries).map(|i| (format!("tok{}", i), i)).collect();
        let path = dir.path().join("vocab.json");
        std::fs::write(&path, serde_json::to_string(&vocab).unwrap()).unwrap();
        path
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = LoaderConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.channel_capacity, 1);
        assert_eq!(config.replica_policy, ReplicaPolicy::Discard);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let config = LoaderConfig {
            channel_capacity: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(LoaderError::Config(_))));
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("loader.toml");
        let config = LoaderConfig {
            model_type: ModelKind::Bert,
            transformer_impl: TransformerImpl::Local,
            true_vocab_size: Some(30522),
            replica_policy: ReplicaPolicy::Verify,
            ..Default::default()
        };
        config.save(&path).unwrap();
        assert_eq!(LoaderConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("loader.toml");
        std::fs::write(&path, "model_type = \"BERT\"\ntest_logits = true\n").unwrap();
        let config = LoaderConfig::load(&path).unwrap();
        assert_eq!(config.model_type, ModelKind::Bert);
        assert!(config.test_logits);
        assert_eq!(config.transformer_impl, TransformerImpl::TransformerEngine);
    }

    #[test]
    fn test_true_vocab_size_resolution() {
        let dir = TempDir::new().unwrap();
        let vocab = write_vocab(&dir, 12);

        let none = LoaderConfig::default();
        assert_eq!(none.resolve_true_vocab_size().unwrap(), None);

        let explicit = LoaderConfig {
            true_vocab_size: Some(12),
            ..Default::default()
        };
        assert_eq!(explicit.resolve_true_vocab_size().unwrap(), Some(12));

        let from_file = LoaderConfig {
            vocab_file: Some(vocab.clone()),
            ..Default::default()
        };
        assert_eq!(from_file.resolve_true_vocab_size().unwrap(), Some(12));

        let agreeing = LoaderConfig {
            true_vocab_size: Some(12),
            vocab_file: Some(vocab.clone()),
            ..Default::default()
        };
        assert_eq!(agreeing.resolve_true_vocab_size().unwrap(), Some(12));

        let conflicting = LoaderConfig {
            true_vocab_size: Some(13),
            vocab_file: Some(vocab),
            ..Default::default()
        };
        assert!(matches!(
            conflicting.resolve_true_vocab_size(),
            Err(LoaderError::Config(_))
        ));
    }
}
