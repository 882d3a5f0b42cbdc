//! Architecture variants a checkpoint can be read as

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Model family, which decides the transformer block prefix and whether
/// encoder task heads exist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelKind {
    /// Decoder-style language model
    #[serde(rename = "GPT")]
    Gpt,
    /// Encoder-style model with pooler / LM / binary heads
    #[serde(rename = "BERT")]
    Bert,
}

impl ModelKind {
    /// Name of the transformer block module inside the model object
    pub fn block_key(self) -> &'static str {
        match self {
            ModelKind::Gpt => "decoder",
            ModelKind::Bert => "encoder",
        }
    }

    /// Whether the model carries encoder task heads
    pub fn is_encoder(self) -> bool {
        matches!(self, ModelKind::Bert)
    }
}

impl FromStr for ModelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GPT" => Ok(ModelKind::Gpt),
            "BERT" => Ok(ModelKind::Bert),
            other => Err(format!("unknown model type '{}' (expected GPT or BERT)", other)),
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelKind::Gpt => write!(f, "GPT"),
            ModelKind::Bert => write!(f, "BERT"),
        }
    }
}

/// Transformer implementation the checkpoint was trained with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformerImpl {
    /// Reference (unfused) layers
    Local,
    /// Fused-kernel layers
    #[default]
    TransformerEngine,
}

impl fmt::Display for TransformerImpl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransformerImpl::Local => write!(f, "local"),
            TransformerImpl::TransformerEngine => write!(f, "transformer_engine"),
        }
    }
}

/// Storage layout of a single transformer layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerLayout {
    /// Dense layers, reference implementation
    DenseReference,
    /// Dense layers, fused-kernel implementation
    DenseFused,
    /// Mixture-of-experts layers, fused-kernel implementation
    MoeFused {
        /// Experts held by one expert-parallel rank
        num_local_experts: usize,
    },
}

/// Closed selection of one layer layout for one model family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchitectureVariant {
    pub kind: ModelKind,
    pub layout: LayerLayout,
}

impl ArchitectureVariant {
    /// Number of local experts per layer (0 for dense layouts)
    pub fn num_local_experts(&self) -> usize {
        match self.layout {
            LayerLayout::MoeFused { num_local_experts } => num_local_experts,
            _ => 0,
        }
    }
}

impl fmt::Display for ArchitectureVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.layout {
            LayerLayout::DenseReference => write!(f, "{}/dense-local", self.kind),
            LayerLayout::DenseFused => write!(f, "{}/dense-te", self.kind),
            LayerLayout::MoeFused { num_local_experts } => {
                write!(f, "{}/moe-te({} local experts)", self.kind, num_local_experts)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_keys() {
        assert_eq!(ModelKind::Gpt.block_key(), "decoder");
        assert_eq!(ModelKind::Bert.block_key(), "encoder");
        assert!(ModelKind::Bert.is_encoder());
        assert!(!ModelKind::Gpt.is_encoder());
    }

    #[test]
    fn test_model_kind_serde_names() {
        let json = serde_json::to_string(&ModelKind::Gpt).unwrap();
        assert_eq!(json, "\"GPT\"");
        let kind: ModelKind = serde_json::from_str("\"BERT\"").unwrap();
        assert_eq!(kind, ModelKind::Bert);
        let imp: TransformerImpl = serde_json::from_str("\"transformer_engine\"").unwrap();
        assert_eq!(imp, TransformerImpl::TransformerEngine);
    }

    #[test]
    fn test_model_kind_from_str() {
        assert_eq!("gpt".parse::<ModelKind>().unwrap(), ModelKind::Gpt);
        assert_eq!("BERT".parse::<ModelKind>().unwrap(), ModelKind::Bert);
        assert!("t5".parse::<ModelKind>().is_err());
    }
}
