//! Logical parameter roles and the merge rule each one declares

use std::fmt;

/// How tensor-parallel copies of a role are combined
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeRule {
    /// Split along the output-feature axis; concatenate along axis 0
    RowParallel,
    /// Split along the input-feature axis; concatenate along axis 1
    ColumnParallel,
    /// Identical on every rank; keep the rank-0 copy
    Replicated,
}

/// Architecture-independent name of one per-layer parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LayerRole {
    SelfAttnNormWeight,
    SelfAttnNormBias,
    SelfAttnQkvWeight,
    SelfAttnQkvBias,
    SelfAttnProjWeight,
    SelfAttnProjBias,
    SelfAttnQLayernormWeight,
    SelfAttnQLayernormBias,
    SelfAttnKLayernormWeight,
    SelfAttnKLayernormBias,
    MlpNormWeight,
    MlpNormBias,
    MlpFc1Weight,
    MlpFc1Bias,
    MlpFc2Weight,
    MlpFc2Bias,
    MlpXieluAlphaP,
    MlpXieluAlphaN,
    RouterWeight,
    ExpertFc1Weight(usize),
    ExpertFc2Weight(usize),
    ExpertXieluAlphaP(usize),
    ExpertXieluAlphaN(usize),
}

impl LayerRole {
    /// Stable string key, e.g. `self_attn_qkv_weight` or `mlp_fc1_weight.3`
    pub fn key(&self) -> String {
        match self {
            LayerRole::SelfAttnNormWeight => "self_attn_norm_weight".into(),
            LayerRole::SelfAttnNormBias => "self_attn_norm_bias".into(),
            LayerRole::SelfAttnQkvWeight => "self_attn_qkv_weight".into(),
            LayerRole::SelfAttnQkvBias => "self_attn_qkv_bias".into(),
            LayerRole::SelfAttnProjWeight => "self_attn_proj_weight".into(),
            LayerRole::SelfAttnProjBias => "self_attn_proj_bias".into(),
            LayerRole::SelfAttnQLayernormWeight => "self_attn_q_layernorm_weight".into(),
            LayerRole::SelfAttnQLayernormBias => "self_attn_q_layernorm_bias".into(),
            LayerRole::SelfAttnKLayernormWeight => "self_attn_k_layernorm_weight".into(),
            LayerRole::SelfAttnKLayernormBias => "self_attn_k_layernorm_bias".into(),
            LayerRole::MlpNormWeight => "mlp_norm_weight".into(),
            LayerRole::MlpNormBias => "mlp_norm_bias".into(),
            LayerRole::MlpFc1Weight => "mlp_fc1_weight".into(),
            LayerRole::MlpFc1Bias => "mlp_fc1_bias".into(),
            LayerRole::MlpFc2Weight => "mlp_fc2_weight".into(),
            LayerRole::MlpFc2Bias => "mlp_fc2_bias".into(),
            LayerRole::MlpXieluAlphaP => "mlp_xielu_alpha_p".into(),
            LayerRole::MlpXieluAlphaN => "mlp_xielu_alpha_n".into(),
            LayerRole::RouterWeight => "router_weight".into(),
            LayerRole::ExpertFc1Weight(i) => format!("mlp_fc1_weight.{}", i),
            LayerRole::ExpertFc2Weight(i) => format!("mlp_fc2_weight.{}", i),
            LayerRole::ExpertXieluAlphaP(i) => format!("mlp_xielu_alpha_p.{}", i),
            LayerRole::ExpertXieluAlphaN(i) => format!("mlp_xielu_alpha_n.{}", i),
        }
    }

    /// Merge rule declared for this role
    pub fn merge_rule(&self) -> MergeRule {
        match self {
            LayerRole::SelfAttnQkvWeight
            | LayerRole::SelfAttnQkvBias
            | LayerRole::MlpFc1Weight
            | LayerRole::MlpFc1Bias
            | LayerRole::ExpertFc1Weight(_) => MergeRule::RowParallel,
            LayerRole::SelfAttnProjWeight
            | LayerRole::MlpFc2Weight
            | LayerRole::ExpertFc2Weight(_) => MergeRule::ColumnParallel,
            _ => MergeRule::Replicated,
        }
    }

    /// Whether the role holds a combined gate/value projection when the MLP
    /// uses a gated activation
    pub fn is_gated_projection(&self) -> bool {
        matches!(
            self,
            LayerRole::MlpFc1Weight | LayerRole::MlpFc1Bias | LayerRole::ExpertFc1Weight(_)
        )
    }
}

impl fmt::Display for LayerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Non-layer parts of the model
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Section {
    Embeddings,
    FinalNorm,
    OutputLayer,
    Pooler,
    LmHead,
    BinaryHead,
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Section::Embeddings => "embeddings",
            Section::FinalNorm => "final_norm",
            Section::OutputLayer => "output_layer",
            Section::Pooler => "pooler",
            Section::LmHead => "lm_head",
            Section::BinaryHead => "binary_head",
        };
        f.write_str(name)
    }
}
