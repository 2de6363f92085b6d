//! Model configuration
//!
//! Every architectural switch is fixed when the model is built. The hidden
//! width is tied to the depth: `hidden = 64 * depth` with `depth` heads, so
//! each head is 64 wide.

use serde::{Deserialize, Serialize};

use crate::error::MmditError;

/// Width of one attention head
pub const HEAD_DIM: usize = 64;

/// Normalization applied before modulation in each stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormKind {
    /// LayerNorm without affine parameters
    #[default]
    Layer,
    /// RMSNorm without a learned scale
    Rms,
}

/// Optional per-head normalization of queries and keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QkNorm {
    #[default]
    None,
    Rms,
    Layer,
}

/// Layout of the adaLN modulation vector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModulationKind {
    /// `(shift, scale, gate)` per sub-layer
    #[default]
    Full,
    /// `(scale, gate)` per sub-layer, no shift
    ScaleOnly,
}

impl ModulationKind {
    /// Number of `hidden`-wide chunks the modulation linear produces
    pub fn num_chunks(self, pre_only: bool) -> usize {
        match (self, pre_only) {
            (ModulationKind::Full, false) => 6,
            (ModulationKind::Full, true) => 2,
            (ModulationKind::ScaleOnly, false) => 4,
            (ModulationKind::ScaleOnly, true) => 1,
        }
    }
}

/// Feed-forward flavour of each stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedForwardKind {
    /// `fc2(gelu_tanh(fc1(x)))`
    #[default]
    Gelu,
    /// SwiGLU sized to two thirds of the MLP width, rounded up to 256
    SwiGlu,
}

/// How the pooled class vector is derived from the raw context sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pooling {
    /// The last valid token
    Last,
    /// The mean over valid tokens
    Mean,
}

/// Initial contents of the image positional table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionTableInit {
    /// Fixed 2D sine/cosine table
    #[default]
    SinCos,
    /// Zeros, expected to be overwritten from a checkpoint
    Zeros,
}

/// Class-conditioning path selected at construction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClassConditioning {
    /// Integer labels looked up in an embedding table
    Label { num_classes: usize },
    /// A pooled vector projected by a two-layer MLP
    Vector { input_dim: usize },
}

/// MMDiT configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MmditConfig {
    /// Patch edge length
    pub patch_size: usize,
    /// Latent channels
    pub in_channels: usize,
    /// Output channels, derived from `in_channels` and `learn_sigma` if unset
    #[serde(default)]
    pub out_channels: Option<usize>,
    /// Predict a variance alongside the mean (doubles the output channels)
    #[serde(default)]
    pub learn_sigma: bool,
    /// Number of joint blocks
    pub depth: usize,
    /// MLP width as a multiple of the hidden width
    pub mlp_ratio: f64,
    pub class_conditioning: ClassConditioning,
    /// Derive the class vector from the context instead of taking it as input
    #[serde(default)]
    pub pooling: Option<Pooling>,
    /// Width of the raw context; `None` means it already has the hidden width
    #[serde(default)]
    pub context_dim: Option<usize>,
    /// Fixed context sequence length
    pub context_len: usize,
    /// Learned tokens prepended to the context stream
    #[serde(default)]
    pub register_length: usize,
    /// Edge length of the image positional table, in patches
    pub pos_embed_max_size: usize,
    #[serde(default)]
    pub pos_embed_scaling_factor: Option<f64>,
    #[serde(default)]
    pub pos_embed_offset: Option<f64>,
    #[serde(default)]
    pub pos_embed_init: PositionTableInit,
    #[serde(default)]
    pub norm: NormKind,
    #[serde(default)]
    pub qk_norm: QkNorm,
    #[serde(default)]
    pub modulation: ModulationKind,
    #[serde(default)]
    pub feed_forward: FeedForwardKind,
    #[serde(default = "default_true")]
    pub qkv_bias: bool,
    /// Probability of swapping an element's conditioning for the
    /// unconditional substitutes during training
    #[serde(default)]
    pub class_dropout_prob: f64,
    #[serde(default = "default_frequency_embedding_size")]
    pub frequency_embedding_size: usize,
}

fn default_true() -> bool {
    true
}

fn default_frequency_embedding_size() -> usize {
    256
}

impl MmditConfig {
    /// SD3-Medium layout (depth 24, 1536 wide)
    pub fn sd3_medium() -> Self {
        Self {
            patch_size: 2,
            in_channels: 16,
            out_channels: None,
            learn_sigma: false,
            depth: 24,
            mlp_ratio: 4.0,
            class_conditioning: ClassConditioning::Vector { input_dim: 2048 },
            pooling: None,
            context_dim: Some(4096),
            context_len: 154,
            register_length: 0,
            pos_embed_max_size: 192,
            pos_embed_scaling_factor: None,
            pos_embed_offset: None,
            pos_embed_init: PositionTableInit::Zeros,
            norm: NormKind::Layer,
            qk_norm: QkNorm::None,
            modulation: ModulationKind::Full,
            feed_forward: FeedForwardKind::Gelu,
            qkv_bias: true,
            class_dropout_prob: 0.0,
            frequency_embedding_size: 256,
        }
    }

    /// SD3.5-Large layout (depth 38, RMS q/k norm)
    pub fn sd3_5_large() -> Self {
        Self {
            depth: 38,
            qk_norm: QkNorm::Rms,
            ..Self::sd3_medium()
        }
    }

    /// Small model for tests and smoke runs
    pub fn tiny() -> Self {
        Self {
            patch_size: 2,
            in_channels: 4,
            out_channels: None,
            learn_sigma: false,
            depth: 2,
            mlp_ratio: 4.0,
            class_conditioning: ClassConditioning::Vector { input_dim: 64 },
            pooling: None,
            context_dim: Some(64),
            context_len: 8,
            register_length: 0,
            pos_embed_max_size: 16,
            pos_embed_scaling_factor: None,
            pos_embed_offset: None,
            pos_embed_init: PositionTableInit::SinCos,
            norm: NormKind::Layer,
            qk_norm: QkNorm::None,
            modulation: ModulationKind::Full,
            feed_forward: FeedForwardKind::Gelu,
            qkv_bias: true,
            class_dropout_prob: 0.0,
            frequency_embedding_size: 256,
        }
    }

    /// Parses and validates a JSON configuration
    pub fn from_json(json: &str) -> Result<Self, MmditError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| MmditError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_class_dropout(mut self, prob: f64) -> Self {
        self.class_dropout_prob = prob;
        self
    }

    pub fn with_pooling(mut self, pooling: Pooling) -> Self {
        self.pooling = Some(pooling);
        self
    }

    pub fn hidden_size(&self) -> usize {
        HEAD_DIM * self.depth
    }

    pub fn num_heads(&self) -> usize {
        self.depth
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels.unwrap_or(if self.learn_sigma {
            self.in_channels * 2
        } else {
            self.in_channels
        })
    }

    /// Nominal feed-forward width before any SwiGLU resizing
    pub fn mlp_hidden(&self) -> usize {
        (self.hidden_size() as f64 * self.mlp_ratio) as usize
    }

    /// Width of the raw context sequence passed to `forward`
    pub fn context_in_dim(&self) -> usize {
        self.context_dim.unwrap_or(self.hidden_size())
    }

    /// Checks the cross-field constraints of the configuration
    pub fn validate(&self) -> Result<(), MmditError> {
        let invalid = |msg: String| Err(MmditError::InvalidConfig(msg));

        if self.depth == 0 {
            return invalid("depth must be at least 1".into());
        }
        if self.patch_size == 0 || self.in_channels == 0 {
            return invalid("patch_size and in_channels must be positive".into());
        }
        if self.out_channels == Some(0) {
            return invalid("out_channels must be positive".into());
        }
        if self.pos_embed_max_size == 0 {
            return invalid("pos_embed_max_size must be positive".into());
        }
        if self.context_len == 0 {
            return invalid("context_len must be positive".into());
        }
        if !(self.mlp_ratio.is_finite() && self.mlp_ratio > 0.0) {
            return invalid(format!("mlp_ratio must be positive, got {}", self.mlp_ratio));
        }
        if !(0.0..=1.0).contains(&self.class_dropout_prob) {
            return invalid(format!(
                "class_dropout_prob must be in [0, 1], got {}",
                self.class_dropout_prob
            ));
        }
        if self.frequency_embedding_size < 2 {
            return invalid("frequency_embedding_size must be at least 2".into());
        }
        if self.pos_embed_scaling_factor == Some(0.0) {
            return invalid("pos_embed_scaling_factor must be non-zero".into());
        }

        match (&self.class_conditioning, self.pooling) {
            (ClassConditioning::Label { num_classes: 0 }, _) => {
                return invalid("num_classes must be positive".into());
            }
            (ClassConditioning::Vector { input_dim }, Some(_))
                if *input_dim != self.context_in_dim() =>
            {
                return Err(MmditError::PoolingMismatch {
                    expected: self.context_in_dim(),
                    found: format!("vector input_dim {input_dim}"),
                });
            }
            (ClassConditioning::Label { .. }, Some(_)) => {
                return Err(MmditError::PoolingMismatch {
                    expected: self.context_in_dim(),
                    found: "label conditioning".into(),
                });
            }
            _ => {}
        }

        Ok(())
    }
}
