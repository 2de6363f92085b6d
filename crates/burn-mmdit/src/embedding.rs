//! Conditioning and positional embedders
//!
//! - [`TimestepEmbedder`] turns quantized timesteps into the base of `c`
//! - [`ClassEmbedder`] adds either a label embedding or a projected vector
//! - [`PositionEmbedder`] holds the fixed image and context position tables

use burn::nn::{Embedding, EmbeddingConfig, Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::silu;

use burn_mmdit_core::sincos::{sincos_1d_table, sincos_2d_table, timestep_embedding};

use crate::config::{ClassConditioning, Pooling, PositionTableInit};

/// Number of discrete diffusion steps timesteps are quantized to
pub const NUM_TIMESTEPS: usize = 1000;

/// Maps continuous timesteps in `[0, 1]` to integer steps
///
/// `floor(t * 1000)` clamped to `[0, 999]`; out-of-range inputs are clamped,
/// never rejected.
pub fn quantize_timesteps<B: Backend>(t: Tensor<B, 1>) -> Tensor<B, 1, Int> {
    (t * NUM_TIMESTEPS as f64)
        .floor()
        .clamp(0.0, (NUM_TIMESTEPS - 1) as f64)
        .int()
}

/// Linear → SiLU → Linear
///
/// Shared by the timestep and vector embedders.
#[derive(Module, Debug)]
pub struct EmbedMlp<B: Backend> {
    pub linear1: Linear<B>,
    pub linear2: Linear<B>,
}

impl<B: Backend> EmbedMlp<B> {
    pub fn new(in_dim: usize, hidden_size: usize, device: &B::Device) -> Self {
        Self {
            linear1: LinearConfig::new(in_dim, hidden_size)
                .with_bias(true)
                .init(device),
            linear2: LinearConfig::new(hidden_size, hidden_size)
                .with_bias(true)
                .init(device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        self.linear2.forward(silu(self.linear1.forward(x)))
    }
}

/// Embeds integer timesteps into `[batch, hidden]`
#[derive(Module, Debug)]
pub struct TimestepEmbedder<B: Backend> {
    pub mlp: EmbedMlp<B>,
    /// Width of the sinusoidal frequency embedding
    pub frequency_embedding_size: usize,
}

impl<B: Backend> TimestepEmbedder<B> {
    pub fn new(hidden_size: usize, frequency_embedding_size: usize, device: &B::Device) -> Self {
        Self {
            mlp: EmbedMlp::new(frequency_embedding_size, hidden_size, device),
            frequency_embedding_size,
        }
    }

    pub fn forward(&self, t: Tensor<B, 1, Int>) -> Tensor<B, 2> {
        let freq = timestep_embedding(t.float(), self.frequency_embedding_size, 10000.0);
        self.mlp.forward(freq)
    }
}

/// Class-label lookup with a reserved null row for dropped labels
///
/// The table has `num_classes + 1` rows when label dropout is enabled; the
/// last row is the "no label" embedding used for classifier-free guidance.
#[derive(Module, Debug)]
pub struct LabelEmbedder<B: Backend> {
    pub embedding_table: Embedding<B>,
    pub num_classes: usize,
    pub dropout_prob: f64,
}

impl<B: Backend> LabelEmbedder<B> {
    pub fn new(num_classes: usize, hidden_size: usize, dropout_prob: f64, device: &B::Device) -> Self {
        let rows = num_classes + usize::from(dropout_prob > 0.0);
        Self {
            embedding_table: EmbeddingConfig::new(rows, hidden_size).init(device),
            num_classes,
            dropout_prob,
        }
    }

    /// Whether the table carries the null-label row
    pub fn has_null_row(&self) -> bool {
        self.embedding_table.weight.val().dims()[0] > self.num_classes
    }

    /// Embeds `labels` `[batch]`, replacing `dropped` elements by the null label
    pub fn forward(&self, labels: Tensor<B, 1, Int>, dropped: Option<Tensor<B, 1, Bool>>) -> Tensor<B, 2> {
        let [batch] = labels.dims();
        let labels = match dropped {
            Some(dropped) => {
                assert!(
                    self.has_null_row(),
                    "label dropout requested but the embedding table has no null row"
                );
                labels.mask_fill(dropped, self.num_classes as i64)
            }
            None => labels,
        };

        let embedded = self.embedding_table.forward(labels.reshape([batch, 1]));
        let [_, _, hidden] = embedded.dims();
        embedded.reshape([batch, hidden])
    }
}

/// Projects a pooled conditioning vector into the hidden width
#[derive(Module, Debug)]
pub struct VectorEmbedder<B: Backend> {
    pub mlp: EmbedMlp<B>,
}

impl<B: Backend> VectorEmbedder<B> {
    pub fn new(input_dim: usize, hidden_size: usize, device: &B::Device) -> Self {
        Self {
            mlp: EmbedMlp::new(input_dim, hidden_size, device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        self.mlp.forward(x)
    }
}

/// The class-conditioning path, chosen by configuration
#[derive(Module, Debug)]
pub enum ClassEmbedder<B: Backend> {
    Label(LabelEmbedder<B>),
    Vector(VectorEmbedder<B>),
}

impl<B: Backend> ClassEmbedder<B> {
    pub fn new(
        conditioning: &ClassConditioning,
        hidden_size: usize,
        dropout_prob: f64,
        device: &B::Device,
    ) -> Self {
        match *conditioning {
            ClassConditioning::Label { num_classes } => {
                Self::Label(LabelEmbedder::new(num_classes, hidden_size, dropout_prob, device))
            }
            ClassConditioning::Vector { input_dim } => {
                Self::Vector(VectorEmbedder::new(input_dim, hidden_size, device))
            }
        }
    }

    /// Embeds labels; panics if this is the vector path
    pub fn embed_labels(&self, labels: Tensor<B, 1, Int>, dropped: Option<Tensor<B, 1, Bool>>) -> Tensor<B, 2> {
        match self {
            Self::Label(embedder) => embedder.forward(labels, dropped),
            Self::Vector(_) => panic!("model expects pooled vectors, got class labels"),
        }
    }

    /// Embeds a pooled vector; panics if this is the label path
    pub fn embed_vector(&self, pooled: Tensor<B, 2>) -> Tensor<B, 2> {
        match self {
            Self::Vector(embedder) => embedder.forward(pooled),
            Self::Label(_) => panic!("model expects class labels, got a pooled vector"),
        }
    }
}

/// Derives a pooled vector `[batch, dim]` from a raw sequence `[batch, len, dim]`
///
/// `valid` marks real tokens; `None` treats every token as valid. `Last`
/// picks the token at `valid.sum() - 1`, `Mean` averages valid tokens. An
/// element with no valid token pools to token 0 (`Last`) or zeros (`Mean`).
pub fn pool<B: Backend>(
    pooling: Pooling,
    states: Tensor<B, 3>,
    valid: Option<Tensor<B, 2, Bool>>,
) -> Tensor<B, 2> {
    let [batch, len, dim] = states.dims();
    let device = states.device();
    let valid = valid.unwrap_or_else(|| Tensor::<B, 2, Int>::ones([batch, len], &device).bool());
    assert_eq!(valid.dims(), [batch, len], "pooling mask does not match the sequence");

    match pooling {
        Pooling::Last => {
            let index = (valid.int().sum_dim(1) - 1).clamp_min(0);
            states
                .gather(1, index.reshape([batch, 1, 1]).repeat_dim(2, dim))
                .reshape([batch, dim])
        }
        Pooling::Mean => {
            let weights = valid.float().reshape([batch, len, 1]);
            let count = weights.clone().sum_dim(1).clamp_min(1.0);
            (states * weights).sum_dim(1).div(count).reshape([batch, dim])
        }
    }
}

/// Fixed positional tables for the image and context streams
///
/// Neither table is trainable. The image table covers a
/// `max_size × max_size` patch grid and is centre-cropped to the input
/// resolution; the context table is added to every context sequence.
#[derive(Module, Debug)]
pub struct PositionEmbedder<B: Backend> {
    /// `[1, max_size * max_size, hidden]`
    pub table: Tensor<B, 3>,
    /// `[1, context_len, hidden]`
    pub context_table: Tensor<B, 3>,
    pub max_size: usize,
    pub patch_size: usize,
}

impl<B: Backend> PositionEmbedder<B> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        hidden_size: usize,
        max_size: usize,
        patch_size: usize,
        context_len: usize,
        init: PositionTableInit,
        scaling: Option<f64>,
        offset: Option<f64>,
        device: &B::Device,
    ) -> Self {
        let table = match init {
            PositionTableInit::SinCos => {
                sincos_2d_table(hidden_size, max_size, scaling, offset, device)
            }
            PositionTableInit::Zeros => Tensor::zeros([1, max_size * max_size, hidden_size], device),
        };

        Self {
            table,
            context_table: sincos_1d_table(hidden_size, context_len, device),
            max_size,
            patch_size,
        }
    }

    /// Replaces the image table, e.g. with one read from a checkpoint
    pub fn with_table(mut self, table: Tensor<B, 3>) -> Self {
        assert_eq!(table.dims(), self.table.dims(), "positional table shape mismatch");
        self.table = table;
        self
    }

    /// Replaces the context table
    pub fn with_context_table(mut self, table: Tensor<B, 3>) -> Self {
        assert_eq!(
            table.dims(),
            self.context_table.dims(),
            "context positional table shape mismatch"
        );
        self.context_table = table;
        self
    }

    /// Centre crop of the image table for an `height × width` input
    ///
    /// Returns `[1, (height/p) * (width/p), hidden]`.
    ///
    /// # Panics
    ///
    /// If the patch grid exceeds the table in either direction.
    pub fn cropped(&self, height: usize, width: usize) -> Tensor<B, 3> {
        let h = height / self.patch_size;
        let w = width / self.patch_size;
        let m = self.max_size;
        assert!(
            h <= m && w <= m,
            "patch grid {h}x{w} exceeds positional table {m}x{m}"
        );
        let [_, _, hidden] = self.table.dims();
        let top = (m - h) / 2;
        let left = (m - w) / 2;

        self.table
            .clone()
            .reshape([1, m, m, hidden])
            .slice([0..1, top..top + h, left..left + w, 0..hidden])
            .reshape([1, h * w, hidden])
    }

    /// Adds the context table to an embedded context sequence
    pub fn add_to_context(&self, context: Tensor<B, 3>) -> Tensor<B, 3> {
        let [_, len, hidden] = context.dims();
        let [_, table_len, table_hidden] = self.context_table.dims();
        assert!(
            len == table_len && hidden == table_hidden,
            "context [{len}, {hidden}] does not match positional table [{table_len}, {table_hidden}]"
        );
        context + self.context_table.clone()
    }
}
