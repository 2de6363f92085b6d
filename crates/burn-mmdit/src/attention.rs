//! Per-stream attention projections
//!
//! Each stream owns its `qkv` and output projections; the attention itself
//! runs once over both streams in [`crate::block::JointBlock`].

use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;

use burn_mmdit_core::layernorm::LayerNorm;
use burn_mmdit_core::rmsnorm::RmsNorm;

use crate::config::QkNorm;

const QK_NORM_EPS: f64 = 1e-6;

/// Learnable per-head normalization of queries or keys
#[derive(Module, Debug)]
pub enum HeadNorm<B: Backend> {
    Rms(RmsNorm<B>),
    Layer(LayerNorm<B>),
}

impl<B: Backend> HeadNorm<B> {
    pub fn new(kind: QkNorm, head_dim: usize, device: &B::Device) -> Option<Self> {
        match kind {
            QkNorm::None => None,
            QkNorm::Rms => Some(Self::Rms(RmsNorm::new(head_dim, QK_NORM_EPS, device))),
            QkNorm::Layer => Some(Self::Layer(LayerNorm::new(head_dim, QK_NORM_EPS, device))),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        match self {
            Self::Rms(norm) => norm.forward(x),
            Self::Layer(norm) => norm.forward(x),
        }
    }
}

/// Query/key/value projection and output projection of one stream
#[derive(Module, Debug)]
pub struct SelfAttention<B: Backend> {
    pub qkv: Linear<B>,
    /// Absent when the stream's output is discarded (pre-only)
    pub proj: Option<Linear<B>>,
    pub ln_q: Option<HeadNorm<B>>,
    pub ln_k: Option<HeadNorm<B>>,
    pub num_heads: usize,
}

impl<B: Backend> SelfAttention<B> {
    pub fn new(
        dim: usize,
        num_heads: usize,
        qkv_bias: bool,
        pre_only: bool,
        qk_norm: QkNorm,
        device: &B::Device,
    ) -> Self {
        assert!(dim % num_heads == 0, "width {dim} not divisible by {num_heads} heads");
        let head_dim = dim / num_heads;

        Self {
            qkv: LinearConfig::new(dim, dim * 3)
                .with_bias(qkv_bias)
                .init(device),
            proj: (!pre_only).then(|| LinearConfig::new(dim, dim).with_bias(true).init(device)),
            ln_q: HeadNorm::new(qk_norm, head_dim, device),
            ln_k: HeadNorm::new(qk_norm, head_dim, device),
            num_heads,
        }
    }

    /// Projects `x` `[batch, len, dim]` to `(q, k, v)`, each `[batch, len, dim]`
    ///
    /// Queries and keys are normalized per head when q/k norm is enabled.
    pub fn pre_attention(&self, x: Tensor<B, 3>) -> (Tensor<B, 3>, Tensor<B, 3>, Tensor<B, 3>) {
        let [batch, len, dim] = x.dims();
        let head_dim = dim / self.num_heads;

        let qkv = self.qkv.forward(x);
        let q = qkv.clone().slice([0..batch, 0..len, 0..dim]);
        let k = qkv.clone().slice([0..batch, 0..len, dim..2 * dim]);
        let v = qkv.slice([0..batch, 0..len, 2 * dim..3 * dim]);

        let per_head = |t: Tensor<B, 3>, norm: &Option<HeadNorm<B>>| match norm {
            Some(norm) => norm
                .forward(t.reshape([batch, len, self.num_heads, head_dim]))
                .reshape([batch, len, dim]),
            None => t,
        };

        (per_head(q, &self.ln_q), per_head(k, &self.ln_k), v)
    }

    /// Output projection of the attended sequence
    ///
    /// # Panics
    ///
    /// On a pre-only stream, which has no output projection.
    pub fn post_attention(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        match &self.proj {
            Some(proj) => proj.forward(x),
            None => panic!("post_attention called on a pre-only stream"),
        }
    }
}
