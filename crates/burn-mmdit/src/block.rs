//! Joint attention blocks
//!
//! A [`JointBlock`] holds two [`StreamBlock`]s, one for the context stream
//! and one for the image stream. Both streams are modulated from the same
//! conditioning vector `c`, projected to queries/keys/values separately,
//! attended jointly over their concatenation, and finished separately.
//!
//! ```text
//! context ──norm·mod──qkv──┐                 ┌──proj·gate──mlp·gate──> context'
//!                          ├─ attention ─────┤
//! x       ──norm·mod──qkv──┘  (ctx ++ x)     └──proj·gate──mlp·gate──> x'
//! ```

use burn::module::Ignored;
use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::silu;

use burn_mmdit_core::attention::attention;
use burn_mmdit_core::glu::{SwiGluFfn, SwiGluFfnConfig};
use burn_mmdit_core::layernorm::layer_norm;
use burn_mmdit_core::mlp::{Mlp, MlpConfig};
use burn_mmdit_core::rmsnorm::rms_norm;

use crate::attention::SelfAttention;
use crate::config::{FeedForwardKind, MmditConfig, ModulationKind, NormKind, QkNorm};

const NORM_EPS: f64 = 1e-6;

/// SwiGLU intermediate widths are rounded up to this multiple
const SWIGLU_MULTIPLE_OF: usize = 256;

/// `x * (1 + scale) + shift`, broadcasting `[batch, hidden]` over the sequence
pub fn modulate<B: Backend>(
    x: Tensor<B, 3>,
    shift: Option<Tensor<B, 2>>,
    scale: Tensor<B, 2>,
) -> Tensor<B, 3> {
    let x = x * (scale.unsqueeze_dim(1) + 1.0);
    match shift {
        Some(shift) => x + shift.unsqueeze_dim(1),
        None => x,
    }
}

fn normalize<B: Backend>(kind: NormKind, x: Tensor<B, 3>) -> Tensor<B, 3> {
    match kind {
        NormKind::Layer => layer_norm(x, NORM_EPS),
        NormKind::Rms => rms_norm(x, NORM_EPS),
    }
}

/// Stream feed-forward
#[derive(Module, Debug)]
pub enum FeedForward<B: Backend> {
    Gelu(Mlp<B>),
    SwiGlu(SwiGluFfn<B>),
}

impl<B: Backend> FeedForward<B> {
    pub fn new(kind: FeedForwardKind, hidden_size: usize, mlp_hidden: usize, device: &B::Device) -> Self {
        match kind {
            FeedForwardKind::Gelu => Self::Gelu(MlpConfig::new(hidden_size, mlp_hidden).init(device)),
            FeedForwardKind::SwiGlu => Self::SwiGlu(
                SwiGluFfnConfig::from_mlp_hidden(hidden_size, mlp_hidden, SWIGLU_MULTIPLE_OF)
                    .init(device),
            ),
        }
    }

    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        match self {
            Self::Gelu(mlp) => mlp.forward(x),
            Self::SwiGlu(ffn) => ffn.forward(x),
        }
    }
}

/// Modulation of one sub-layer (attention or feed-forward)
#[derive(Debug, Clone)]
pub struct AdaLnParams<B: Backend> {
    /// Absent in scale-only mode
    pub shift: Option<Tensor<B, 2>>,
    pub scale: Tensor<B, 2>,
    /// Absent on a pre-only stream's attention stage
    pub gate: Option<Tensor<B, 2>>,
}

/// Everything a stream needs after attention to finish the block
#[derive(Debug, Clone)]
pub struct StreamResidual<B: Backend> {
    pub x: Tensor<B, 3>,
    pub gate_msa: Tensor<B, 2>,
    pub mlp: AdaLnParams<B>,
}

/// One stream of a joint block
///
/// Owns its adaLN modulation, attention projections and feed-forward. A
/// pre-only stream only contributes queries/keys/values and has no
/// output projection, gates or feed-forward.
#[derive(Module, Debug)]
pub struct StreamBlock<B: Backend> {
    pub attn: SelfAttention<B>,
    pub mlp: Option<FeedForward<B>>,
    /// `SiLU → Linear(hidden, n * hidden)`
    pub ada_ln_modulation: Linear<B>,
    pub norm: Ignored<NormKind>,
    pub modulation: Ignored<ModulationKind>,
    pub pre_only: bool,
}

/// Settings shared by every stream of a model
#[derive(Debug, Clone, Copy)]
pub struct StreamConfig {
    pub hidden_size: usize,
    pub num_heads: usize,
    pub mlp_hidden: usize,
    pub qkv_bias: bool,
    pub norm: NormKind,
    pub qk_norm: QkNorm,
    pub modulation: ModulationKind,
    pub feed_forward: FeedForwardKind,
}

impl StreamConfig {
    pub fn from_model(config: &MmditConfig) -> Self {
        Self {
            hidden_size: config.hidden_size(),
            num_heads: config.num_heads(),
            mlp_hidden: config.mlp_hidden(),
            qkv_bias: config.qkv_bias,
            norm: config.norm,
            qk_norm: config.qk_norm,
            modulation: config.modulation,
            feed_forward: config.feed_forward,
        }
    }

    pub fn init<B: Backend>(&self, pre_only: bool, device: &B::Device) -> StreamBlock<B> {
        let chunks = self.modulation.num_chunks(pre_only);
        StreamBlock {
            attn: SelfAttention::new(
                self.hidden_size,
                self.num_heads,
                self.qkv_bias,
                pre_only,
                self.qk_norm,
                device,
            ),
            mlp: (!pre_only).then(|| {
                FeedForward::new(self.feed_forward, self.hidden_size, self.mlp_hidden, device)
            }),
            ada_ln_modulation: LinearConfig::new(self.hidden_size, chunks * self.hidden_size)
                .with_bias(true)
                .init(device),
            norm: Ignored(self.norm),
            modulation: Ignored(self.modulation),
            pre_only,
        }
    }
}

impl<B: Backend> StreamBlock<B> {
    /// Splits the modulation vector into `(attention, feed-forward)` parameters
    pub fn modulation_params(&self, c: Tensor<B, 2>) -> (AdaLnParams<B>, Option<AdaLnParams<B>>) {
        let modulation = *self.modulation;
        let chunks = modulation.num_chunks(self.pre_only);
        let parts = self.ada_ln_modulation.forward(silu(c)).chunk(chunks, 1);

        match (modulation, self.pre_only, parts.as_slice()) {
            (
                ModulationKind::Full,
                false,
                [shift_msa, scale_msa, gate_msa, shift_mlp, scale_mlp, gate_mlp],
            ) => {
                let attn = AdaLnParams {
                    shift: Some(shift_msa.clone()),
                    scale: scale_msa.clone(),
                    gate: Some(gate_msa.clone()),
                };
                let mlp = AdaLnParams {
                    shift: Some(shift_mlp.clone()),
                    scale: scale_mlp.clone(),
                    gate: Some(gate_mlp.clone()),
                };
                (attn, Some(mlp))
            }
            (ModulationKind::ScaleOnly, false, [scale_msa, gate_msa, scale_mlp, gate_mlp]) => {
                let attn = AdaLnParams {
                    shift: None,
                    scale: scale_msa.clone(),
                    gate: Some(gate_msa.clone()),
                };
                let mlp = AdaLnParams {
                    shift: None,
                    scale: scale_mlp.clone(),
                    gate: Some(gate_mlp.clone()),
                };
                (attn, Some(mlp))
            }
            (ModulationKind::Full, true, [shift, scale]) => (
                AdaLnParams { shift: Some(shift.clone()), scale: scale.clone(), gate: None },
                None,
            ),
            (ModulationKind::ScaleOnly, true, [scale]) => {
                (AdaLnParams { shift: None, scale: scale.clone(), gate: None }, None)
            }
            (_, _, parts) => panic!(
                "{modulation:?} modulation produced {} chunks, expected {chunks}",
                parts.len()
            ),
        }
    }

    /// Normalizes, modulates and projects `x` to `(q, k, v)`
    ///
    /// Also returns what [`Self::post_attention`] needs, or `None` for a
    /// pre-only stream.
    #[allow(clippy::type_complexity)]
    pub fn pre_attention(
        &self,
        x: Tensor<B, 3>,
        c: Tensor<B, 2>,
    ) -> ((Tensor<B, 3>, Tensor<B, 3>, Tensor<B, 3>), Option<StreamResidual<B>>) {
        let (attn, mlp) = self.modulation_params(c);
        let normed = modulate(normalize(*self.norm, x.clone()), attn.shift, attn.scale);
        let qkv = self.attn.pre_attention(normed);

        let residual = match (attn.gate, mlp) {
            (Some(gate_msa), Some(mlp)) => Some(StreamResidual { x, gate_msa, mlp }),
            _ => None,
        };
        (qkv, residual)
    }

    /// Gated residual attention output, then the gated residual feed-forward
    pub fn post_attention(&self, attn: Tensor<B, 3>, residual: StreamResidual<B>) -> Tensor<B, 3> {
        let StreamResidual { x, gate_msa, mlp: params } = residual;
        let mlp = match &self.mlp {
            Some(mlp) => mlp,
            None => panic!("post_attention called on a pre-only stream"),
        };
        let gate_mlp = match params.gate {
            Some(gate) => gate,
            None => panic!("feed-forward modulation has no gate"),
        };

        let x = x + gate_msa.unsqueeze_dim(1) * self.attn.post_attention(attn);
        let ff = mlp.forward(modulate(normalize(*self.norm, x.clone()), params.shift, params.scale));
        x + gate_mlp.unsqueeze_dim(1) * ff
    }
}

/// Dual-stream block with one joint attention over `context ++ x`
#[derive(Module, Debug)]
pub struct JointBlock<B: Backend> {
    pub context_block: StreamBlock<B>,
    pub x_block: StreamBlock<B>,
}

impl<B: Backend> JointBlock<B> {
    /// Creates a block; `pre_only` makes the context stream output-free
    pub fn new(config: &StreamConfig, pre_only: bool, device: &B::Device) -> Self {
        Self {
            context_block: config.init(pre_only, device),
            x_block: config.init(false, device),
        }
    }

    pub fn is_pre_only(&self) -> bool {
        self.context_block.pre_only
    }

    /// Runs both streams through one masked joint attention
    ///
    /// # Arguments
    ///
    /// * `context` - Context tokens `[batch, ctx_len, hidden]`
    /// * `x` - Image tokens `[batch, x_len, hidden]`
    /// * `c` - Conditioning vector `[batch, hidden]`
    /// * `mask` - `[batch, 1, ctx_len + x_len, ctx_len + x_len]`, true = attend
    ///
    /// # Returns
    ///
    /// `(context', x')`, with `context'` absent when the context stream is
    /// pre-only.
    pub fn forward(
        &self,
        context: Tensor<B, 3>,
        x: Tensor<B, 3>,
        c: Tensor<B, 2>,
        mask: Option<Tensor<B, 4, Bool>>,
    ) -> (Option<Tensor<B, 3>>, Tensor<B, 3>) {
        let [batch, ctx_len, hidden] = context.dims();
        let [x_batch, x_len, x_hidden] = x.dims();
        assert!(
            batch == x_batch && hidden == x_hidden,
            "context [{batch}, {ctx_len}, {hidden}] and image [{x_batch}, {x_len}, {x_hidden}] streams disagree"
        );

        let ((cq, ck, cv), context_residual) = self.context_block.pre_attention(context, c.clone());
        let ((xq, xk, xv), x_residual) = self.x_block.pre_attention(x, c);

        let q = Tensor::cat(vec![cq, xq], 1);
        let k = Tensor::cat(vec![ck, xk], 1);
        let v = Tensor::cat(vec![cv, xv], 1);
        let attn = attention(q, k, v, self.x_block.attn.num_heads, mask);

        let total = ctx_len + x_len;
        let context_attn = attn.clone().slice([0..batch, 0..ctx_len, 0..hidden]);
        let x_attn = attn.slice([0..batch, ctx_len..total, 0..hidden]);

        let context = context_residual
            .map(|residual| self.context_block.post_attention(context_attn, residual));
        let x = match x_residual {
            Some(residual) => self.x_block.post_attention(x_attn, residual),
            None => panic!("image stream of a joint block is pre-only"),
        };

        (context, x)
    }
}
