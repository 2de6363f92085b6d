//! Gated Linear Unit feed-forward
//!
//! Provides the SwiGLU FFN used by joint blocks configured for gated
//! feed-forward. One part of the input is gated by the SiLU of another.

use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::silu;

/// SwiGLU Feed-Forward Network
///
/// Uses SiLU (Swish) as the gating activation.
///
/// # Architecture
///
/// ```text
/// output = down_proj(SiLU(gate_proj(x)) * up_proj(x))
/// ```
///
/// # References
///
/// - [GLU Variants Improve Transformer](https://arxiv.org/abs/2002.05202)
#[derive(Module, Debug)]
pub struct SwiGluFfn<B: Backend> {
    /// Gate projection (for gating activation)
    pub gate_proj: Linear<B>,
    /// Up projection
    pub up_proj: Linear<B>,
    /// Down projection
    pub down_proj: Linear<B>,
}

/// Configuration for SwiGluFfn
pub struct SwiGluFfnConfig {
    /// Input/output dimension
    pub hidden_size: usize,
    /// Intermediate (expanded) dimension
    pub intermediate_size: usize,
    /// Whether to use bias in linear layers
    pub bias: bool,
}

impl SwiGluFfnConfig {
    /// Creates a new config (no bias)
    pub fn new(hidden_size: usize, intermediate_size: usize) -> Self {
        Self {
            hidden_size,
            intermediate_size,
            bias: false,
        }
    }

    /// Sizes the intermediate dimension from a nominal MLP width
    ///
    /// Takes two thirds of `mlp_hidden` (keeping the parameter count of a
    /// two-layer MLP) and rounds up to a multiple of `multiple_of`.
    pub fn from_mlp_hidden(hidden_size: usize, mlp_hidden: usize, multiple_of: usize) -> Self {
        Self::new(
            hidden_size,
            swiglu_intermediate_size(mlp_hidden, multiple_of),
        )
    }

    /// Initializes the SwiGluFfn module
    pub fn init<B: Backend>(&self, device: &B::Device) -> SwiGluFfn<B> {
        let gate_config =
            LinearConfig::new(self.hidden_size, self.intermediate_size).with_bias(self.bias);
        let up_config =
            LinearConfig::new(self.hidden_size, self.intermediate_size).with_bias(self.bias);
        let down_config =
            LinearConfig::new(self.intermediate_size, self.hidden_size).with_bias(self.bias);

        SwiGluFfn {
            gate_proj: gate_config.init(device),
            up_proj: up_config.init(device),
            down_proj: down_config.init(device),
        }
    }
}

/// `multiple_of * ceil(floor(2 * mlp_hidden / 3) / multiple_of)`
pub fn swiglu_intermediate_size(mlp_hidden: usize, multiple_of: usize) -> usize {
    let hidden = 2 * mlp_hidden / 3;
    multiple_of * hidden.div_ceil(multiple_of)
}

impl<B: Backend> SwiGluFfn<B> {
    /// Applies the SwiGLU feed-forward network
    ///
    /// # Arguments
    ///
    /// * `x` - Input tensor of shape [batch, seq_len, hidden_size]
    ///
    /// # Returns
    ///
    /// Output tensor of shape [batch, seq_len, hidden_size]
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let gate = silu(self.gate_proj.forward(x.clone()));
        let up = self.up_proj.forward(x);
        self.down_proj.forward(gate * up)
    }
}
