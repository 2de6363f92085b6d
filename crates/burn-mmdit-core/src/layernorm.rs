//! Layer normalization implementation
//!
//! Provides layer normalization as used in transformer architectures.
//! Normalizes across the last dimension of the input tensor.

use burn::module::Param;
use burn::prelude::*;

/// Normalizes `x` over its last dimension without any affine transform
///
/// Uses the biased variance, matching PyTorch's `nn.LayerNorm`.
///
/// ```text
/// y = (x - mean(x)) / sqrt(var(x) + eps)
/// ```
pub fn layer_norm<B: Backend, const D: usize>(x: Tensor<B, D>, eps: f64) -> Tensor<B, D> {
    let last_dim = D - 1;
    let mean = x.clone().mean_dim(last_dim);
    let centered = x - mean;
    let var = (centered.clone() * centered.clone()).mean_dim(last_dim);

    centered / (var + eps).sqrt()
}

/// Layer normalization module
///
/// Normalizes inputs across the last dimension, then optionally applies a
/// learned affine transformation (scale and shift). The joint blocks use the
/// non-affine form; per-head q/k normalization uses the affine one.
///
/// # Formula
///
/// For input x with last dimension of size D:
/// ```text
/// y = (x - mean(x)) / sqrt(var(x) + eps) * weight + bias
/// ```
#[derive(Module, Debug)]
pub struct LayerNorm<B: Backend> {
    /// Scale parameter
    pub weight: Option<Param<Tensor<B, 1>>>,
    /// Shift parameter
    pub bias: Option<Param<Tensor<B, 1>>>,
    /// Epsilon for numerical stability
    pub eps: f64,
}

impl<B: Backend> LayerNorm<B> {
    /// Creates a new affine layer normalization module
    ///
    /// # Arguments
    ///
    /// * `size` - Size of the normalized dimension (last dimension)
    /// * `eps` - Small constant for numerical stability
    /// * `device` - Device to create tensors on
    pub fn new(size: usize, eps: f64, device: &B::Device) -> Self {
        Self {
            weight: Some(Param::from_tensor(Tensor::ones([size], device))),
            bias: Some(Param::from_tensor(Tensor::zeros([size], device))),
            eps,
        }
    }

    /// Creates a layer norm without learnable scale or shift
    pub fn no_affine(eps: f64) -> Self {
        Self {
            weight: None,
            bias: None,
            eps,
        }
    }

    /// Creates layer norm from pre-loaded weight and bias
    pub fn from_weight_bias(weight: Tensor<B, 1>, bias: Option<Tensor<B, 1>>, eps: f64) -> Self {
        Self {
            weight: Some(Param::from_tensor(weight)),
            bias: bias.map(Param::from_tensor),
            eps,
        }
    }

    /// Applies layer normalization to the input tensor
    ///
    /// # Arguments
    ///
    /// * `x` - Input tensor of any dimensionality
    ///
    /// # Returns
    ///
    /// Normalized tensor with same shape as input
    pub fn forward<const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        let x_norm = layer_norm(x, self.eps);

        let x_norm = match &self.weight {
            Some(weight) => x_norm * weight.val().unsqueeze(),
            None => x_norm,
        };
        match &self.bias {
            Some(bias) => x_norm + bias.val().unsqueeze(),
            None => x_norm,
        }
    }
}
