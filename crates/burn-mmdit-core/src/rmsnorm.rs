//! Root Mean Square Layer Normalization
//!
//! Provides RMSNorm, the cheaper alternative to LayerNorm selectable for the
//! joint blocks and for per-head q/k normalization.

use burn::module::Param;
use burn::prelude::*;

/// Scales `x` by the reciprocal RMS of its last dimension
///
/// ```text
/// y = x / sqrt(mean(x^2) + eps)
/// ```
pub fn rms_norm<B: Backend, const D: usize>(x: Tensor<B, D>, eps: f64) -> Tensor<B, D> {
    let last_dim = D - 1;
    let mean_sq = (x.clone() * x.clone()).mean_dim(last_dim);
    x / (mean_sq + eps).sqrt()
}

/// Root Mean Square Layer Normalization
///
/// Unlike LayerNorm, RMSNorm does not subtract the mean or apply a bias.
///
/// # Formula
///
/// For input x with last dimension of size D:
/// ```text
/// y = x / sqrt(mean(x^2) + eps) * weight
/// ```
///
/// # References
///
/// - [Root Mean Square Layer Normalization](https://arxiv.org/abs/1910.07467)
#[derive(Module, Debug)]
pub struct RmsNorm<B: Backend> {
    /// Learned scale, absent for the non-affine variant
    pub weight: Option<Param<Tensor<B, 1>>>,
    pub eps: f64,
}

impl<B: Backend> RmsNorm<B> {
    /// Creates a new RMSNorm module with a learnable scale
    ///
    /// # Arguments
    ///
    /// * `size` - Size of the normalized dimension (last dimension)
    /// * `eps` - Small constant for numerical stability
    /// * `device` - Device to create tensors on
    pub fn new(size: usize, eps: f64, device: &B::Device) -> Self {
        Self {
            weight: Some(Param::from_tensor(Tensor::ones([size], device))),
            eps,
        }
    }

    /// Creates RMSNorm without a learnable scale
    pub fn no_affine(eps: f64) -> Self {
        Self { weight: None, eps }
    }

    /// Applies RMS normalization to the input tensor
    ///
    /// # Arguments
    ///
    /// * `x` - Input tensor of any dimensionality
    ///
    /// # Returns
    ///
    /// Normalized tensor with same shape as input
    pub fn forward<const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        let x_norm = rms_norm(x, self.eps);
        match &self.weight {
            Some(weight) => x_norm * weight.val().unsqueeze(),
            None => x_norm,
        }
    }
}
