//! Patch codec
//!
//! Converts latent images to token sequences of non-overlapping `p×p`
//! patches and back. Tokens are row-major over the patch grid, and each
//! token's features are ordered `(patch_row, patch_col, channel)`.

use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;

/// Splits an image into a sequence of flattened patches
///
/// `[batch, channels, height, width]` → `[batch, (H/p)*(W/p), p*p*channels]`
///
/// # Panics
///
/// If the spatial size is not divisible by `patch_size`.
pub fn patchify<B: Backend>(image: Tensor<B, 4>, patch_size: usize) -> Tensor<B, 3> {
    let [batch, channels, height, width] = image.dims();
    assert!(
        height % patch_size == 0 && width % patch_size == 0,
        "resolution {height}x{width} is not divisible by patch size {patch_size}"
    );
    let h = height / patch_size;
    let w = width / patch_size;

    image
        .reshape([batch, channels, h, patch_size, w, patch_size])
        // [B, h, w, p_row, p_col, C]
        .permute([0, 2, 4, 3, 5, 1])
        .reshape([batch, h * w, patch_size * patch_size * channels])
}

/// Reassembles patch tokens into an image, the inverse of [`patchify`]
///
/// # Arguments
///
/// * `tokens` - `[batch, (H/p)*(W/p), p*p*channels]`
/// * `patch_size` - Patch edge length `p`
/// * `(height, width)` - Output spatial size
/// * `channels` - Output channel count
///
/// # Panics
///
/// If the token count or feature width does not match the requested image.
pub fn unpatchify<B: Backend>(
    tokens: Tensor<B, 3>,
    patch_size: usize,
    (height, width): (usize, usize),
    channels: usize,
) -> Tensor<B, 4> {
    let [batch, num_tokens, features] = tokens.dims();
    assert!(
        height % patch_size == 0 && width % patch_size == 0,
        "resolution {height}x{width} is not divisible by patch size {patch_size}"
    );
    let h = height / patch_size;
    let w = width / patch_size;
    assert_eq!(num_tokens, h * w, "token count does not match {h}x{w} grid");
    assert_eq!(
        features,
        patch_size * patch_size * channels,
        "token width does not match p*p*channels"
    );

    tokens
        .reshape([batch, h, w, patch_size, patch_size, channels])
        // [B, C, h, p_row, w, p_col]
        .permute([0, 5, 1, 3, 2, 4])
        .reshape([batch, channels, height, width])
}

/// Patch embedding: [`patchify`] followed by a learned projection
///
/// Equivalent to a strided `p×p` convolution whose kernel has been flattened
/// in `(row, col, channel)` order.
#[derive(Module, Debug)]
pub struct PatchEmbed<B: Backend> {
    /// Projection from flattened patch to hidden dim
    pub proj: Linear<B>,
    /// Patch size
    pub patch_size: usize,
    /// Number of input channels
    pub in_channels: usize,
}

/// Configuration for PatchEmbed
pub struct PatchEmbedConfig {
    /// Patch size (height = width)
    pub patch_size: usize,
    /// Number of input channels
    pub in_channels: usize,
    /// Hidden dimension
    pub hidden_size: usize,
}

impl PatchEmbedConfig {
    /// Creates a new config
    pub fn new(patch_size: usize, in_channels: usize, hidden_size: usize) -> Self {
        Self {
            patch_size,
            in_channels,
            hidden_size,
        }
    }

    /// Width of one flattened patch
    pub fn patch_dim(&self) -> usize {
        self.patch_size * self.patch_size * self.in_channels
    }

    /// Initialize the module
    pub fn init<B: Backend>(&self, device: &B::Device) -> PatchEmbed<B> {
        PatchEmbed {
            proj: LinearConfig::new(self.patch_dim(), self.hidden_size)
                .with_bias(true)
                .init(device),
            patch_size: self.patch_size,
            in_channels: self.in_channels,
        }
    }
}

impl<B: Backend> PatchEmbed<B> {
    /// Convert image to patch sequence
    ///
    /// # Arguments
    ///
    /// * `x` - Image tensor [batch, channels, height, width]
    ///
    /// # Returns
    ///
    /// Patch embeddings [batch, num_patches, hidden_size]
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 3> {
        let [_, channels, _, _] = x.dims();
        assert_eq!(channels, self.in_channels, "unexpected input channel count");
        self.proj.forward(patchify(x, self.patch_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::TensorData;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn ramp(shape: [usize; 4]) -> Tensor<TestBackend, 4> {
        let n: usize = shape.iter().product();
        let values: Vec<f32> = (0..n).map(|i| i as f32).collect();
        Tensor::from_data(TensorData::new(values, shape), &Default::default())
    }

    #[test]
    fn test_patchify_shape() {
        let x = ramp([2, 4, 8, 6]);
        let tokens = patchify(x, 2);
        assert_eq!(tokens.dims(), [2, 12, 16]);
    }

    #[test]
    fn test_patchify_feature_order() {
        // Single 2x2 patch with 2 channels: c0 = [0,1,2,3], c1 = [4,5,6,7]
        let x = ramp([1, 2, 2, 2]);
        let tokens: Vec<f32> = patchify(x, 2).into_data().to_vec().unwrap();

        // (row, col, channel) ordering interleaves channels fastest
        assert_eq!(tokens, vec![0.0, 4.0, 1.0, 5.0, 2.0, 6.0, 3.0, 7.0]);
    }

    #[test]
    fn test_patch_tokens_are_row_major() {
        // One channel 4x4 image, 2x2 patches: token 1 is the top-right patch
        let x = ramp([1, 1, 4, 4]);
        let tokens: Vec<f32> = patchify(x, 2).into_data().to_vec().unwrap();

        assert_eq!(&tokens[4..8], &[2.0, 3.0, 6.0, 7.0]);
        assert_eq!(&tokens[8..12], &[8.0, 9.0, 12.0, 13.0]);
    }

    #[test]
    fn test_round_trip_is_exact() {
        let x = ramp([2, 3, 8, 4]);
        let expected: Vec<f32> = x.clone().into_data().to_vec().unwrap();

        let y = unpatchify(patchify(x, 2), 2, (8, 4), 3);
        assert_eq!(y.dims(), [2, 3, 8, 4]);
        let actual: Vec<f32> = y.into_data().to_vec().unwrap();
        assert_eq!(actual, expected);
    }

    #[test]
    #[should_panic]
    fn test_indivisible_resolution_panics() {
        let _ = patchify(ramp([1, 4, 7, 8]), 2);
    }

    #[test]
    #[should_panic]
    fn test_unpatchify_token_count_mismatch_panics() {
        let tokens = Tensor::<TestBackend, 3>::zeros([1, 15, 16], &Default::default());
        let _ = unpatchify(tokens, 2, (8, 8), 4);
    }

    #[test]
    fn test_patch_embed() {
        let device = Default::default();
        let embed = PatchEmbedConfig::new(2, 4, 64).init::<TestBackend>(&device);

        let x = Tensor::zeros([2, 4, 16, 16], &device);
        let y = embed.forward(x);

        assert_eq!(y.dims(), [2, 64, 64]);
    }
}
