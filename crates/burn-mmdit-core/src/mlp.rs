//! Two-layer GELU feed-forward
//!
//! The default feed-forward of a joint block: `fc2(gelu_tanh(fc1(x)))`.

use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;

/// GELU with the tanh approximation
///
/// ```text
/// 0.5 * x * (1 + tanh(sqrt(2/pi) * (x + 0.044715 * x^3)))
/// ```
pub fn gelu_tanh<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    let coeff = (2.0 / std::f64::consts::PI).sqrt();
    let cube = x.clone().powi_scalar(3);
    let inner = (x.clone() + cube * 0.044715) * coeff;
    x * (inner.tanh() + 1.0) * 0.5
}

/// Feed-forward block with a GELU-tanh hidden activation
#[derive(Module, Debug)]
pub struct Mlp<B: Backend> {
    pub fc1: Linear<B>,
    pub fc2: Linear<B>,
}

/// Configuration for [`Mlp`]
pub struct MlpConfig {
    pub hidden_size: usize,
    pub intermediate_size: usize,
}

impl MlpConfig {
    pub fn new(hidden_size: usize, intermediate_size: usize) -> Self {
        Self {
            hidden_size,
            intermediate_size,
        }
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Mlp<B> {
        Mlp {
            fc1: LinearConfig::new(self.hidden_size, self.intermediate_size)
                .with_bias(true)
                .init(device),
            fc2: LinearConfig::new(self.intermediate_size, self.hidden_size)
                .with_bias(true)
                .init(device),
        }
    }
}

impl<B: Backend> Mlp<B> {
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        self.fc2.forward(gelu_tanh(self.fc1.forward(x)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_gelu_tanh_reference_values() {
        let device = Default::default();
        let x: Tensor<TestBackend, 1> = Tensor::from_floats([-1.0, 0.0, 1.0, 3.0], &device);
        let y: Vec<f32> = gelu_tanh(x).into_data().to_vec().unwrap();

        let expected = [-0.158808, 0.0, 0.841192, 2.996363];
        for (a, b) in y.iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-4, "{a} vs {b}");
        }
    }

    #[test]
    fn test_mlp_shape() {
        let device = Default::default();
        let mlp = MlpConfig::new(64, 256).init::<TestBackend>(&device);

        let y = mlp.forward(Tensor::zeros([2, 7, 64], &device));
        assert_eq!(y.dims(), [2, 7, 64]);
        assert_eq!(mlp.fc1.weight.val().dims(), [64, 256]);
    }
}
