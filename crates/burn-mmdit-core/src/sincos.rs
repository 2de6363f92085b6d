//! Sinusoidal embeddings
//!
//! Fixed sine/cosine tables for 2D patch positions and the frequency
//! embedding of diffusion timesteps.

use burn::prelude::*;
use burn::tensor::TensorData;

/// 1D sine/cosine embedding of arbitrary positions
///
/// Returns a row-major `[positions.len(), dim]` buffer where each row is
/// `[sin(pos * omega) | cos(pos * omega)]` with
/// `omega_i = 1 / 10000^(i / (dim/2))`.
///
/// # Panics
///
/// If `dim` is odd.
pub fn get_1d_sincos_pos_embed(dim: usize, positions: &[f64]) -> Vec<f32> {
    assert!(dim % 2 == 0, "sincos embedding dim must be even, got {dim}");
    let half = dim / 2;
    let omega: Vec<f64> = (0..half)
        .map(|i| 1.0 / 10000f64.powf(i as f64 / half as f64))
        .collect();

    let mut out = Vec::with_capacity(positions.len() * dim);
    for &pos in positions {
        out.extend(omega.iter().map(|w| (pos * w).sin() as f32));
        out.extend(omega.iter().map(|w| (pos * w).cos() as f32));
    }
    out
}

/// 2D sine/cosine table for a `grid_size × grid_size` patch grid
///
/// Coordinates are optionally divided by `scaling` and then shifted by
/// `-offset`. The first half of each row encodes the column coordinate and
/// the second half the row coordinate. Rows are flattened row-major, so the
/// result is `[grid_size * grid_size, dim]`.
///
/// # Panics
///
/// If `dim` is not divisible by 4.
pub fn get_2d_sincos_pos_embed(
    dim: usize,
    grid_size: usize,
    scaling: Option<f64>,
    offset: Option<f64>,
) -> Vec<f32> {
    assert!(dim % 4 == 0, "2D sincos embedding dim must be a multiple of 4, got {dim}");
    let coord = |i: usize| {
        let mut v = i as f64;
        if let Some(s) = scaling {
            v /= s;
        }
        if let Some(o) = offset {
            v -= o;
        }
        v
    };

    let n = grid_size * grid_size;
    let cols: Vec<f64> = (0..n).map(|k| coord(k % grid_size)).collect();
    let rows: Vec<f64> = (0..n).map(|k| coord(k / grid_size)).collect();

    let half = dim / 2;
    let emb_cols = get_1d_sincos_pos_embed(half, &cols);
    let emb_rows = get_1d_sincos_pos_embed(half, &rows);

    let mut out = Vec::with_capacity(n * dim);
    for k in 0..n {
        out.extend_from_slice(&emb_cols[k * half..(k + 1) * half]);
        out.extend_from_slice(&emb_rows[k * half..(k + 1) * half]);
    }
    out
}

/// Uploads a 2D sincos table as `[1, grid_size * grid_size, dim]`
pub fn sincos_2d_table<B: Backend>(
    dim: usize,
    grid_size: usize,
    scaling: Option<f64>,
    offset: Option<f64>,
    device: &B::Device,
) -> Tensor<B, 3> {
    let data = get_2d_sincos_pos_embed(dim, grid_size, scaling, offset);
    Tensor::from_data(
        TensorData::new(data, [1, grid_size * grid_size, dim]),
        device,
    )
}

/// Uploads a 1D sincos table over positions `0..len` as `[1, len, dim]`
pub fn sincos_1d_table<B: Backend>(dim: usize, len: usize, device: &B::Device) -> Tensor<B, 3> {
    let positions: Vec<f64> = (0..len).map(|i| i as f64).collect();
    let data = get_1d_sincos_pos_embed(dim, &positions);
    Tensor::from_data(TensorData::new(data, [1, len, dim]), device)
}

/// Sinusoidal timestep embedding
///
/// `t` may be fractional. Returns `[batch, dim]` laid out as
/// `[cos(t * f) | sin(t * f)]` with `f_i = exp(-ln(max_period) * i / (dim/2))`,
/// zero-padded by one column when `dim` is odd.
pub fn timestep_embedding<B: Backend>(t: Tensor<B, 1>, dim: usize, max_period: f64) -> Tensor<B, 2> {
    let [batch] = t.dims();
    let device = t.device();
    let half = dim / 2;

    let freqs: Vec<f32> = (0..half)
        .map(|i| (-(max_period.ln()) * i as f64 / half as f64).exp() as f32)
        .collect();
    let freqs = Tensor::<B, 1>::from_data(TensorData::new(freqs, [half]), &device);

    // [batch, half]
    let args = t.reshape([batch, 1]) * freqs.reshape([1, half]);
    let embedding = Tensor::cat(vec![args.clone().cos(), args.sin()], 1);

    if dim % 2 == 1 {
        Tensor::cat(vec![embedding, Tensor::zeros([batch, 1], &device)], 1)
    } else {
        embedding
    }
}
