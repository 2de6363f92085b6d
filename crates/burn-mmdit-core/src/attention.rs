//! Masked multi-head attention
//!
//! One attention implementation is shared by every block; the joint blocks
//! call [`attention`] on the concatenated context and image sequences.

use burn::prelude::*;
use burn::tensor::activation::softmax;

/// Scaled dot-product attention over split heads
///
/// `mask` is `[batch, 1, q_len, k_len]` with `true` meaning "may attend".
/// Masked scores are set to `-inf` before the softmax, for every head.
///
/// # Arguments
///
/// * `q`, `k`, `v` - `[batch, heads, seq, head_dim]`
/// * `mask` - Optional boolean attention mask
pub fn qkv_attention<B: Backend>(
    q: Tensor<B, 4>,
    k: Tensor<B, 4>,
    v: Tensor<B, 4>,
    mask: Option<Tensor<B, 4, Bool>>,
) -> Tensor<B, 4> {
    let [_batch, heads, _seq_len, head_dim] = q.dims();
    let scale = (head_dim as f64).powf(-0.5);

    // [batch, heads, seq_q, seq_k]
    let scores = q.matmul(k.swap_dims(2, 3)) * scale;

    let scores = match mask {
        Some(mask) => {
            let [mb, mh, mq, mk] = mask.dims();
            let [sb, _, sq, sk] = scores.dims();
            assert!(
                mb == sb && mh == 1 && mq == sq && mk == sk,
                "attention mask {:?} does not match scores [{sb}, 1, {sq}, {sk}]",
                [mb, mh, mq, mk]
            );
            scores.mask_fill(mask.bool_not().repeat_dim(1, heads), f32::NEG_INFINITY)
        }
        None => scores,
    };

    softmax(scores, 3).matmul(v)
}

/// Multi-head attention on merged-head sequences
///
/// Splits `[batch, seq, heads * head_dim]` inputs into `num_heads`, runs
/// [`qkv_attention`] and merges the heads back.
///
/// # Panics
///
/// If `q`, `k` and `v` disagree on shape or the width is not divisible by
/// `num_heads`.
pub fn attention<B: Backend>(
    q: Tensor<B, 3>,
    k: Tensor<B, 3>,
    v: Tensor<B, 3>,
    num_heads: usize,
    mask: Option<Tensor<B, 4, Bool>>,
) -> Tensor<B, 3> {
    let [batch, seq_len, dim] = q.dims();
    assert_eq!(k.dims(), [batch, seq_len, dim], "q/k shape mismatch");
    assert_eq!(v.dims(), [batch, seq_len, dim], "q/v shape mismatch");
    assert!(
        dim % num_heads == 0,
        "width {dim} not divisible by {num_heads} heads"
    );
    let head_dim = dim / num_heads;

    let split = |t: Tensor<B, 3>| {
        t.reshape([batch, seq_len, num_heads, head_dim])
            .swap_dims(1, 2)
    };

    qkv_attention(split(q), split(k), split(v), mask)
        .swap_dims(1, 2)
        .reshape([batch, seq_len, dim])
}

/// Builds a key-padding attention mask
///
/// Every query row of element `b` sees the keys where `valid[b, j]` is true,
/// producing `[batch, 1, len, len]`.
pub fn key_padding_mask<B: Backend>(valid: Tensor<B, 2, Bool>) -> Tensor<B, 4, Bool> {
    let [batch, len] = valid.dims();
    valid.reshape([batch, 1, 1, len]).repeat_dim(2, len)
}
