//! Core Building Blocks for Joint-Attention Diffusion Transformers
//!
//! This crate provides the backend-generic components the MMDiT model is
//! assembled from.
//!
//! # Modules
//!
//! ## Attention
//!
//! - [`attention`] - Masked multi-head scaled dot-product attention
//!
//! ## Normalization Layers
//!
//! - [`layernorm`] - Layer normalization (affine or not)
//! - [`rmsnorm`] - RMS normalization
//!
//! ## Feed-Forward Networks
//!
//! - [`mlp`] - Two-layer MLP with GELU (tanh approximation)
//! - [`glu`] - SwiGLU gated feed-forward
//!
//! ## Image Tokens and Positions
//!
//! - [`patch`] - Patchify/unpatchify and the patch embedding projection
//! - [`sincos`] - Sine/cosine position tables and timestep frequencies
//!
//! # Example
//!
//! ```ignore
//! use burn_mmdit_core::patch::{patchify, unpatchify};
//!
//! let tokens = patchify(latents, 2); // [B, (H/2)*(W/2), 4*C]
//! let image = unpatchify(tokens, 2, (height, width), channels);
//! ```

pub mod attention;
pub mod glu;
pub mod layernorm;
pub mod mlp;
pub mod patch;
pub mod rmsnorm;
pub mod sincos;
