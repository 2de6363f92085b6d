//! Weight Loading
//!
//! This crate reads model weights from safetensors files into burn tensors.
//!
//! ```ignore
//! use burn_mmdit_convert::{SafeTensorFile, LoadError};
//!
//! let file = SafeTensorFile::open("mmdit.safetensors")?;
//! let weight = file.load_f32::<B, 2>("final_layer.linear.weight", &device)?;
//! ```
//!
//! fp16 and bf16 tensors are widened to f32 on load.

pub mod loader;

pub use loader::{LoadError, SafeTensorFile};
