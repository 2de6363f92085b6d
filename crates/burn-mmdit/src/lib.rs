//! MMDiT: dual-stream joint-conditioning diffusion transformer
//!
//! The backbone of an SD3-style latent diffusion model. It maps a noised
//! latent `[batch, channels, height, width]`, a timestep in `[0, 1]` and a
//! conditioning sequence to a prediction of the same spatial shape.
//!
//! # Architecture
//!
//! - Two token streams, context and image, each with its own weights
//! - One masked attention per block over the concatenation of both streams
//! - adaLN modulation of every sub-layer from `c = t_emb + y_emb`
//! - A fixed positional table, centre-cropped to the input resolution
//! - Classifier-free-guidance dropout that swaps in precomputed
//!   unconditional context, mask and pooled vector per element
//!
//! # Example
//!
//! ```ignore
//! use burn_mmdit::{MmditConfig, MmditInput};
//!
//! let model = MmditConfig::sd3_medium().init::<B>(None, &device)?;
//! let out = model.forward(MmditInput::new(latents, t, context).with_pooled(pooled));
//! ```

pub mod attention;
pub mod block;
pub mod config;
pub mod dropout;
pub mod embedding;
pub mod error;
pub mod loader;
pub mod model;
pub mod training;

pub use config::{
    ClassConditioning, FeedForwardKind, MmditConfig, ModulationKind, NormKind, Pooling,
    PositionTableInit, QkNorm,
};
pub use dropout::{ConditioningDropout, UnconditionalEmbeddings};
pub use error::{MmditError, MmditLoadError};
pub use loader::load_mmdit;
pub use model::{Conditioning, Mmdit, MmditInput, MmditOutput};
pub use training::{CheckpointedAutodiff, TrainPolicy, TrainReport, WeightGroup};
