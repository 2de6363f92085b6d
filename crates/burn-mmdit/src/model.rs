//! MMDiT stack
//!
//! ```text
//! x ─patch─+pos──────────────────────────────┐
//! t ─quantize─embed─┐                        │
//! y / pooled ─embed─┴─ c ───────────────┐    │
//! context ─embed─+pos─[dropout]─[regs]──┴─ joint blocks ×depth ─ final ─ unpatch
//! ```
//!
//! The last joint block is context-pre-only: it reads the context stream but
//! produces no context output.

use burn::module::{Ignored, Param};
use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::silu;
use burn::tensor::Distribution;

use burn_mmdit_core::attention::key_padding_mask;
use burn_mmdit_core::layernorm::layer_norm;
use burn_mmdit_core::patch::{unpatchify, PatchEmbed, PatchEmbedConfig};

use crate::block::{modulate, JointBlock, StreamConfig};
use crate::config::MmditConfig;
use crate::dropout::{ConditioningDropout, UnconditionalEmbeddings};
use crate::embedding::{pool, quantize_timesteps, ClassEmbedder, PositionEmbedder, TimestepEmbedder};
use crate::error::MmditError;

/// Final projection back to patch space
#[derive(Module, Debug)]
pub struct FinalLayer<B: Backend> {
    pub linear: Linear<B>,
    /// `SiLU → Linear(hidden, 2 * hidden)`, chunked into `(shift, scale)`
    pub ada_ln_modulation: Linear<B>,
}

impl<B: Backend> FinalLayer<B> {
    pub fn new(hidden_size: usize, patch_size: usize, out_channels: usize, device: &B::Device) -> Self {
        Self {
            linear: LinearConfig::new(hidden_size, patch_size * patch_size * out_channels)
                .with_bias(true)
                .init(device),
            ada_ln_modulation: LinearConfig::new(hidden_size, 2 * hidden_size)
                .with_bias(true)
                .init(device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 3>, c: Tensor<B, 2>) -> Tensor<B, 3> {
        let [batch, hidden] = c.dims();
        let modulation = self.ada_ln_modulation.forward(silu(c));
        let shift = modulation.clone().slice([0..batch, 0..hidden]);
        let scale = modulation.slice([0..batch, hidden..2 * hidden]);
        self.linear
            .forward(modulate(layer_norm(x, 1e-6), Some(shift), scale))
    }
}

/// Class conditioning passed alongside the context
#[derive(Debug, Clone)]
pub enum Conditioning<B: Backend> {
    /// Class ids `[batch]`
    Labels(Tensor<B, 1, Int>),
    /// Pooled vectors `[batch, adm_in_channels]`
    Pooled(Tensor<B, 2>),
}

/// One forward pass worth of inputs
#[derive(Debug, Clone)]
pub struct MmditInput<B: Backend> {
    /// Noised latents `[batch, channels, height, width]`
    pub x: Tensor<B, 4>,
    /// Timesteps in `[0, 1]`, `[batch]`
    pub t: Tensor<B, 1>,
    /// Labels or a pooled vector; must be `None` when pooling is configured
    pub conditioning: Option<Conditioning<B>>,
    /// Raw context `[batch, context_len, context_dim]`
    pub context: Tensor<B, 3>,
    /// `[batch, context_len]`, true = real token
    pub context_mask: Option<Tensor<B, 2, Bool>>,
    /// `[batch, num_patches]`, true = real patch
    pub x_mask: Option<Tensor<B, 2, Bool>>,
    /// Elements to make unconditional regardless of the dropout draw
    pub force_drop: Option<Tensor<B, 1, Bool>>,
}

impl<B: Backend> MmditInput<B> {
    pub fn new(x: Tensor<B, 4>, t: Tensor<B, 1>, context: Tensor<B, 3>) -> Self {
        Self {
            x,
            t,
            conditioning: None,
            context,
            context_mask: None,
            x_mask: None,
            force_drop: None,
        }
    }

    pub fn with_labels(mut self, labels: Tensor<B, 1, Int>) -> Self {
        self.conditioning = Some(Conditioning::Labels(labels));
        self
    }

    pub fn with_pooled(mut self, pooled: Tensor<B, 2>) -> Self {
        self.conditioning = Some(Conditioning::Pooled(pooled));
        self
    }

    pub fn with_context_mask(mut self, mask: Tensor<B, 2, Bool>) -> Self {
        self.context_mask = Some(mask);
        self
    }

    pub fn with_x_mask(mut self, mask: Tensor<B, 2, Bool>) -> Self {
        self.x_mask = Some(mask);
        self
    }

    pub fn with_force_drop(mut self, force_drop: Tensor<B, 1, Bool>) -> Self {
        self.force_drop = Some(force_drop);
        self
    }
}

#[derive(Debug, Clone)]
pub struct MmditOutput<B: Backend> {
    /// `[batch, out_channels, height, width]`
    pub sample: Tensor<B, 4>,
}

/// Dual-stream joint-conditioning diffusion transformer
#[derive(Module, Debug)]
pub struct Mmdit<B: Backend> {
    pub x_embedder: PatchEmbed<B>,
    pub t_embedder: TimestepEmbedder<B>,
    pub y_embedder: ClassEmbedder<B>,
    /// Projects raw context to the hidden width; `None` when it already matches
    pub context_embedder: Option<Linear<B>>,
    /// `[1, register_length, hidden]`
    pub register: Option<Param<Tensor<B, 3>>>,
    pub pos_embed: PositionEmbedder<B>,
    pub joint_blocks: Vec<JointBlock<B>>,
    pub final_layer: FinalLayer<B>,
    pub cond_dropout: ConditioningDropout<B>,
    pub config: Ignored<MmditConfig>,
}

impl MmditConfig {
    /// Builds a randomly initialized model
    ///
    /// `uncond` supplies the unconditional substitutes used by conditioning
    /// dropout; they are required when `class_dropout_prob > 0`.
    pub fn init<B: Backend>(
        &self,
        uncond: Option<UnconditionalEmbeddings<B>>,
        device: &B::Device,
    ) -> Result<Mmdit<B>, MmditError> {
        self.validate()?;
        let hidden = self.hidden_size();
        tracing::debug!(
            depth = self.depth,
            hidden,
            heads = self.num_heads(),
            patch_size = self.patch_size,
            context_len = self.context_len,
            registers = self.register_length,
            class_dropout = self.class_dropout_prob,
            config = ?self,
            "building mmdit"
        );

        let cond_dropout =
            ConditioningDropout::new(self.class_dropout_prob, uncond, hidden, self.context_len)?;

        let stream = StreamConfig::from_model(self);
        let joint_blocks = (0..self.depth)
            .map(|i| JointBlock::new(&stream, i == self.depth - 1, device))
            .collect();

        let register = (self.register_length > 0).then(|| {
            Param::from_tensor(Tensor::random(
                [1, self.register_length, hidden],
                Distribution::Normal(0.0, 1.0),
                device,
            ))
        });

        Ok(Mmdit {
            x_embedder: PatchEmbedConfig::new(self.patch_size, self.in_channels, hidden).init(device),
            t_embedder: TimestepEmbedder::new(hidden, self.frequency_embedding_size, device),
            y_embedder: ClassEmbedder::new(
                &self.class_conditioning,
                hidden,
                self.class_dropout_prob,
                device,
            ),
            context_embedder: self
                .context_dim
                .map(|dim| LinearConfig::new(dim, hidden).with_bias(true).init(device)),
            register,
            pos_embed: PositionEmbedder::new(
                hidden,
                self.pos_embed_max_size,
                self.patch_size,
                self.context_len,
                self.pos_embed_init,
                self.pos_embed_scaling_factor,
                self.pos_embed_offset,
                device,
            ),
            joint_blocks,
            final_layer: FinalLayer::new(hidden, self.patch_size, self.out_channels(), device),
            cond_dropout,
            config: Ignored(self.clone()),
        })
    }
}

impl<B: Backend> Mmdit<B> {
    pub fn config(&self) -> &MmditConfig {
        &self.config.0
    }

    /// Runs the backbone
    ///
    /// # Panics
    ///
    /// On shape preconditions: a resolution not divisible by the patch size
    /// or larger than the positional table, a context of the wrong length
    /// or width, masks that do not match their streams, a conditioning
    /// kind the model was not built for, or a `force_drop` on a model built
    /// without unconditional embeddings.
    pub fn forward(&self, input: MmditInput<B>) -> MmditOutput<B> {
        let MmditInput {
            x,
            t,
            conditioning,
            context,
            context_mask,
            x_mask,
            force_drop,
        } = input;
        let config = self.config();
        let [batch, _, height, width] = x.dims();
        let device = x.device();
        let _span = tracing::trace_span!("mmdit_forward", batch, height, width).entered();

        let x = self.x_embedder.forward(x) + self.pos_embed.cropped(height, width);
        let [_, x_len, hidden] = x.dims();

        let c = self.t_embedder.forward(quantize_timesteps(t));
        assert_eq!(c.dims(), [batch, hidden], "timesteps must have one entry per element");

        let selected = self.cond_dropout.select(batch, force_drop, &device);

        let [ctx_batch, ctx_len, ctx_dim] = context.dims();
        assert!(
            ctx_batch == batch && ctx_dim == config.context_in_dim(),
            "context [{ctx_batch}, {ctx_len}, {ctx_dim}] does not fit batch {batch} and width {}",
            config.context_in_dim()
        );

        let y = match (config.pooling, conditioning) {
            (Some(pooling), None) => Some(
                self.y_embedder
                    .embed_vector(pool(pooling, context.clone(), context_mask.clone())),
            ),
            (Some(_), Some(_)) => {
                panic!("wrong conditioning kind: the model pools its class vector from the context")
            }
            (None, Some(Conditioning::Labels(labels))) => {
                Some(self.y_embedder.embed_labels(labels, selected.clone()))
            }
            (None, Some(Conditioning::Pooled(pooled))) => Some(self.y_embedder.embed_vector(pooled)),
            (None, None) => None,
        };
        let is_label = matches!(self.y_embedder, ClassEmbedder::Label(_));

        let context = match &self.context_embedder {
            Some(embedder) => embedder.forward(context),
            None => context,
        };
        let context = self.pos_embed.add_to_context(context);

        let (context, context_mask, y) = match selected {
            Some(selected) if self.cond_dropout.has_substitutes() => {
                // Labels are dropped through the null row instead
                let (pooled, label_y) = if is_label { (None, y) } else { (y, None) };
                let (context, mask, pooled) =
                    self.cond_dropout
                        .apply_selected(context, context_mask, pooled, selected);
                (context, Some(mask), pooled.or(label_y))
            }
            Some(_) => panic!(
                "force_drop selected elements but the model has no unconditional embeddings"
            ),
            None => (context, context_mask, y),
        };

        let c = match y {
            Some(y) => c + y,
            None => c,
        };

        let (context, context_mask) = match &self.register {
            Some(register) => {
                let registers = register.val().repeat_dim(0, batch);
                let [_, reg_len, _] = registers.dims();
                let mask = context_mask.map(|mask| {
                    Tensor::cat(
                        vec![Tensor::<B, 2, Int>::ones([batch, reg_len], &device).bool(), mask],
                        1,
                    )
                });
                (Tensor::cat(vec![registers, context], 1), mask)
            }
            None => (context, context_mask),
        };
        let [_, ctx_len, _] = context.dims();

        let mask = match (context_mask, x_mask) {
            (None, None) => None,
            (context_mask, x_mask) => {
                let all_valid =
                    |len: usize| Tensor::<B, 2, Int>::ones([batch, len], &device).bool();
                let context_mask = context_mask.unwrap_or_else(|| all_valid(ctx_len));
                let x_mask = x_mask.unwrap_or_else(|| all_valid(x_len));
                assert_eq!(context_mask.dims(), [batch, ctx_len], "context mask shape");
                assert_eq!(x_mask.dims(), [batch, x_len], "image mask shape");
                Some(key_padding_mask(Tensor::cat(vec![context_mask, x_mask], 1)))
            }
        };

        let mut context = Some(context);
        let mut x = x;
        for (index, block) in self.joint_blocks.iter().enumerate() {
            let _span = tracing::trace_span!("joint_block", index).entered();
            let ctx = match context.take() {
                Some(ctx) => ctx,
                None => panic!("joint block {index} received no context stream"),
            };
            let (next_context, next_x) = block.forward(ctx, x, c.clone(), mask.clone());
            context = next_context;
            x = next_x;
        }

        let x = self.final_layer.forward(x, c);
        let sample = unpatchify(x, config.patch_size, (height, width), config.out_channels());
        MmditOutput { sample }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_final_layer_shape() {
        let device = Default::default();
        let layer = FinalLayer::<TestBackend>::new(32, 2, 4, &device);
        let x = Tensor::random([2, 6, 32], Distribution::Default, &device);
        let c = Tensor::random([2, 32], Distribution::Default, &device);
        assert_eq!(layer.forward(x, c).dims(), [2, 6, 16]);
    }

    #[test]
    fn test_last_block_is_pre_only() {
        let device = Default::default();
        let model = MmditConfig::tiny().init::<TestBackend>(None, &device).unwrap();

        assert_eq!(model.joint_blocks.len(), 2);
        assert!(!model.joint_blocks[0].is_pre_only());
        assert!(model.joint_blocks[1].is_pre_only());
        assert!(model.register.is_none());
        assert_eq!(model.pos_embed.table.dims(), [1, 256, 128]);
        assert_eq!(model.pos_embed.context_table.dims(), [1, 8, 128]);
    }

    #[test]
    fn test_init_requires_substitutes_for_dropout() {
        let device = Default::default();
        let err = MmditConfig::tiny()
            .with_class_dropout(0.1)
            .init::<TestBackend>(None, &device)
            .unwrap_err();
        assert_eq!(err, MmditError::MissingUnconditional { prob: 0.1 });
    }

    #[test]
    fn test_identity_context_embedder() {
        let device = Default::default();
        let mut config = MmditConfig::tiny();
        config.context_dim = None;
        config.class_conditioning = crate::config::ClassConditioning::Vector { input_dim: 128 };
        let model = config.init::<TestBackend>(None, &device).unwrap();
        assert!(model.context_embedder.is_none());

        let input = MmditInput::new(
            Tensor::random([1, 4, 8, 8], Distribution::Default, &device),
            Tensor::from_floats([0.5], &device),
            Tensor::random([1, 8, 128], Distribution::Default, &device),
        );
        assert_eq!(model.forward(input).sample.dims(), [1, 4, 8, 8]);
    }
}
