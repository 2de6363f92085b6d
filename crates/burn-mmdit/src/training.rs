//! Train/freeze policy
//!
//! Parameters are tagged by [`WeightGroup`]. A [`TrainPolicy`] picks the
//! groups that keep their gradients; everything else is detached with
//! `no_grad()`. Positional tables and unconditional substitutes are plain
//! tensors and never part of any group.
//!
//! Activation recomputation is a property of the backend, not of the
//! model: training on [`CheckpointedAutodiff`] lets burn's checkpointing
//! strategy decide, across the whole graph, which activations to keep and
//! which to recompute during backward. There is no per-block switch; the
//! blocks are pure functions of their inputs and weights, so the same model
//! runs unchanged on either backend.

use std::fmt;

use burn::backend::autodiff::checkpoint::strategy::BalancedCheckpointing;
use burn::backend::Autodiff;
use burn::prelude::*;

use crate::block::{JointBlock, StreamBlock};
use crate::model::{FinalLayer, Mmdit};

/// Autodiff backend that recomputes activations during backward instead of
/// keeping them alive
///
/// The choice applies to the whole graph, not to individual blocks. Forward
/// results are identical to plain `Autodiff<B>`.
pub type CheckpointedAutodiff<B> = Autodiff<B, BalancedCheckpointing>;

/// Structural tag of a model parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WeightGroup {
    PatchEmbedder,
    TimestepEmbedder,
    ClassEmbedder,
    ContextEmbedder,
    Registers,
    /// q/k/v, output projection and q/k norms of every stream
    Attention,
    /// adaLN projections of every stream and of the final layer
    Modulation,
    FeedForward,
    /// Output projection of the final layer
    FinalLayer,
}

impl WeightGroup {
    pub const ALL: [WeightGroup; 9] = [
        WeightGroup::PatchEmbedder,
        WeightGroup::TimestepEmbedder,
        WeightGroup::ClassEmbedder,
        WeightGroup::ContextEmbedder,
        WeightGroup::Registers,
        WeightGroup::Attention,
        WeightGroup::Modulation,
        WeightGroup::FeedForward,
        WeightGroup::FinalLayer,
    ];
}

impl fmt::Display for WeightGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WeightGroup::PatchEmbedder => "patch_embedder",
            WeightGroup::TimestepEmbedder => "timestep_embedder",
            WeightGroup::ClassEmbedder => "class_embedder",
            WeightGroup::ContextEmbedder => "context_embedder",
            WeightGroup::Registers => "registers",
            WeightGroup::Attention => "attention",
            WeightGroup::Modulation => "modulation",
            WeightGroup::FeedForward => "feed_forward",
            WeightGroup::FinalLayer => "final_layer",
        };
        f.write_str(name)
    }
}

/// Which weight groups receive gradients
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainPolicy {
    /// Trainable groups; `None` means every group
    pub trainable: Option<Vec<WeightGroup>>,
    /// Groups frozen even if listed as trainable
    pub frozen: Vec<WeightGroup>,
}

impl Default for TrainPolicy {
    fn default() -> Self {
        Self::all()
    }
}

impl TrainPolicy {
    pub fn all() -> Self {
        Self {
            trainable: None,
            frozen: Vec::new(),
        }
    }

    /// Fine-tuning setup: attention, modulation, context embedder and
    /// feed-forward train; embedders of x/t/y, registers and the final
    /// projection stay fixed.
    pub fn sd3_finetune() -> Self {
        Self {
            trainable: Some(vec![
                WeightGroup::Attention,
                WeightGroup::Modulation,
                WeightGroup::ContextEmbedder,
                WeightGroup::FeedForward,
            ]),
            frozen: Vec::new(),
        }
    }

    pub fn freezing(mut self, group: WeightGroup) -> Self {
        self.frozen.push(group);
        self
    }

    pub fn is_trainable(&self, group: WeightGroup) -> bool {
        let listed = match &self.trainable {
            Some(groups) => groups.contains(&group),
            None => true,
        };
        listed && !self.frozen.contains(&group)
    }
}

/// Outcome of applying a [`TrainPolicy`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainReport {
    /// `(group, parameter count)` of every trainable group
    pub trainable: Vec<(WeightGroup, usize)>,
    pub frozen: Vec<(WeightGroup, usize)>,
}

impl TrainReport {
    pub fn trainable_params(&self) -> usize {
        self.trainable.iter().map(|(_, n)| n).sum()
    }

    pub fn frozen_params(&self) -> usize {
        self.frozen.iter().map(|(_, n)| n).sum()
    }
}

impl fmt::Display for TrainReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (group, count) in &self.trainable {
            writeln!(f, "  trainable  {group:<18} {count:>12}")?;
        }
        for (group, count) in &self.frozen {
            writeln!(f, "  frozen     {group:<18} {count:>12}")?;
        }
        write!(
            f,
            "  total: {} trainable, {} frozen",
            self.trainable_params(),
            self.frozen_params()
        )
    }
}

fn freeze_if<B: Backend, M: Module<B>>(module: M, freeze: bool) -> M {
    if freeze {
        module.no_grad()
    } else {
        module
    }
}

fn map_streams<B: Backend>(
    blocks: Vec<JointBlock<B>>,
    f: impl Fn(StreamBlock<B>) -> StreamBlock<B>,
) -> Vec<JointBlock<B>> {
    blocks
        .into_iter()
        .map(|block| JointBlock {
            context_block: f(block.context_block),
            x_block: f(block.x_block),
        })
        .collect()
}

impl<B: Backend> Mmdit<B> {
    /// Number of parameters in one weight group
    pub fn group_params(&self, group: WeightGroup) -> usize {
        let streams = || {
            self.joint_blocks
                .iter()
                .flat_map(|block| [&block.context_block, &block.x_block])
        };
        match group {
            WeightGroup::PatchEmbedder => self.x_embedder.num_params(),
            WeightGroup::TimestepEmbedder => self.t_embedder.num_params(),
            WeightGroup::ClassEmbedder => self.y_embedder.num_params(),
            WeightGroup::ContextEmbedder => self.context_embedder.num_params(),
            WeightGroup::Registers => self.register.num_params(),
            WeightGroup::Attention => streams().map(|s| s.attn.num_params()).sum(),
            WeightGroup::Modulation => {
                streams().map(|s| s.ada_ln_modulation.num_params()).sum::<usize>()
                    + self.final_layer.ada_ln_modulation.num_params()
            }
            WeightGroup::FeedForward => streams().map(|s| s.mlp.num_params()).sum(),
            WeightGroup::FinalLayer => self.final_layer.linear.num_params(),
        }
    }

    /// Detaches every group the policy does not train
    pub fn with_train_policy(self, policy: &TrainPolicy) -> (Self, TrainReport) {
        let mut report = TrainReport {
            trainable: Vec::new(),
            frozen: Vec::new(),
        };
        for group in WeightGroup::ALL {
            let entry = (group, self.group_params(group));
            if policy.is_trainable(group) {
                report.trainable.push(entry);
            } else {
                report.frozen.push(entry);
            }
        }
        tracing::debug!(
            trainable = report.trainable_params(),
            frozen = report.frozen_params(),
            "applied train policy"
        );

        let frozen = |group| !policy.is_trainable(group);
        let Mmdit {
            x_embedder,
            t_embedder,
            y_embedder,
            context_embedder,
            register,
            pos_embed,
            joint_blocks,
            final_layer,
            cond_dropout,
            config,
        } = self;

        let joint_blocks = map_streams(joint_blocks, |stream| StreamBlock {
            attn: freeze_if::<B, _>(stream.attn, frozen(WeightGroup::Attention)),
            mlp: freeze_if::<B, _>(stream.mlp, frozen(WeightGroup::FeedForward)),
            ada_ln_modulation: freeze_if::<B, _>(
                stream.ada_ln_modulation,
                frozen(WeightGroup::Modulation),
            ),
            ..stream
        });

        let model = Mmdit {
            x_embedder: freeze_if::<B, _>(x_embedder, frozen(WeightGroup::PatchEmbedder)),
            t_embedder: freeze_if::<B, _>(t_embedder, frozen(WeightGroup::TimestepEmbedder)),
            y_embedder: freeze_if::<B, _>(y_embedder, frozen(WeightGroup::ClassEmbedder)),
            context_embedder: freeze_if::<B, _>(context_embedder, frozen(WeightGroup::ContextEmbedder)),
            register: freeze_if::<B, _>(register, frozen(WeightGroup::Registers)),
            pos_embed,
            joint_blocks,
            final_layer: FinalLayer {
                linear: freeze_if::<B, _>(final_layer.linear, frozen(WeightGroup::FinalLayer)),
                ada_ln_modulation: freeze_if::<B, _>(
                    final_layer.ada_ln_modulation,
                    frozen(WeightGroup::Modulation),
                ),
            },
            cond_dropout,
            config,
        };

        (model, report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MmditConfig;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_policy_membership() {
        let all = TrainPolicy::all();
        assert!(WeightGroup::ALL.iter().all(|g| all.is_trainable(*g)));

        let finetune = TrainPolicy::sd3_finetune();
        assert!(finetune.is_trainable(WeightGroup::Attention));
        assert!(finetune.is_trainable(WeightGroup::ContextEmbedder));
        assert!(!finetune.is_trainable(WeightGroup::PatchEmbedder));
        assert!(!finetune.is_trainable(WeightGroup::FinalLayer));

        let frozen = TrainPolicy::sd3_finetune().freezing(WeightGroup::Attention);
        assert!(!frozen.is_trainable(WeightGroup::Attention));
    }

    #[test]
    fn test_group_counts_cover_every_parameter() {
        let device = Default::default();
        let model = MmditConfig::tiny().init::<TestBackend>(None, &device).unwrap();

        let total: usize = WeightGroup::ALL.iter().map(|g| model.group_params(*g)).sum();
        assert_eq!(total, model.num_params());
        assert_eq!(model.group_params(WeightGroup::Registers), 0);
        // patch dim 2*2*4 = 16 -> hidden 128
        assert_eq!(model.group_params(WeightGroup::PatchEmbedder), 16 * 128 + 128);
    }

    #[test]
    fn test_report_splits_groups() {
        let device = Default::default();
        let model = MmditConfig::tiny().init::<TestBackend>(None, &device).unwrap();
        let total = model.num_params();

        let (_, report) = model.with_train_policy(&TrainPolicy::sd3_finetune());
        assert_eq!(report.trainable.len(), 4);
        assert_eq!(report.frozen.len(), 5);
        assert_eq!(report.trainable_params() + report.frozen_params(), total);
    }
}
