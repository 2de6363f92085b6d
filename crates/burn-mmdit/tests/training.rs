//! Freezing and gradient flow under the checkpointing autodiff backend

use burn::module::AutodiffModule;
use burn::prelude::*;
use burn::tensor::Distribution;
use burn_mmdit::{CheckpointedAutodiff, Mmdit, MmditConfig, MmditInput, TrainPolicy, WeightGroup};
use burn_ndarray::NdArray;

type TestBackend = NdArray<f32>;
type TrainBackend = CheckpointedAutodiff<TestBackend>;

fn input<B: Backend>(device: &B::Device) -> MmditInput<B> {
    MmditInput::new(
        Tensor::random([2, 4, 16, 16], Distribution::Normal(0.0, 1.0), device),
        Tensor::from_floats([0.25, 0.75], device),
        Tensor::random([2, 8, 64], Distribution::Normal(0.0, 1.0), device),
    )
    .with_pooled(Tensor::random([2, 64], Distribution::Normal(0.0, 1.0), device))
}

#[test]
fn test_backward_reaches_only_trainable_groups() {
    let device = Default::default();
    let model: Mmdit<TrainBackend> = MmditConfig::tiny().init(None, &device).unwrap();
    let (model, report) = model.with_train_policy(&TrainPolicy::sd3_finetune());
    assert!(report.frozen_params() > 0);

    let loss = model.forward(input(&device)).sample.powf_scalar(2.0).mean();
    let grads = loss.backward();

    // Frozen
    assert!(model.x_embedder.proj.weight.grad(&grads).is_none());
    assert!(model.t_embedder.mlp.linear1.weight.grad(&grads).is_none());
    assert!(model.final_layer.linear.weight.grad(&grads).is_none());

    // Trainable
    let block = &model.joint_blocks[0];
    assert!(block.x_block.attn.qkv.weight.grad(&grads).is_some());
    assert!(block.context_block.ada_ln_modulation.weight.grad(&grads).is_some());
    assert!(model.final_layer.ada_ln_modulation.weight.grad(&grads).is_some());
    assert!(model
        .context_embedder
        .as_ref()
        .unwrap()
        .weight
        .grad(&grads)
        .is_some());
}

#[test]
fn test_frozen_groups_override_trainable_list() {
    let device = Default::default();
    let model: Mmdit<TrainBackend> = MmditConfig::tiny().init(None, &device).unwrap();
    let policy = TrainPolicy::all().freezing(WeightGroup::Attention);
    let (model, report) = model.with_train_policy(&policy);

    assert_eq!(report.frozen.len(), 1);
    assert_eq!(report.frozen[0].0, WeightGroup::Attention);

    let grads = model.forward(input(&device)).sample.sum().backward();
    assert!(model.joint_blocks[1].x_block.attn.qkv.weight.grad(&grads).is_none());
    assert!(model.x_embedder.proj.weight.grad(&grads).is_some());
}

#[test]
fn test_checkpointing_does_not_change_forward() {
    let device = Default::default();
    let model: Mmdit<TrainBackend> = MmditConfig::tiny().init(None, &device).unwrap();
    let train_input = input::<TrainBackend>(&device);

    let plain_input = MmditInput::<TestBackend> {
        x: train_input.x.clone().inner(),
        t: train_input.t.clone().inner(),
        conditioning: Some(burn_mmdit::Conditioning::Pooled(match &train_input.conditioning {
            Some(burn_mmdit::Conditioning::Pooled(pooled)) => pooled.clone().inner(),
            _ => unreachable!(),
        })),
        context: train_input.context.clone().inner(),
        context_mask: None,
        x_mask: None,
        force_drop: None,
    };

    let checkpointed: Vec<f32> = model
        .forward(train_input)
        .sample
        .into_data()
        .to_vec()
        .unwrap();
    let plain: Vec<f32> = model
        .valid()
        .forward(plain_input)
        .sample
        .into_data()
        .to_vec()
        .unwrap();

    for (a, b) in checkpointed.iter().zip(&plain) {
        assert!((a - b).abs() < 1e-5);
    }
}
