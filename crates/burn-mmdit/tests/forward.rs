//! End-to-end forward passes on the tiny configuration

use burn::backend::Autodiff;
use burn::module::AutodiffModule;
use burn::prelude::*;
use burn::tensor::{Distribution, TensorData};
use burn_mmdit::{
    ClassConditioning, Conditioning, FeedForwardKind, Mmdit, MmditConfig, MmditInput, ModulationKind, NormKind,
    Pooling, QkNorm, UnconditionalEmbeddings,
};
use burn_ndarray::NdArray;

type TestBackend = NdArray<f32>;
type TrainBackend = Autodiff<TestBackend>;

const TOLERANCE: f32 = 1e-4;

fn random<B: Backend, const D: usize>(shape: [usize; D], device: &B::Device) -> Tensor<B, D> {
    Tensor::random(shape, Distribution::Normal(0.0, 1.0), device)
}

fn bools<B: Backend, const D: usize>(values: Vec<bool>, shape: [usize; D], device: &B::Device) -> Tensor<B, D, Bool> {
    Tensor::from_data(TensorData::new(values, shape), device)
}

fn substitutes<B: Backend>(hidden: usize, device: &B::Device) -> UnconditionalEmbeddings<B> {
    UnconditionalEmbeddings::new(random([3, hidden], device), random([hidden], device))
}

/// Standard tiny input: 32x32 latents, 8 context tokens of width 64
fn tiny_input<B: Backend>(batch: usize, device: &B::Device) -> MmditInput<B> {
    MmditInput::new(
        random([batch, 4, 32, 32], device),
        Tensor::random([batch], Distribution::Uniform(0.0, 1.0), device),
        random([batch, 8, 64], device),
    )
    .with_pooled(random([batch, 64], device))
}

fn values<B: Backend, const D: usize>(t: Tensor<B, D>) -> Vec<f32> {
    t.into_data().convert::<f32>().to_vec().unwrap()
}

fn assert_close(a: &[f32], b: &[f32]) {
    assert_eq!(a.len(), b.len());
    for (i, (x, y)) in a.iter().zip(b).enumerate() {
        assert!((x - y).abs() < TOLERANCE, "index {i}: {x} vs {y}");
    }
}

fn differs(a: &[f32], b: &[f32]) -> bool {
    a.iter().zip(b).any(|(x, y)| (x - y).abs() > TOLERANCE)
}

#[test]
fn test_end_to_end_shape() {
    let device = Default::default();
    let model: Mmdit<TestBackend> = MmditConfig::tiny().init(None, &device).unwrap();

    let out = model.forward(tiny_input(2, &device));
    assert_eq!(out.sample.dims(), [2, 4, 32, 32]);
    assert!(values(out.sample).iter().all(|v| v.is_finite()));
}

#[test]
fn test_smaller_resolution_uses_cropped_table() {
    let device = Default::default();
    let model: Mmdit<TestBackend> = MmditConfig::tiny().init(None, &device).unwrap();

    let input = MmditInput::new(
        random([1, 4, 16, 24], &device),
        Tensor::from_floats([0.3], &device),
        random([1, 8, 64], &device),
    )
    .with_pooled(random([1, 64], &device));
    assert_eq!(model.forward(input).sample.dims(), [1, 4, 16, 24]);
}

#[test]
#[should_panic]
fn test_oversize_resolution_panics() {
    let device = Default::default();
    let model: Mmdit<TestBackend> = MmditConfig::tiny().init(None, &device).unwrap();

    let mut input = tiny_input(1, &device);
    input.x = random([1, 4, 64, 64], &device);
    let _ = model.forward(input);
}

#[test]
#[should_panic]
fn test_indivisible_resolution_panics() {
    let device = Default::default();
    let model: Mmdit<TestBackend> = MmditConfig::tiny().init(None, &device).unwrap();

    let mut input = tiny_input(1, &device);
    input.x = random([1, 4, 31, 32], &device);
    let _ = model.forward(input);
}

#[test]
#[should_panic]
fn test_wrong_context_length_panics() {
    let device = Default::default();
    let model: Mmdit<TestBackend> = MmditConfig::tiny().init(None, &device).unwrap();

    let mut input = tiny_input(1, &device);
    input.context = random([1, 9, 64], &device);
    let _ = model.forward(input);
}

#[test]
fn test_learn_sigma_doubles_output_channels() {
    let device = Default::default();
    let mut config = MmditConfig::tiny();
    config.learn_sigma = true;
    let model: Mmdit<TestBackend> = config.init(None, &device).unwrap();

    assert_eq!(model.forward(tiny_input(1, &device)).sample.dims(), [1, 8, 32, 32]);
}

#[test]
fn test_repeated_forward_is_deterministic() {
    let device = Default::default();
    let model: Mmdit<TestBackend> = MmditConfig::tiny().init(None, &device).unwrap();
    let input = tiny_input(2, &device);

    let a = values(model.forward(input.clone()).sample);
    let b = values(model.forward(input).sample);
    assert_eq!(a, b);
}

#[test]
fn test_fully_masked_context_does_not_affect_element() {
    let device = Default::default();
    let model: Mmdit<TestBackend> = MmditConfig::tiny().init(None, &device).unwrap();

    // Element 0 masks its whole context, element 1 keeps it
    let mut valid = vec![false; 8];
    valid.extend(vec![true; 8]);
    let mask = bools::<TestBackend, 2>(valid, [2, 8], &device);

    let input = tiny_input(2, &device).with_context_mask(mask);
    let mut other = input.clone();
    other.context = random([2, 8, 64], &device);

    let a = values(model.forward(input).sample);
    let b = values(model.forward(other).sample);
    let per_element = 4 * 32 * 32;
    assert_close(&a[..per_element], &b[..per_element]);
    assert!(differs(&a[per_element..], &b[per_element..]));
}

#[test]
fn test_masked_context_tokens_are_ignored() {
    let device = Default::default();
    let model: Mmdit<TestBackend> = MmditConfig::tiny().init(None, &device).unwrap();

    // Last three tokens are padding
    let valid: Vec<bool> = (0..8).map(|i| i < 5).collect();
    let mask = bools::<TestBackend, 2>(valid, [1, 8], &device);
    let input = tiny_input(1, &device).with_context_mask(mask);

    let real = input.context.clone().slice([0..1, 0..5, 0..64]);
    let mut other = input.clone();
    other.context = Tensor::cat(vec![real, random([1, 3, 64], &device)], 1);

    assert_close(
        &values(model.forward(input).sample),
        &values(model.forward(other).sample),
    );
}

#[test]
#[should_panic]
fn test_image_mask_length_mismatch_panics() {
    let device = Default::default();
    let model: Mmdit<TestBackend> = MmditConfig::tiny().init(None, &device).unwrap();

    // 32x32 with patch 2 has 256 patches, not 100
    let mask = bools::<TestBackend, 2>(vec![true; 100], [1, 100], &device);
    let _ = model.forward(tiny_input(1, &device).with_x_mask(mask));
}

#[test]
fn test_inference_ignores_dropout_probability() {
    let device = Default::default();
    let model: Mmdit<TestBackend> = MmditConfig::tiny()
        .with_class_dropout(1.0)
        .init(Some(substitutes(128, &device)), &device)
        .unwrap();

    let input = tiny_input(1, &device);
    let mut other = input.clone();
    other.context = random([1, 8, 64], &device);

    // Conditioning still reaches the output at inference
    assert!(differs(
        &values(model.forward(input).sample),
        &values(model.forward(other).sample),
    ));
}

#[test]
fn test_full_dropout_while_training_uses_substitutes() {
    let device = Default::default();
    let model: Mmdit<TrainBackend> = MmditConfig::tiny()
        .with_class_dropout(1.0)
        .init(Some(substitutes(128, &device)), &device)
        .unwrap();

    let input = tiny_input(2, &device);
    let mut other = input.clone();
    other.context = random([2, 8, 64], &device);
    other.conditioning = Some(Conditioning::Pooled(random([2, 64], &device)));

    // Every element is replaced, so the conditioning is irrelevant
    let trained = values(model.forward(input.clone()).sample);
    assert_close(&trained, &values(model.forward(other).sample));

    // Same as forcing every element unconditional at inference
    let inference = model.valid();
    let forced = MmditInput::<TestBackend> {
        x: input.x.inner(),
        t: input.t.inner(),
        conditioning: Some(Conditioning::Pooled(random([2, 64], &device))),
        context: random([2, 8, 64], &device),
        context_mask: None,
        x_mask: None,
        force_drop: Some(bools(vec![true, true], [2], &device)),
    };
    assert_close(&trained, &values(inference.forward(forced).sample));
}

#[test]
fn test_zero_dropout_training_matches_inference() {
    let device = Default::default();
    let model: Mmdit<TrainBackend> = MmditConfig::tiny().init(None, &device).unwrap();
    let input = tiny_input(2, &device);

    let trained = values(model.forward(input.clone()).sample);
    let inference = model.valid();
    let plain = MmditInput::<TestBackend>::new(
        input.x.inner(),
        input.t.inner(),
        input.context.inner(),
    )
    .with_pooled(match input.conditioning {
        Some(Conditioning::Pooled(pooled)) => pooled.inner(),
        _ => unreachable!(),
    });

    assert_close(&trained, &values(inference.forward(plain).sample));
}

#[test]
fn test_force_drop_replaces_only_selected_elements() {
    let device = Default::default();
    let model: Mmdit<TestBackend> = MmditConfig::tiny()
        .with_class_dropout(0.1)
        .init(Some(substitutes(128, &device)), &device)
        .unwrap();

    let input =
        tiny_input(2, &device).with_force_drop(bools(vec![true, false], [2], &device));
    let mut other = input.clone();
    other.context = random([2, 8, 64], &device);
    other.conditioning = Some(Conditioning::Pooled(random([2, 64], &device)));

    let a = values(model.forward(input).sample);
    let b = values(model.forward(other).sample);
    let per_element = 4 * 32 * 32;
    assert_close(&a[..per_element], &b[..per_element]);
    assert!(differs(&a[per_element..], &b[per_element..]));
}

#[test]
#[should_panic(expected = "no unconditional embeddings")]
fn test_force_drop_without_substitutes_panics() {
    let device = Default::default();
    let model: Mmdit<TestBackend> = MmditConfig::tiny().init(None, &device).unwrap();
    let input = tiny_input(2, &device).with_force_drop(bools(vec![true, true], [2], &device));
    let _ = model.forward(input);
}

#[test]
fn test_label_conditioning() {
    let device = Default::default();
    let mut config = MmditConfig::tiny().with_class_dropout(0.1);
    config.class_conditioning = ClassConditioning::Label { num_classes: 10 };
    let model: Mmdit<TestBackend> = config
        .init(Some(substitutes(128, &device)), &device)
        .unwrap();

    let input = MmditInput::new(
        random([2, 4, 32, 32], &device),
        Tensor::from_floats([0.2, 0.7], &device),
        random([2, 8, 64], &device),
    )
    .with_labels(Tensor::from_ints([3, 7], &device));
    assert_eq!(model.forward(input.clone()).sample.dims(), [2, 4, 32, 32]);

    // A dropped element sees the null label whatever its class id
    let forced = input.with_force_drop(bools(vec![true, true], [2], &device));
    let relabeled = forced.clone().with_labels(Tensor::from_ints([0, 9], &device));
    assert_close(
        &values(model.forward(forced).sample),
        &values(model.forward(relabeled).sample),
    );
}

#[test]
#[should_panic]
fn test_labels_on_vector_model_panic() {
    let device = Default::default();
    let model: Mmdit<TestBackend> = MmditConfig::tiny().init(None, &device).unwrap();
    let input = tiny_input(1, &device).with_labels(Tensor::from_ints([1], &device));
    let _ = model.forward(input);
}

#[test]
fn test_pooled_from_context() {
    let device = Default::default();
    let model: Mmdit<TestBackend> = MmditConfig::tiny()
        .with_pooling(Pooling::Mean)
        .init(None, &device)
        .unwrap();

    let mut input = tiny_input(2, &device);
    input.conditioning = None;
    assert_eq!(model.forward(input).sample.dims(), [2, 4, 32, 32]);
}

#[test]
#[should_panic]
fn test_pooling_with_explicit_conditioning_panics() {
    let device = Default::default();
    let model: Mmdit<TestBackend> = MmditConfig::tiny()
        .with_pooling(Pooling::Last)
        .init(None, &device)
        .unwrap();
    let _ = model.forward(tiny_input(1, &device));
}

#[test]
fn test_registers_with_context_mask() {
    let device = Default::default();
    let mut config = MmditConfig::tiny();
    config.register_length = 4;
    let model: Mmdit<TestBackend> = config.init(None, &device).unwrap();
    assert!(model.register.is_some());

    let valid: Vec<bool> = (0..16).map(|i| i % 8 < 6).collect();
    let input = tiny_input(2, &device).with_context_mask(bools(valid, [2, 8], &device));
    assert_eq!(model.forward(input).sample.dims(), [2, 4, 32, 32]);
}

#[test]
fn test_block_variants_forward() {
    let device = Default::default();
    let mut config = MmditConfig::tiny();
    config.norm = NormKind::Rms;
    config.qk_norm = QkNorm::Layer;
    config.modulation = ModulationKind::ScaleOnly;
    config.feed_forward = FeedForwardKind::SwiGlu;
    config.qkv_bias = false;
    let model: Mmdit<TestBackend> = config.init(None, &device).unwrap();

    let out = model.forward(tiny_input(2, &device));
    assert_eq!(out.sample.dims(), [2, 4, 32, 32]);
    assert!(values(out.sample).iter().all(|v| v.is_finite()));
}
