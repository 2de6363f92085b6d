//! Classifier-free-guidance conditioning dropout
//!
//! During training a random subset of batch elements has its conditioning
//! replaced by precomputed unconditional substitutes: the context sequence,
//! its mask, and the pooled class vector. The surgery is a vectorised
//! select over the batch, so every element takes the same code path.

use burn::prelude::*;
use burn::tensor::Distribution;

use crate::error::MmditError;

/// Precomputed unconditional substitutes, in hidden space
///
/// Constants of the model, never trained.
#[derive(Module, Debug)]
pub struct UnconditionalEmbeddings<B: Backend> {
    /// `[uncond_len, hidden]`
    pub context: Tensor<B, 2>,
    /// `[hidden]`
    pub pooled: Tensor<B, 1>,
}

impl<B: Backend> UnconditionalEmbeddings<B> {
    pub fn new(context: Tensor<B, 2>, pooled: Tensor<B, 1>) -> Self {
        Self { context, pooled }
    }

    /// Number of valid unconditional context tokens
    pub fn len(&self) -> usize {
        self.context.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Checks the substitutes against the model's hidden width and context length
    pub fn validate(&self, hidden_size: usize, context_len: usize) -> Result<(), MmditError> {
        let [len, width] = self.context.dims();
        if width != hidden_size || len == 0 || len > context_len {
            return Err(MmditError::UnconditionalShape {
                what: "context",
                expected: format!("[1..={context_len}, {hidden_size}]"),
                actual: vec![len, width],
            });
        }
        let [pooled] = self.pooled.dims();
        if pooled != hidden_size {
            return Err(MmditError::UnconditionalShape {
                what: "pooled vector",
                expected: format!("[{hidden_size}]"),
                actual: vec![pooled],
            });
        }
        Ok(())
    }
}

/// Selects batch elements for unconditional training and swaps in substitutes
#[derive(Module, Debug)]
pub struct ConditioningDropout<B: Backend> {
    pub prob: f64,
    pub uncond: Option<UnconditionalEmbeddings<B>>,
}

impl<B: Backend> ConditioningDropout<B> {
    /// Creates the policy, validating the substitutes
    ///
    /// Fails with [`MmditError::MissingUnconditional`] when `prob > 0` and no
    /// substitutes are given.
    pub fn new(
        prob: f64,
        uncond: Option<UnconditionalEmbeddings<B>>,
        hidden_size: usize,
        context_len: usize,
    ) -> Result<Self, MmditError> {
        match &uncond {
            Some(uncond) => uncond.validate(hidden_size, context_len)?,
            None if prob > 0.0 => return Err(MmditError::MissingUnconditional { prob }),
            None => {}
        }
        Ok(Self { prob, uncond })
    }

    /// True when random selection happens: training mode and `prob > 0`
    ///
    /// Training mode is an autodiff backend, the same test burn's own
    /// `Dropout` makes.
    pub fn is_active(&self) -> bool {
        B::ad_enabled() && self.prob > 0.0
    }

    pub fn has_substitutes(&self) -> bool {
        self.uncond.is_some()
    }

    /// Picks the batch elements to make unconditional
    ///
    /// An explicit `force` selection wins; otherwise each element is drawn
    /// with probability `prob` while training. Returns `None` when nothing
    /// can be selected.
    pub fn select(
        &self,
        batch: usize,
        force: Option<Tensor<B, 1, Bool>>,
        device: &B::Device,
    ) -> Option<Tensor<B, 1, Bool>> {
        match force {
            Some(force) => {
                assert_eq!(force.dims(), [batch], "force_drop must have one entry per element");
                Some(force)
            }
            None if self.is_active() => Some(
                Tensor::<B, 1>::random([batch], Distribution::Uniform(0.0, 1.0), device)
                    .lower_elem(self.prob),
            ),
            None => None,
        }
    }

    /// Replaces the conditioning of `selected` elements by the substitutes
    ///
    /// Selected elements get the unconditional context in their first
    /// `uncond_len` positions and zeros after, a mask that is valid exactly
    /// on those positions, and the unconditional pooled vector. Other
    /// elements pass through unchanged. A missing mask is treated as all
    /// valid and always returned materialized.
    ///
    /// # Panics
    ///
    /// If no substitutes were supplied or the shapes disagree.
    pub fn apply_selected(
        &self,
        context: Tensor<B, 3>,
        mask: Option<Tensor<B, 2, Bool>>,
        pooled: Option<Tensor<B, 2>>,
        selected: Tensor<B, 1, Bool>,
    ) -> (Tensor<B, 3>, Tensor<B, 2, Bool>, Option<Tensor<B, 2>>) {
        let uncond = self
            .uncond
            .as_ref()
            .unwrap_or_else(|| panic!("conditioning dropout has no unconditional embeddings"));
        let [batch, len, hidden] = context.dims();
        let device = context.device();
        let uncond_len = uncond.len();
        assert!(uncond_len <= len, "unconditional context longer than the sequence");
        assert_eq!(selected.dims(), [batch], "selection must have one entry per element");

        let padded = if uncond_len < len {
            Tensor::cat(
                vec![
                    uncond.context.clone(),
                    Tensor::zeros([len - uncond_len, hidden], &device),
                ],
                0,
            )
        } else {
            uncond.context.clone()
        };
        let padded = padded.reshape([1, len, hidden]).repeat_dim(0, batch);

        let sel_rows = selected.reshape([batch, 1]);
        let context = context.mask_where(
            sel_rows
                .clone()
                .reshape([batch, 1, 1])
                .repeat_dim(1, len)
                .repeat_dim(2, hidden),
            padded,
        );

        let mask = mask.unwrap_or_else(|| Tensor::<B, 2, Int>::ones([batch, len], &device).bool());
        assert_eq!(mask.dims(), [batch, len], "context mask does not match the context");
        let uncond_mask = Tensor::<B, 1, Int>::arange(0..len as i64, &device)
            .lower_elem(uncond_len as i64)
            .int()
            .reshape([1, len])
            .repeat_dim(0, batch);
        let mask = mask
            .int()
            .mask_where(sel_rows.clone().repeat_dim(1, len), uncond_mask)
            .bool();

        let pooled = pooled.map(|pooled| {
            assert_eq!(pooled.dims(), [batch, hidden], "pooled vector must be [batch, hidden]");
            let substitute = uncond.pooled.clone().reshape([1, hidden]).repeat_dim(0, batch);
            pooled.mask_where(sel_rows.repeat_dim(1, hidden), substitute)
        });

        (context, mask, pooled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::Autodiff;
    use burn::tensor::TensorData;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;
    type TrainBackend = Autodiff<TestBackend>;

    fn substitutes<B: Backend>(device: &B::Device) -> UnconditionalEmbeddings<B> {
        UnconditionalEmbeddings::new(
            Tensor::from_floats([[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]], device),
            Tensor::from_floats([-1.0, -2.0, -3.0], device),
        )
    }

    #[test]
    fn test_missing_substitutes_is_an_error() {
        let err = ConditioningDropout::<TestBackend>::new(0.1, None, 3, 4).unwrap_err();
        assert_eq!(err, MmditError::MissingUnconditional { prob: 0.1 });

        assert!(ConditioningDropout::<TestBackend>::new(0.0, None, 3, 4).is_ok());
    }

    #[test]
    fn test_substitute_shapes_are_checked() {
        let device = Default::default();
        // hidden 4 does not match width 3
        let err = ConditioningDropout::new(0.1, Some(substitutes::<TestBackend>(&device)), 4, 4);
        assert!(matches!(err, Err(MmditError::UnconditionalShape { what: "context", .. })));

        // uncond length 2 exceeds context length 1
        let err = ConditioningDropout::new(0.1, Some(substitutes::<TestBackend>(&device)), 3, 1);
        assert!(err.is_err());
    }

    #[test]
    fn test_inference_never_selects() {
        let device = Default::default();
        let dropout =
            ConditioningDropout::new(1.0, Some(substitutes::<TestBackend>(&device)), 3, 4).unwrap();
        assert!(!dropout.is_active());
        assert!(dropout.select(2, None, &device).is_none());
    }

    #[test]
    fn test_training_with_zero_prob_never_selects() {
        let device = Default::default();
        let dropout = ConditioningDropout::<TrainBackend>::new(0.0, None, 3, 4).unwrap();
        assert!(!dropout.is_active());
        assert!(dropout.select(2, None, &device).is_none());
    }

    #[test]
    fn test_training_with_full_prob_selects_everything() {
        let device = Default::default();
        let dropout =
            ConditioningDropout::new(1.0, Some(substitutes::<TrainBackend>(&device)), 3, 4).unwrap();
        assert!(dropout.is_active());

        let selected: Vec<bool> = dropout
            .select(5, None, &device)
            .unwrap()
            .into_data()
            .to_vec()
            .unwrap();
        assert_eq!(selected, vec![true; 5]);
    }

    #[test]
    fn test_apply_selected_replaces_only_selected_rows() {
        let device = Default::default();
        let dropout =
            ConditioningDropout::new(0.5, Some(substitutes::<TestBackend>(&device)), 3, 4).unwrap();

        let context = Tensor::<TestBackend, 3>::full([2, 4, 3], 9.0, &device);
        let pooled = Tensor::<TestBackend, 2>::full([2, 3], 7.0, &device);
        let selected = Tensor::<TestBackend, 1, Bool>::from_data(
            TensorData::new(vec![true, false], [2]),
            &device,
        );

        let (context, mask, pooled) = dropout.apply_selected(context, None, Some(pooled), selected);

        let context: Vec<f32> = context.into_data().to_vec().unwrap();
        assert_eq!(
            &context[0..12],
            &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]
        );
        assert!(context[12..].iter().all(|v| *v == 9.0));

        let mask: Vec<bool> = mask.into_data().to_vec().unwrap();
        assert_eq!(mask, vec![true, true, false, false, true, true, true, true]);

        let pooled: Vec<f32> = pooled.unwrap().into_data().to_vec().unwrap();
        assert_eq!(pooled, vec![-1.0, -2.0, -3.0, 7.0, 7.0, 7.0]);
    }

    #[test]
    fn test_apply_selected_keeps_existing_mask_for_unselected() {
        let device = Default::default();
        let dropout =
            ConditioningDropout::new(0.5, Some(substitutes::<TestBackend>(&device)), 3, 4).unwrap();

        let mask = Tensor::<TestBackend, 2, Bool>::from_data(
            TensorData::new(vec![true, true, true, false, true, false, false, false], [2, 4]),
            &device,
        );
        let selected = Tensor::<TestBackend, 1, Bool>::from_data(
            TensorData::new(vec![false, true], [2]),
            &device,
        );

        let (_, mask, pooled) = dropout.apply_selected(
            Tensor::zeros([2, 4, 3], &device),
            Some(mask),
            None,
            selected,
        );

        let mask: Vec<bool> = mask.into_data().to_vec().unwrap();
        assert_eq!(mask, vec![true, true, true, false, true, true, false, false]);
        assert!(pooled.is_none());
    }
}
