use std::fmt;
use std::str::FromStr;

use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Per-level heatmap loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LossKind {
    /// Mean squared error over pixels, summed over landmarks, averaged over
    /// the batch.
    Mse,
    /// Adaptive Wing loss on heatmaps normalised by the peak amplitude.
    Awl,
}

impl LossKind {
    pub fn name(&self) -> &'static str {
        match self {
            LossKind::Mse => "mse",
            LossKind::Awl => "awl",
        }
    }
}

impl fmt::Display for LossKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for LossKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mse" => Ok(LossKind::Mse),
            "awl" => Ok(LossKind::Awl),
            other => Err(ConfigError::Unsupported {
                kind: "loss function",
                name: other.to_string(),
                expected: "mse, awl".into(),
            }),
        }
    }
}

/// Adaptive Wing loss hyperparameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdaptiveWing {
    pub alpha: f32,
    pub omega: f32,
    pub epsilon: f32,
    pub theta: f32,
}

impl Default for AdaptiveWing {
    fn default() -> Self {
        AdaptiveWing {
            alpha: 2.1,
            omega: 14.0,
            epsilon: 1.0,
            theta: 0.5,
        }
    }
}

impl AdaptiveWing {
    /// Mean loss over every element. Inputs are expected in `[0, 1]`.
    pub fn forward<B: Backend, const D: usize>(
        &self,
        pred: Tensor<B, D>,
        target: Tensor<B, D>,
    ) -> Tensor<B, 1> {
        let delta = (target.clone() - pred).abs();
        let power = target.neg().add_scalar(self.alpha);
        let ratio = self.theta / self.epsilon;

        // (theta/eps)^(alpha - y) and (theta/eps)^(alpha - y - 1)
        let ratio_pow = power.clone().mul_scalar(ratio.ln()).exp();
        let ratio_pow_m1 = power.clone().sub_scalar(1.0).mul_scalar(ratio.ln()).exp();

        let a = ratio_pow_m1
            .mul(power.clone())
            .div(ratio_pow.clone().add_scalar(1.0))
            .mul_scalar(self.omega / self.epsilon);
        let c = a.clone().mul_scalar(self.theta) - ratio_pow.log1p().mul_scalar(self.omega);

        let near = delta
            .clone()
            .div_scalar(self.epsilon)
            .powf(power)
            .log1p()
            .mul_scalar(self.omega);
        let far = a.mul(delta.clone()) - c;

        far.mask_where(delta.lower_elem(self.theta), near).mean()
    }
}

/// Deep-supervision weights for `n` levels, coarsest first.
///
/// Raw weights are `1/2^i` with `i = 0` at the finest level, normalised to
/// sum to one, so they are non-decreasing from coarsest to finest.
pub fn supervision_weights(n: usize) -> Vec<f32> {
    let mut weights: Vec<f32> = (0..n).map(|i| 1.0 / (1u64 << i.min(63)) as f32).collect();
    weights.reverse();
    let total: f32 = weights.iter().sum();
    if total > 0.0 {
        for w in &mut weights {
            *w /= total;
        }
    }
    weights
}

/// Weighted sum of per-level losses over the supervised levels.
#[derive(Debug, Clone)]
pub struct DeepSupervisionLoss {
    kind: LossKind,
    weights: Vec<f32>,
    lambda_scale: f32,
    awl: AdaptiveWing,
}

impl DeepSupervisionLoss {
    pub fn new(kind: LossKind, num_supervised: usize, lambda_scale: f32) -> Self {
        DeepSupervisionLoss {
            kind,
            weights: supervision_weights(num_supervised),
            lambda_scale,
            awl: AdaptiveWing::default(),
        }
    }

    pub fn kind(&self) -> LossKind {
        self.kind
    }

    pub fn weights(&self) -> &[f32] {
        &self.weights
    }

    pub fn num_supervised(&self) -> usize {
        self.weights.len()
    }

    /// Loss of a single level.
    pub fn level_loss<B: Backend>(&self, pred: Tensor<B, 4>, target: Tensor<B, 4>) -> Tensor<B, 1> {
        match self.kind {
            LossKind::Mse => {
                let [batch, landmarks, _, _] = pred.dims();
                let diff = pred - target;
                (diff.clone() * diff)
                    .mean_dim(3)
                    .mean_dim(2)
                    .reshape([batch, landmarks])
                    .sum_dim(1)
                    .mean()
            }
            LossKind::Awl => {
                let scale = if self.lambda_scale > 0.0 { self.lambda_scale } else { 1.0 };
                self.awl
                    .forward(pred.div_scalar(scale), target.div_scalar(scale))
            }
        }
    }

    /// `outputs` and `targets` hold the supervised levels, coarsest first,
    /// and must both have `num_supervised()` entries.
    pub fn forward<B: Backend>(
        &self,
        outputs: &[Tensor<B, 4>],
        targets: &[Tensor<B, 4>],
    ) -> Tensor<B, 1> {
        debug_assert_eq!(outputs.len(), self.weights.len());
        debug_assert_eq!(targets.len(), self.weights.len());

        outputs
            .iter()
            .zip(targets)
            .zip(&self.weights)
            .map(|((pred, target), &w)| self.level_loss(pred.clone(), target.clone()).mul_scalar(w))
            .reduce(|acc, l| acc + l)
            .unwrap_or_else(|| {
                let device = targets
                    .first()
                    .map(|t| t.device())
                    .unwrap_or_default();
                Tensor::zeros([1], &device)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::TensorData;

    type TestBackend = NdArray<f32>;

    fn scalar(t: Tensor<TestBackend, 1>) -> f32 {
        t.into_scalar()
    }

    #[test]
    fn test_weights_sum_to_one_and_increase() {
        for n in 1..=6 {
            let w = supervision_weights(n);
            assert_eq!(w.len(), n);
            assert!((w.iter().sum::<f32>() - 1.0).abs() < 1e-6);
            assert!(w.windows(2).all(|p| p[0] <= p[1]), "{w:?}");
        }
        let w = supervision_weights(3);
        assert!((w[2] - 4.0 / 7.0).abs() < 1e-6);
        assert!((w[0] - 1.0 / 7.0).abs() < 1e-6);
    }

    #[test]
    fn test_loss_kind_parse() {
        assert_eq!("mse".parse::<LossKind>().unwrap(), LossKind::Mse);
        assert_eq!("awl".parse::<LossKind>().unwrap(), LossKind::Awl);
        assert!(matches!(
            "l1".parse::<LossKind>(),
            Err(ConfigError::Unsupported { .. })
        ));
    }

    #[test]
    fn test_mse_sums_landmarks_and_averages_batch() {
        let device = Default::default();
        // batch 2, 2 landmarks, 1x2 pixels
        let pred = Tensor::<TestBackend, 1>::from_data(
            TensorData::new(vec![1.0f32, 1.0, 2.0, 0.0, 0.0, 0.0, 0.0, 0.0], [8]),
            &device,
        )
        .reshape([2, 2, 1, 2]);
        let target = Tensor::<TestBackend, 4>::zeros([2, 2, 1, 2], &device);

        let loss = DeepSupervisionLoss::new(LossKind::Mse, 1, 1.0);
        // sample 0: landmark means 1.0 and 2.0 -> 3.0; sample 1: 0.0
        let value = scalar(loss.level_loss(pred, target));
        assert!((value - 1.5).abs() < 1e-6, "{value}");
    }

    #[test]
    fn test_zero_error_is_zero_loss() {
        let device = Default::default();
        let t = Tensor::<TestBackend, 4>::ones([1, 2, 4, 4], &device).mul_scalar(0.3);
        for kind in [LossKind::Mse, LossKind::Awl] {
            let loss = DeepSupervisionLoss::new(kind, 1, 1.0);
            let value = scalar(loss.level_loss(t.clone(), t.clone()));
            assert!(value.abs() < 1e-6, "{kind}: {value}");
        }
    }

    #[test]
    fn test_awl_is_continuous_at_theta() {
        let device = Default::default();
        let awl = AdaptiveWing::default();
        let target = Tensor::<TestBackend, 1>::zeros([2], &device);
        let pred = Tensor::<TestBackend, 1>::from_data(
            TensorData::new(vec![0.5f32 - 1e-4, 0.5 + 1e-4], [2]),
            &device,
        );
        let below = scalar(awl.forward(pred.clone().slice([0..1]), target.clone().slice([0..1])));
        let above = scalar(awl.forward(pred.slice([1..2]), target.slice([1..2])));
        assert!((below - above).abs() < 1e-2, "{below} vs {above}");
    }

    #[test]
    fn test_awl_grows_with_error() {
        let device = Default::default();
        let awl = AdaptiveWing::default();
        let target = Tensor::<TestBackend, 1>::zeros([1], &device);
        let mut last = -1.0;
        for e in [0.05f32, 0.2, 0.6, 1.0] {
            let pred = Tensor::<TestBackend, 1>::from_data(TensorData::new(vec![e], [1]), &device);
            let v = scalar(awl.forward(pred, target.clone()));
            assert!(v > last);
            last = v;
        }
    }

    #[test]
    fn test_deep_supervision_weighted_sum() {
        let device = Default::default();
        let loss = DeepSupervisionLoss::new(LossKind::Mse, 2, 1.0);
        let coarse_pred = Tensor::<TestBackend, 4>::ones([1, 1, 2, 2], &device);
        let fine_pred = Tensor::<TestBackend, 4>::ones([1, 1, 4, 4], &device).mul_scalar(2.0);
        let outputs = vec![coarse_pred, fine_pred];
        let targets = vec![
            Tensor::<TestBackend, 4>::zeros([1, 1, 2, 2], &device),
            Tensor::<TestBackend, 4>::zeros([1, 1, 4, 4], &device),
        ];
        // weights [1/3, 2/3]; level losses 1 and 4
        let value = scalar(loss.forward(&outputs, &targets));
        assert!((value - 3.0).abs() < 1e-5, "{value}");
    }
}
