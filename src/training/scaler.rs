use burn::module::AutodiffModule;
use burn::optim::GradientsParams;
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use log::debug;
use serde::{Deserialize, Serialize};

use super::gradients::scale_gradients;

/// Persisted dynamic loss-scale state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradScalerState {
    pub scale: f32,
    pub growth_factor: f32,
    pub backoff_factor: f32,
    pub growth_interval: usize,
    pub growth_tracker: usize,
}

impl Default for GradScalerState {
    fn default() -> Self {
        GradScalerState {
            scale: 65536.0,
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2000,
            growth_tracker: 0,
        }
    }
}

/// Dynamic loss scaling.
///
/// The loss is multiplied by `scale` before backward; gradients are divided by
/// it again before clipping and the optimiser step. When any gradient is
/// non-finite the step is skipped and the scale backs off; after
/// `growth_interval` clean steps in a row it grows.
#[derive(Debug, Clone, PartialEq)]
pub struct GradScaler {
    state: GradScalerState,
}

impl Default for GradScaler {
    fn default() -> Self {
        Self::from_state(GradScalerState::default())
    }
}

impl GradScaler {
    pub fn from_state(state: GradScalerState) -> Self {
        GradScaler { state }
    }

    pub fn state(&self) -> &GradScalerState {
        &self.state
    }

    pub fn scale_value(&self) -> f32 {
        self.state.scale
    }

    pub fn scale<B: Backend, const D: usize>(&self, loss: Tensor<B, D>) -> Tensor<B, D> {
        loss.mul_scalar(self.state.scale)
    }

    /// Divide every gradient of `module` by the current scale.
    ///
    /// Returns the unscaled gradients and whether all of them are finite.
    pub fn unscale<B, M>(&self, module: &M, grads: GradientsParams) -> (GradientsParams, bool)
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
    {
        scale_gradients::<B, M>(module, grads, 1.0 / self.state.scale)
    }

    /// Adjust the scale after a step attempt.
    pub fn update(&mut self, found_non_finite: bool) {
        if found_non_finite {
            self.state.scale *= self.state.backoff_factor;
            self.state.growth_tracker = 0;
            debug!("non-finite gradients, loss scale backed off to {}", self.state.scale);
        } else {
            self.state.growth_tracker += 1;
            if self.state.growth_tracker >= self.state.growth_interval {
                self.state.scale *= self.state.growth_factor;
                self.state.growth_tracker = 0;
                debug!("loss scale grown to {}", self.state.scale);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SigmaParams;
    use burn::backend::{Autodiff, NdArray};

    type TrainBackend = Autodiff<NdArray<f32>>;

    #[test]
    fn test_backoff_and_growth() {
        let mut scaler = GradScaler::from_state(GradScalerState {
            growth_interval: 3,
            ..Default::default()
        });
        scaler.update(true);
        assert_eq!(scaler.scale_value(), 32768.0);
        for _ in 0..2 {
            scaler.update(false);
        }
        assert_eq!(scaler.scale_value(), 32768.0);
        scaler.update(false);
        assert_eq!(scaler.scale_value(), 65536.0);
        assert_eq!(scaler.state().growth_tracker, 0);
    }

    #[test]
    fn test_non_finite_resets_tracker() {
        let mut scaler = GradScaler::from_state(GradScalerState {
            growth_interval: 2,
            ..Default::default()
        });
        scaler.update(false);
        scaler.update(true);
        scaler.update(false);
        assert_eq!(scaler.scale_value(), 32768.0);
    }

    #[test]
    fn test_unscale_restores_true_gradient() {
        let device = Default::default();
        let sigmas = SigmaParams::<TrainBackend>::new(&[1.0, 2.0], &device);
        let scaler = GradScaler::from_state(GradScalerState {
            scale: 1024.0,
            ..Default::default()
        });

        let loss = scaler.scale(sigmas.regularization());
        let grads = GradientsParams::from_grads(loss.backward(), &sigmas);
        let (mut grads, finite) = scaler.unscale(&sigmas, grads);
        assert!(finite);

        let grad = grads
            .remove::<NdArray<f32>, 1>(sigmas.sigmas.id)
            .unwrap()
            .into_data()
            .to_vec::<f32>()
            .unwrap();
        // d/ds mean(s^2) = s
        assert!((grad[0] - 1.0).abs() < 1e-5);
        assert!((grad[1] - 2.0).abs() < 1e-5);
    }

    #[test]
    fn test_unscale_detects_overflow() {
        let device = Default::default();
        let sigmas = SigmaParams::<TrainBackend>::new(&[1e36, 1e36], &device);
        let scaler = GradScaler::default();
        let loss = scaler.scale(sigmas.regularization());
        let grads = GradientsParams::from_grads(loss.backward(), &sigmas);
        let (_, finite) = scaler.unscale(&sigmas, grads);
        assert!(!finite);
    }

    #[test]
    fn test_state_json_roundtrip() {
        let state = GradScalerState {
            scale: 512.0,
            growth_tracker: 17,
            ..Default::default()
        };
        let json = serde_json::to_string(&state).unwrap();
        assert_eq!(serde_json::from_str::<GradScalerState>(&json).unwrap(), state);
    }
}
