use burn::module::{Module, Param};
use burn::prelude::*;
use burn::tensor::TensorData;

use crate::error::DataError;

/// Learnable per-landmark Gaussian spread.
#[derive(Module, Debug)]
pub struct SigmaParams<B: Backend> {
    pub sigmas: Param<Tensor<B, 1>>,
}

impl<B: Backend> SigmaParams<B> {
    pub fn new(values: &[f32], device: &B::Device) -> Self {
        let tensor = Tensor::from_data(TensorData::new(values.to_vec(), [values.len()]), device);
        SigmaParams {
            sigmas: Param::from_tensor(tensor),
        }
    }

    /// One sigma per landmark, filled with `value`.
    pub fn uniform(value: f32, num_landmarks: usize, device: &B::Device) -> Self {
        Self::new(&vec![value; num_landmarks], device)
    }

    pub fn len(&self) -> usize {
        self.sigmas.val().dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Host snapshot of the current values, used for label generation.
    pub fn values(&self) -> Result<Vec<f32>, DataError> {
        self.sigmas
            .val()
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| DataError::TensorRead(format!("{e:?}")))
    }

    /// `mean(sigma^2)`, penalising wide Gaussians.
    pub fn regularization(&self) -> Tensor<B, 1> {
        self.sigmas.val().powf_scalar(2.0).mean()
    }
}
