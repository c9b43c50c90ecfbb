//! Whole-module gradient operations: scaling, norms and global-norm clipping.

use std::marker::PhantomData;

use burn::module::{AutodiffModule, ModuleVisitor, ParamId};
use burn::optim::GradientsParams;
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::ElementConversion;

/// Multiply every gradient of `module` by `factor`.
///
/// Returns the scaled gradients and whether all of them are finite.
pub fn scale_gradients<B, M>(
    module: &M,
    grads: GradientsParams,
    factor: f32,
) -> (GradientsParams, bool)
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    let mut visitor = ScaleVisitor::<B> {
        grads,
        factor,
        found_non_finite: false,
        _backend: PhantomData,
    };
    module.visit(&mut visitor);
    (visitor.grads, !visitor.found_non_finite)
}

/// Sum of squared gradient entries over the parameters of `module`.
pub fn squared_norm<B, M>(module: &M, grads: &GradientsParams) -> f32
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    let mut visitor = NormVisitor::<B> {
        grads,
        sum_sq: 0.0,
        _backend: PhantomData,
    };
    module.visit(&mut visitor);
    visitor.sum_sq
}

/// Factor that brings a gradient vector of norm `total_norm` down to
/// `max_norm`, never above 1.
pub fn clip_coefficient(total_norm: f32, max_norm: f32) -> f32 {
    (max_norm / (total_norm + 1e-6)).min(1.0)
}

struct ScaleVisitor<B: AutodiffBackend> {
    grads: GradientsParams,
    factor: f32,
    found_non_finite: bool,
    _backend: PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for ScaleVisitor<B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        let Some(grad) = self.grads.remove::<B::InnerBackend, D>(id) else {
            return;
        };
        let grad = grad.mul_scalar(self.factor);
        let magnitude: f32 = grad.clone().abs().sum().into_scalar().elem();
        if !magnitude.is_finite() {
            self.found_non_finite = true;
        }
        self.grads.register::<B::InnerBackend, D>(id, grad);
    }
}

struct NormVisitor<'a, B: AutodiffBackend> {
    grads: &'a GradientsParams,
    sum_sq: f32,
    _backend: PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for NormVisitor<'_, B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        if let Some(grad) = self.grads.get::<B::InnerBackend, D>(id) {
            let sum_sq: f32 = grad.clone().mul(grad).sum().into_scalar().elem();
            self.sum_sq += sum_sq;
        }
    }
}
