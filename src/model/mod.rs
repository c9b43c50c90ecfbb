//! Network, loss and learnable sigma modules.

pub mod loss;
pub mod network;
pub mod sigma;

pub use loss::{supervision_weights, AdaptiveWing, DeepSupervisionLoss, LossKind};
pub use network::{HeatmapNetwork, PyramidNet, PyramidNetConfig};
pub use sigma::SigmaParams;
