use serde::{Deserialize, Deserializer, Serialize};

use crate::training::scaler::GradScalerState;
use crate::training::state::TrainingState;

/// Why a checkpoint was written. Each kind lives in its own directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointKind {
    Periodic,
    BestValidLoss,
    BestCoordError,
    Final,
}

impl CheckpointKind {
    pub fn dir_name(&self, epoch: usize) -> String {
        match self {
            CheckpointKind::Periodic => format!("model_ep_{epoch:05}"),
            CheckpointKind::BestValidLoss => "best_valid_loss".to_string(),
            CheckpointKind::BestCoordError => "best_valid_coord_error".to_string(),
            CheckpointKind::Final => "final".to_string(),
        }
    }
}

/// Metrics snapshot at checkpoint time. Non-finite values are written as
/// `null` and read back as NaN.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetrics {
    #[serde(deserialize_with = "nan_from_null")]
    pub train_loss: f32,
    #[serde(deserialize_with = "nan_from_null")]
    pub valid_loss: f32,
    #[serde(deserialize_with = "nan_from_null")]
    pub valid_coord_error: f32,
}

fn nan_from_null<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f32, D::Error> {
    Ok(Option::<f32>::deserialize(deserializer)?.unwrap_or(f32::NAN))
}

/// Hyperparameters recorded in checkpoint metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointHyperparameters {
    pub base_lr: f64,
    pub learning_rate: f64,
    pub loss_function: String,
    pub num_res_supervisions: usize,
    pub lambda_scale: f32,
    pub regress_sigma: bool,
    pub use_amp: bool,
    pub max_grad_norm: f32,
    pub batch_size: usize,
}

/// Top-level checkpoint metadata written to metadata.json.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub epoch: usize,
    pub timestamp: u64,
    pub kind: CheckpointKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fold: Option<usize>,
    pub metrics: CheckpointMetrics,
    pub hyperparameters: CheckpointHyperparameters,
}

/// Resumable state written to training_state.json.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    #[serde(flatten)]
    pub training: TrainingState,
    pub sigmas: Vec<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amp_grad_scaler: Option<GradScalerState>,
}
