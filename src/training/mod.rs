//! Training infrastructure: the epoch loop, loss scaling with global-norm
//! gradient clipping, learning-rate and checkpoint schedules, run state,
//! prediction and per-epoch metrics.

pub mod gradients;
pub mod inference;
pub mod metrics;
pub mod scaler;
pub mod schedule;
pub mod state;
pub mod trainer;

pub use gradients::{clip_coefficient, scale_gradients, squared_norm};
pub use inference::{EvaluationMode, Prediction, Predictor};
pub use metrics::{EpochSummary, LogSink, MetricsHistory, MetricsSink};
pub use scaler::{GradScaler, GradScalerState};
pub use schedule::{poly_lr, CheckpointSchedule, ScheduleStage};
pub use state::{finish_epoch, EpochMetrics, EpochOutcome, Phase, StopReason, StoppingPolicy, TrainingState};
pub use trainer::{Trainer, TrainerConfig};
