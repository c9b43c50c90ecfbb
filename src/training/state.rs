use serde::{Deserialize, Serialize};

use super::schedule::poly_lr;

/// Lifecycle of a training run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Uninitialized,
    Initialized,
    Training,
    Validating,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EarlyStopping,
    MaxEpochs,
}

/// Progress and best-metric bookkeeping for a run.
///
/// Best values start at `f32::MAX` so that they survive a JSON round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    /// Completed epochs.
    pub epoch: usize,
    pub best_valid_loss: f32,
    pub best_valid_epoch: usize,
    pub best_valid_coord_error: f32,
    pub best_valid_coords_epoch: usize,
    pub epochs_without_improvement: usize,
    pub learning_rate: f64,
    #[serde(default)]
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
}

impl Default for TrainingState {
    fn default() -> Self {
        TrainingState {
            epoch: 0,
            best_valid_loss: f32::MAX,
            best_valid_epoch: 0,
            best_valid_coord_error: f32::MAX,
            best_valid_coords_epoch: 0,
            epochs_without_improvement: 0,
            learning_rate: 0.0,
            phase: Phase::Uninitialized,
            stop_reason: None,
        }
    }
}

impl TrainingState {
    /// Fresh state for a newly constructed trainer.
    pub fn initialized(learning_rate: f64) -> Self {
        TrainingState {
            learning_rate,
            phase: Phase::Initialized,
            ..Default::default()
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.phase == Phase::Stopped
    }

    pub fn with_phase(&self, phase: Phase) -> Self {
        TrainingState {
            phase,
            ..self.clone()
        }
    }
}

/// Aggregated metrics of one finished epoch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochMetrics {
    pub train_loss: f32,
    pub valid_loss: f32,
    pub valid_coord_error: f32,
}

/// Limits that decide when a run ends and how the learning rate decays.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StoppingPolicy {
    pub max_epochs: usize,
    /// Epochs without coordinate-error improvement before stopping. 0 disables.
    pub early_stop_patience: usize,
    pub initial_lr: f64,
    pub poly_exponent: f64,
}

/// What `finish_epoch` decided.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochOutcome {
    pub state: TrainingState,
    pub new_best_loss: bool,
    pub new_best_coord_error: bool,
}

impl EpochOutcome {
    pub fn stopped(&self) -> bool {
        self.state.is_stopped()
    }
}

/// Fold one epoch's metrics into the state.
///
/// Best loss and best coordinate error are tracked independently; only the
/// coordinate error drives the no-improvement counter. Non-finite metrics
/// never count as an improvement.
pub fn finish_epoch(
    state: &TrainingState,
    metrics: &EpochMetrics,
    policy: &StoppingPolicy,
) -> EpochOutcome {
    let mut next = state.clone();
    next.epoch = state.epoch + 1;

    let new_best_loss =
        metrics.valid_loss.is_finite() && metrics.valid_loss < state.best_valid_loss;
    if new_best_loss {
        next.best_valid_loss = metrics.valid_loss;
        next.best_valid_epoch = next.epoch;
    }

    let new_best_coord_error = metrics.valid_coord_error.is_finite()
        && metrics.valid_coord_error < state.best_valid_coord_error;
    if new_best_coord_error {
        next.best_valid_coord_error = metrics.valid_coord_error;
        next.best_valid_coords_epoch = next.epoch;
        next.epochs_without_improvement = 0;
    } else {
        next.epochs_without_improvement = state.epochs_without_improvement + 1;
    }

    next.learning_rate = poly_lr(
        policy.initial_lr,
        next.epoch,
        policy.max_epochs,
        policy.poly_exponent,
    );

    next.stop_reason = if policy.early_stop_patience > 0
        && next.epochs_without_improvement >= policy.early_stop_patience
    {
        Some(StopReason::EarlyStopping)
    } else if next.epoch >= policy.max_epochs {
        Some(StopReason::MaxEpochs)
    } else {
        None
    };
    next.phase = if next.stop_reason.is_some() {
        Phase::Stopped
    } else {
        Phase::Training
    };

    EpochOutcome {
        state: next,
        new_best_loss,
        new_best_coord_error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(patience: usize) -> StoppingPolicy {
        StoppingPolicy {
            max_epochs: 1000,
            early_stop_patience: patience,
            initial_lr: 0.01,
            poly_exponent: 0.9,
        }
    }

    fn metrics(loss: f32, err: f32) -> EpochMetrics {
        EpochMetrics {
            train_loss: loss,
            valid_loss: loss,
            valid_coord_error: err,
        }
    }

    #[test]
    fn test_first_epoch_sets_bests() {
        let state = TrainingState::initialized(0.01);
        let out = finish_epoch(&state, &metrics(2.0, 5.0), &policy(10));
        assert!(out.new_best_loss);
        assert!(out.new_best_coord_error);
        assert_eq!(out.state.epoch, 1);
        assert_eq!(out.state.best_valid_epoch, 1);
        assert_eq!(out.state.best_valid_coords_epoch, 1);
        assert_eq!(out.state.epochs_without_improvement, 0);
        assert_eq!(out.state.phase, Phase::Training);
    }

    #[test]
    fn test_early_stop_exactly_at_patience() {
        let patience = 4;
        let mut state = TrainingState::initialized(0.01);
        state = finish_epoch(&state, &metrics(1.0, 3.0), &policy(patience)).state;

        for i in 1..=patience {
            let out = finish_epoch(&state, &metrics(1.0, 3.5), &policy(patience));
            state = out.state;
            assert_eq!(state.epochs_without_improvement, i);
            if i < patience {
                assert!(!out.new_best_coord_error);
                assert_eq!(state.phase, Phase::Training, "stopped early at {i}");
            }
        }
        assert_eq!(state.phase, Phase::Stopped);
        assert_eq!(state.stop_reason, Some(StopReason::EarlyStopping));
        assert_eq!(state.best_valid_coords_epoch, 1);
    }

    #[test]
    fn test_improvement_resets_counter() {
        let mut state = TrainingState::initialized(0.01);
        state = finish_epoch(&state, &metrics(1.0, 3.0), &policy(3)).state;
        state = finish_epoch(&state, &metrics(1.0, 3.1), &policy(3)).state;
        state = finish_epoch(&state, &metrics(1.0, 3.2), &policy(3)).state;
        assert_eq!(state.epochs_without_improvement, 2);
        state = finish_epoch(&state, &metrics(1.0, 2.9), &policy(3)).state;
        assert_eq!(state.epochs_without_improvement, 0);
        assert_eq!(state.best_valid_coords_epoch, 4);
        assert!(!state.is_stopped());
    }

    #[test]
    fn test_loss_and_coord_error_tracked_independently() {
        let mut state = TrainingState::initialized(0.01);
        state = finish_epoch(&state, &metrics(1.0, 3.0), &policy(10)).state;
        let out = finish_epoch(
            &state,
            &EpochMetrics {
                train_loss: 0.5,
                valid_loss: 0.5,
                valid_coord_error: 4.0,
            },
            &policy(10),
        );
        assert!(out.new_best_loss);
        assert!(!out.new_best_coord_error);
        assert_eq!(out.state.best_valid_epoch, 2);
        assert_eq!(out.state.best_valid_coords_epoch, 1);
        assert_eq!(out.state.epochs_without_improvement, 1);
    }

    #[test]
    fn test_non_finite_is_never_best() {
        let state = TrainingState::initialized(0.01);
        let out = finish_epoch(&state, &metrics(f32::NAN, f32::INFINITY), &policy(10));
        assert!(!out.new_best_loss);
        assert!(!out.new_best_coord_error);
        assert_eq!(out.state.best_valid_loss, f32::MAX);
    }

    #[test]
    fn test_max_epochs_stops() {
        let p = StoppingPolicy {
            max_epochs: 2,
            ..policy(0)
        };
        let mut state = TrainingState::initialized(0.01);
        state = finish_epoch(&state, &metrics(1.0, 3.0), &p).state;
        assert!(!state.is_stopped());
        state = finish_epoch(&state, &metrics(1.0, 3.0), &p).state;
        assert_eq!(state.stop_reason, Some(StopReason::MaxEpochs));
        assert_eq!(state.learning_rate, 0.0);
    }

    #[test]
    fn test_patience_zero_disables_early_stop() {
        let mut state = TrainingState::initialized(0.01);
        for _ in 0..20 {
            state = finish_epoch(&state, &metrics(1.0, 3.0), &policy(0)).state;
        }
        assert!(!state.is_stopped());
        assert_eq!(state.epochs_without_improvement, 19);
    }

    #[test]
    fn test_learning_rate_decays() {
        let state = TrainingState::initialized(0.01);
        let out = finish_epoch(&state, &metrics(1.0, 3.0), &policy(10));
        let expected = 0.01 * (1.0f64 - 1.0 / 1000.0).powf(0.9);
        assert!((out.state.learning_rate - expected).abs() < 1e-12);
    }

    #[test]
    fn test_state_json_roundtrip_keeps_max_sentinel() {
        let state = TrainingState::initialized(0.01);
        let json = serde_json::to_string(&state).unwrap();
        let back: TrainingState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
        assert_eq!(back.best_valid_loss, f32::MAX);
    }
}
