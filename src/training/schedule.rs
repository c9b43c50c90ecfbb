use serde::{Deserialize, Serialize};

/// Polynomial decay: `initial * (1 - epoch / max_epochs)^exponent`, reaching
/// zero at `max_epochs`.
pub fn poly_lr(initial: f64, epoch: usize, max_epochs: usize, exponent: f64) -> f64 {
    if max_epochs == 0 {
        return 0.0;
    }
    let progress = (epoch as f64 / max_epochs as f64).min(1.0);
    initial * (1.0 - progress).powf(exponent)
}

/// Periodic checkpoint interval for epochs below `until_epoch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleStage {
    pub until_epoch: usize,
    pub every: usize,
}

/// Growing periodic-checkpoint interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointSchedule {
    /// Interval once every stage has passed.
    pub then_every: usize,
    /// Stages in ascending `until_epoch` order.
    pub stages: Vec<ScheduleStage>,
}

impl Default for CheckpointSchedule {
    fn default() -> Self {
        CheckpointSchedule {
            then_every: 100,
            stages: vec![
                ScheduleStage {
                    until_epoch: 150,
                    every: 25,
                },
                ScheduleStage {
                    until_epoch: 500,
                    every: 50,
                },
            ],
        }
    }
}

impl CheckpointSchedule {
    pub fn interval_at(&self, epoch: usize) -> usize {
        self.stages
            .iter()
            .find(|stage| epoch < stage.until_epoch)
            .map(|stage| stage.every)
            .unwrap_or(self.then_every)
    }

    /// Whether a periodic checkpoint is due after `epoch` completed epochs.
    pub fn is_due(&self, epoch: usize) -> bool {
        let every = self.interval_at(epoch);
        epoch > 0 && every > 0 && epoch % every == 0
    }
}
