use log::info;
use serde::{Deserialize, Serialize};

/// Per-epoch summary handed to a [`MetricsSink`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochSummary {
    pub epoch: usize,
    pub train_loss: f32,
    pub valid_loss: f32,
    pub valid_coord_error: f32,
    pub duration_secs: f64,
    pub learning_rate: f64,
    /// First learnable sigma, if any.
    pub sigma: Option<f32>,
    /// Optimiser steps skipped by the loss scaler this epoch.
    pub skipped_steps: usize,
}

/// Receiver for per-epoch metrics.
pub trait MetricsSink {
    fn record_epoch(&mut self, summary: &EpochSummary);
}

/// Writes each epoch summary to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl MetricsSink for LogSink {
    fn record_epoch(&mut self, s: &EpochSummary) {
        let sigma = s
            .sigma
            .map(|v| format!(" | sigma: {v:.3}"))
            .unwrap_or_default();
        info!(
            "Epoch {} | train_loss: {:.5} | valid_loss: {:.5} | coord_err: {:.3} px | lr: {:.3e} | {:.1}s{}",
            s.epoch, s.train_loss, s.valid_loss, s.valid_coord_error, s.learning_rate, s.duration_secs, sigma,
        );
        if s.skipped_steps > 0 {
            info!("  >> {} optimiser steps skipped (non-finite gradients)", s.skipped_steps);
        }
    }
}

/// In-memory record of every epoch.
#[derive(Debug, Default, Clone)]
pub struct MetricsHistory {
    epochs: Vec<EpochSummary>,
}

impl MetricsHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn epochs(&self) -> &[EpochSummary] {
        &self.epochs
    }

    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    pub fn last(&self) -> Option<&EpochSummary> {
        self.epochs.last()
    }

    /// Average training loss over the last N epochs.
    pub fn average_train_loss(&self, last_n: usize) -> f32 {
        let n = self.epochs.len().min(last_n);
        if n == 0 {
            return 0.0;
        }
        let sum: f32 = self.epochs.iter().rev().take(n).map(|e| e.train_loss).sum();
        sum / n as f32
    }

    /// Lowest validation coordinate error seen, with its epoch.
    pub fn best_coord_error(&self) -> Option<(usize, f32)> {
        self.epochs
            .iter()
            .filter(|e| e.valid_coord_error.is_finite())
            .min_by(|a, b| a.valid_coord_error.total_cmp(&b.valid_coord_error))
            .map(|e| (e.epoch, e.valid_coord_error))
    }
}

impl MetricsSink for MetricsHistory {
    fn record_epoch(&mut self, summary: &EpochSummary) {
        self.epochs.push(summary.clone());
    }
}

impl<S: MetricsSink + ?Sized> MetricsSink for Box<S> {
    fn record_epoch(&mut self, summary: &EpochSummary) {
        (**self).record_epoch(summary);
    }
}

/// Running mean of per-iteration values within one epoch.
#[derive(Debug, Default, Clone, Copy)]
pub struct RunningMean {
    sum: f64,
    count: usize,
}

impl RunningMean {
    pub fn push(&mut self, value: f32) {
        self.sum += value as f64;
        self.count += 1;
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Mean so far, or 0.0 if empty.
    pub fn mean(&self) -> f32 {
        if self.count == 0 {
            0.0
        } else {
            (self.sum / self.count as f64) as f32
        }
    }
}
