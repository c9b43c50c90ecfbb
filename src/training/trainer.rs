use std::path::Path;
use std::time::Instant;

use burn::module::AutodiffModule;
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::decay::WeightDecayConfig;
use burn::optim::momentum::MomentumConfig;
use burn::optim::{GradientsParams, Optimizer, Sgd, SgdConfig};
use burn::prelude::*;
use burn::record::{DefaultRecorder, Recorder};
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::ElementConversion;
use log::{debug, info, warn};

use crate::checkpoint::{
    CheckpointData, CheckpointHyperparameters, CheckpointKind, CheckpointManager,
    CheckpointManagerConfig, CheckpointMetadata, CheckpointMetrics, CheckpointState,
    Checkpointable,
};
use crate::data::CyclingLoader;
use crate::error::{CheckpointError, DataError, TrainingError};
use crate::model::{DeepSupervisionLoss, HeatmapNetwork, LossKind, SigmaParams};
use crate::training::inference::{supervised_tail, EvaluationMode, Prediction, Predictor};
use crate::training::metrics::{EpochSummary, MetricsSink, RunningMean};
use crate::training::gradients::{clip_coefficient, scale_gradients, squared_norm};
use crate::training::scaler::GradScaler;
use crate::training::state::{
    finish_epoch, EpochMetrics, Phase, StopReason, StoppingPolicy, TrainingState,
};

/// Trainer configuration.
#[derive(Debug, Clone)]
pub struct TrainerConfig {
    pub max_epochs: usize,
    pub iterations_per_epoch: usize,
    /// Validation batches per epoch. 0 means one pass over the validation set.
    pub validation_iterations: usize,
    pub num_res_supervisions: usize,
    pub base_lr: f64,
    pub poly_exponent: f64,
    pub momentum: f32,
    pub weight_decay: f32,
    pub max_grad_norm: f32,
    /// 0 disables early stopping.
    pub early_stop_patience: usize,
    pub loss_function: LossKind,
    pub lambda_scale: f32,
    pub regress_sigma: bool,
    pub regress_sigma_loss_weight: f32,
    pub use_amp: bool,
    pub evaluation_mode: EvaluationMode,
    pub fold: Option<usize>,
    pub checkpoint: CheckpointManagerConfig,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        TrainerConfig {
            max_epochs: 1000,
            iterations_per_epoch: 250,
            validation_iterations: 0,
            num_res_supervisions: 5,
            base_lr: 0.01,
            poly_exponent: 0.9,
            momentum: 0.99,
            weight_decay: 3e-5,
            max_grad_norm: 12.0,
            early_stop_patience: 150,
            loss_function: LossKind::Mse,
            lambda_scale: 100.0,
            regress_sigma: false,
            regress_sigma_loss_weight: 0.005,
            use_amp: true,
            evaluation_mode: EvaluationMode::InputResolution,
            fold: None,
            checkpoint: CheckpointManagerConfig::default(),
        }
    }
}

impl TrainerConfig {
    fn sgd(&self) -> SgdConfig {
        SgdConfig::new()
            .with_momentum(Some(
                MomentumConfig::new()
                    .with_momentum(self.momentum as f64)
                    .with_dampening(0.0)
                    .with_nesterov(true),
            ))
            .with_weight_decay(Some(WeightDecayConfig::new(self.weight_decay)))
    }

    fn stopping_policy(&self) -> StoppingPolicy {
        StoppingPolicy {
            max_epochs: self.max_epochs,
            early_stop_patience: self.early_stop_patience,
            initial_lr: self.base_lr,
            poly_exponent: self.poly_exponent,
        }
    }
}

enum StepOutcome {
    Applied(f32),
    Skipped,
}

/// Deep-supervision heatmap trainer.
///
/// Owns the network, the sigma parameters and both optimisers. Label
/// generation reads `sigma_snapshot`, which is refreshed only after a sigma
/// optimiser step.
pub struct Trainer<B, N>
where
    B: AutodiffBackend,
    N: HeatmapNetwork<B> + AutodiffModule<B>,
{
    config: TrainerConfig,
    network: N,
    sigmas: SigmaParams<B>,
    optimizer: OptimizerAdaptor<Sgd<B::InnerBackend>, N, B>,
    sigma_optimizer: OptimizerAdaptor<Sgd<B::InnerBackend>, SigmaParams<B>, B>,
    loss: DeepSupervisionLoss,
    scaler: Option<GradScaler>,
    state: TrainingState,
    train_loader: CyclingLoader,
    valid_loader: CyclingLoader,
    checkpoints: CheckpointManager,
    sigma_snapshot: Vec<f32>,
    device: B::Device,
}

impl<B, N> Trainer<B, N>
where
    B: AutodiffBackend,
    N: HeatmapNetwork<B> + AutodiffModule<B>,
    N::InnerModule: HeatmapNetwork<B::InnerBackend>,
{
    pub fn new(
        config: TrainerConfig,
        network: N,
        initial_sigmas: &[f32],
        train_loader: CyclingLoader,
        valid_loader: CyclingLoader,
        device: B::Device,
    ) -> Result<Self, TrainingError> {
        let k = config.num_res_supervisions;
        if k == 0 || k > network.num_levels() {
            return Err(TrainingError::OutputLevels {
                produced: network.num_levels(),
                required: k.max(1),
            });
        }
        let num_landmarks = train_loader.dataset().num_landmarks();
        if initial_sigmas.len() != num_landmarks {
            return Err(DataError::SigmaCount {
                expected: num_landmarks,
                actual: initial_sigmas.len(),
            }
            .into());
        }

        let checkpoints = CheckpointManager::new(config.checkpoint.clone())?;
        let loss = DeepSupervisionLoss::new(config.loss_function, k, config.lambda_scale);
        let scaler = config.use_amp.then(GradScaler::default);
        let optimizer = config.sgd().init();
        let sigma_optimizer = config.sgd().init();
        let state = TrainingState::initialized(config.base_lr);

        info!(
            "trainer initialised: {} landmarks, {} supervised levels, loss {}, amp {}, regress_sigma {}",
            num_landmarks, k, config.loss_function, config.use_amp, config.regress_sigma
        );

        Ok(Trainer {
            sigmas: SigmaParams::new(initial_sigmas, &device),
            sigma_snapshot: initial_sigmas.to_vec(),
            config,
            network,
            optimizer,
            sigma_optimizer,
            loss,
            scaler,
            state,
            train_loader,
            valid_loader,
            checkpoints,
            device,
        })
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn network(&self) -> &N {
        &self.network
    }

    /// Sigma values currently used for label generation.
    pub fn sigma_values(&self) -> &[f32] {
        &self.sigma_snapshot
    }

    pub fn scaler(&self) -> Option<&GradScaler> {
        self.scaler.as_ref()
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    /// Restore weights, optimiser state, sigmas and progress from a
    /// checkpoint directory, or from `latest` when no path is given.
    pub fn resume(&mut self, path: Option<&Path>) -> Result<CheckpointData, TrainingError> {
        let data = match path {
            Some(dir) => self.checkpoints.load_checkpoint(dir)?,
            None => self.checkpoints.load_latest()?,
        };
        self.load_weights_from_dir(&data.path)?;

        let mut training = data.state.training.clone();
        training.phase = Phase::Initialized;
        training.stop_reason = None;
        self.state = training;

        self.sigma_snapshot = self.sigmas.values()?;
        if self.sigma_snapshot != data.state.sigmas {
            warn!(
                "sigma record {:?} differs from training_state.json {:?}, using the record",
                self.sigma_snapshot, data.state.sigmas
            );
        }

        if self.config.use_amp {
            self.scaler = Some(
                data.state
                    .amp_grad_scaler
                    .clone()
                    .map(GradScaler::from_state)
                    .unwrap_or_default(),
            );
        }

        info!(
            "resumed from {} at epoch {} (best coord error {:.3} @ {})",
            data.path.display(),
            self.state.epoch,
            self.state.best_valid_coord_error,
            self.state.best_valid_coords_epoch
        );
        Ok(data)
    }

    /// Run epochs until the maximum is reached or early stopping triggers.
    pub fn train(&mut self, sink: &mut dyn MetricsSink) -> Result<TrainingState, TrainingError> {
        let policy = self.config.stopping_policy();

        if self.state.is_stopped() {
            info!(
                "run already stopped at epoch {} ({:?}), nothing to train",
                self.state.epoch, self.state.stop_reason
            );
            return Ok(self.state.clone());
        }

        if self.state.epoch >= self.config.max_epochs {
            info!(
                "already at epoch {} of {}, nothing to train",
                self.state.epoch, self.config.max_epochs
            );
            self.state.phase = Phase::Stopped;
            self.state.stop_reason = Some(StopReason::MaxEpochs);
            return Ok(self.state.clone());
        }

        info!(
            "training epochs {}..{} with {} iterations each",
            self.state.epoch + 1,
            self.config.max_epochs,
            self.config.iterations_per_epoch
        );

        loop {
            let started = Instant::now();

            self.state.phase = Phase::Training;
            let (train_loss, skipped_steps) = self.run_training_epoch()?;

            self.state.phase = Phase::Validating;
            let (valid_loss, valid_coord_error) = self.validate()?;

            let metrics = EpochMetrics {
                train_loss,
                valid_loss,
                valid_coord_error,
            };
            let epoch_lr = self.state.learning_rate;
            let outcome = finish_epoch(&self.state, &metrics, &policy);
            self.state = outcome.state.clone();

            sink.record_epoch(&EpochSummary {
                epoch: self.state.epoch,
                train_loss,
                valid_loss,
                valid_coord_error,
                duration_secs: started.elapsed().as_secs_f64(),
                learning_rate: epoch_lr,
                sigma: self.sigma_snapshot.first().copied(),
                skipped_steps,
            });

            let checkpoint_metrics = CheckpointMetrics {
                train_loss,
                valid_loss,
                valid_coord_error,
            };
            if outcome.new_best_loss {
                self.save(CheckpointKind::BestValidLoss, &checkpoint_metrics)?;
            }
            if outcome.new_best_coord_error {
                info!(
                    "  >> new best coordinate error {:.3} px at epoch {}",
                    valid_coord_error, self.state.epoch
                );
                self.save(CheckpointKind::BestCoordError, &checkpoint_metrics)?;
            }
            if self.checkpoints.periodic_due(self.state.epoch) {
                self.save(CheckpointKind::Periodic, &checkpoint_metrics)?;
            }

            if outcome.stopped() {
                self.save(CheckpointKind::Final, &checkpoint_metrics)?;
                match self.state.stop_reason {
                    Some(StopReason::EarlyStopping) => info!(
                        "early stopping at epoch {}: no improvement for {} epochs (best {:.3} px @ {})",
                        self.state.epoch,
                        self.state.epochs_without_improvement,
                        self.state.best_valid_coord_error,
                        self.state.best_valid_coords_epoch
                    ),
                    _ => info!("reached max epochs ({})", self.config.max_epochs),
                }
                break;
            }
        }

        Ok(self.state.clone())
    }

    fn save(&self, kind: CheckpointKind, metrics: &CheckpointMetrics) -> Result<(), TrainingError> {
        let path = self.checkpoints.save_checkpoint(self, kind, metrics)?;
        info!("  >> checkpoint saved: {}", path.display());
        Ok(())
    }

    /// Mean training loss and number of skipped steps.
    fn run_training_epoch(&mut self) -> Result<(f32, usize), TrainingError> {
        let mut loss = RunningMean::default();
        let mut skipped = 0;
        for iteration in 0..self.config.iterations_per_epoch {
            match self.train_step(iteration)? {
                StepOutcome::Applied(value) => loss.push(value),
                StepOutcome::Skipped => skipped += 1,
            }
        }
        Ok((loss.mean(), skipped))
    }

    fn train_step(&mut self, iteration: usize) -> Result<StepOutcome, TrainingError> {
        let k = self.loss.num_supervised();
        let batch = self
            .train_loader
            .next_batch::<B>(&self.sigma_snapshot, &self.device)?;

        let outputs = supervised_tail(self.network.forward_levels(batch.images), k)?;
        let targets = supervised_tail(batch.targets, k)?;
        let mut loss = self.loss.forward(&outputs, &targets);
        if self.config.regress_sigma {
            loss = loss
                + self
                    .sigmas
                    .regularization()
                    .mul_scalar(self.config.regress_sigma_loss_weight);
        }

        let loss_value: f32 = loss.clone().into_scalar().elem();
        if !loss_value.is_finite() && self.scaler.is_none() {
            return Err(TrainingError::NonFiniteLoss {
                loss: loss_value,
                epoch: self.state.epoch + 1,
                iteration,
            });
        }

        let loss = match &self.scaler {
            Some(scaler) => scaler.scale(loss),
            None => loss,
        };
        let mut grads = loss.backward();
        let network_grads = GradientsParams::from_module(&mut grads, &self.network);
        let sigma_grads = GradientsParams::from_module(&mut grads, &self.sigmas);

        let (network_grads, sigma_grads) = match self.scaler.as_mut() {
            Some(scaler) => {
                let (network_grads, network_ok) =
                    scaler.unscale::<B, N>(&self.network, network_grads);
                let (sigma_grads, sigma_ok) =
                    scaler.unscale::<B, SigmaParams<B>>(&self.sigmas, sigma_grads);
                let finite = network_ok && sigma_ok;
                scaler.update(!finite);
                if !finite {
                    return Ok(StepOutcome::Skipped);
                }
                (network_grads, sigma_grads)
            }
            None => (network_grads, sigma_grads),
        };
        let (network_grads, sigma_grads) = self.clip_global_norm(network_grads, sigma_grads);

        let lr = self.state.learning_rate;
        self.network = self.optimizer.step(lr, self.network.clone(), network_grads);
        if self.config.regress_sigma {
            self.sigmas = self
                .sigma_optimizer
                .step(lr, self.sigmas.clone(), sigma_grads);
            self.sigma_snapshot = self.sigmas.values()?;
        }

        Ok(StepOutcome::Applied(loss_value))
    }

    /// Rescale network and sigma gradients together so their combined L2
    /// norm does not exceed `max_grad_norm`.
    fn clip_global_norm(
        &self,
        network_grads: GradientsParams,
        sigma_grads: GradientsParams,
    ) -> (GradientsParams, GradientsParams) {
        let total = (squared_norm::<B, N>(&self.network, &network_grads)
            + squared_norm::<B, SigmaParams<B>>(&self.sigmas, &sigma_grads))
        .sqrt();
        let coef = clip_coefficient(total, self.config.max_grad_norm);
        if coef >= 1.0 {
            return (network_grads, sigma_grads);
        }
        debug!("gradient norm {total:.3} clipped to {}", self.config.max_grad_norm);
        let (network_grads, _) = scale_gradients::<B, N>(&self.network, network_grads, coef);
        let (sigma_grads, _) = scale_gradients::<B, SigmaParams<B>>(&self.sigmas, sigma_grads, coef);
        (network_grads, sigma_grads)
    }

    fn predictor(&self) -> Predictor {
        let descriptor = self.valid_loader.dataset().descriptor();
        Predictor::new(
            self.loss.clone(),
            self.config.evaluation_mode,
            descriptor.input_size,
            descriptor.original_size,
        )
    }

    /// Mean validation loss and mean coordinate error on the inner backend.
    ///
    /// The validation loader is rewound first so every epoch scores the same
    /// batches. With `validation_iterations == 0` one full pass is scored,
    /// each sample exactly once.
    pub fn validate(&mut self) -> Result<(f32, f32), TrainingError> {
        let network = self.network.valid();
        let predictor = self.predictor();
        let limit = match self.config.validation_iterations {
            0 => usize::MAX,
            n => n,
        };

        self.valid_loader.rewind();
        let mut loss = RunningMean::default();
        let mut coord_error = RunningMean::default();
        for _ in 0..limit {
            let Some(batch) = self
                .valid_loader
                .next_batch_in_pass::<B::InnerBackend>(&self.sigma_snapshot, &self.device)?
            else {
                break;
            };
            let prediction =
                predictor.predict(&network, batch.images, Some(batch.targets.as_slice()))?;
            if let Some(value) = prediction.loss {
                loss.push(value);
            }
            for error in predictor.coordinate_errors(
                &prediction.coords,
                &batch.target_coords,
                &batch.full_res_coords,
            ) {
                coord_error.push(error);
            }
        }
        Ok((loss.mean(), coord_error.mean()))
    }

    /// Forward `images` through the current network without autodiff and
    /// decode according to the configured evaluation mode.
    pub fn predict(
        &self,
        images: Tensor<B::InnerBackend, 4>,
        targets: Option<&[Tensor<B::InnerBackend, 4>]>,
    ) -> Result<Prediction<B::InnerBackend>, TrainingError> {
        self.predictor().predict(&self.network.valid(), images, targets)
    }
}

impl<B, N> Checkpointable for Trainer<B, N>
where
    B: AutodiffBackend,
    N: HeatmapNetwork<B> + AutodiffModule<B>,
    N::InnerModule: HeatmapNetwork<B::InnerBackend>,
{
    fn save_weights_to_dir(&self, dir: &Path) -> Result<(), CheckpointError> {
        let recorder = DefaultRecorder::default();
        self.network
            .clone()
            .valid()
            .save_file(dir.join("network"), &recorder)
            .map_err(|e| CheckpointError::ModelSave(e.to_string()))?;
        self.sigmas
            .clone()
            .valid()
            .save_file(dir.join("sigmas"), &recorder)
            .map_err(|e| CheckpointError::ModelSave(e.to_string()))?;
        <DefaultRecorder as Recorder<B>>::record(
            &recorder,
            self.optimizer.to_record(),
            dir.join("optimizer"),
        )
        .map_err(|e| CheckpointError::ModelSave(e.to_string()))?;
        <DefaultRecorder as Recorder<B>>::record(
            &recorder,
            self.sigma_optimizer.to_record(),
            dir.join("sigma_optimizer"),
        )
        .map_err(|e| CheckpointError::ModelSave(e.to_string()))?;
        Ok(())
    }

    fn load_weights_from_dir(&mut self, dir: &Path) -> Result<(), CheckpointError> {
        let recorder = DefaultRecorder::default();
        self.network = self
            .network
            .clone()
            .load_file(dir.join("network"), &recorder, &self.device)
            .map_err(|e| CheckpointError::ModelLoad(e.to_string()))?;
        self.sigmas = self
            .sigmas
            .clone()
            .load_file(dir.join("sigmas"), &recorder, &self.device)
            .map_err(|e| CheckpointError::ModelLoad(e.to_string()))?;

        let record =
            <DefaultRecorder as Recorder<B>>::load(&recorder, dir.join("optimizer"), &self.device)
                .map_err(|e| CheckpointError::ModelLoad(e.to_string()))?;
        let optimizer: OptimizerAdaptor<Sgd<B::InnerBackend>, N, B> = self.config.sgd().init();
        self.optimizer = optimizer.load_record(record);
        let record = <DefaultRecorder as Recorder<B>>::load(
            &recorder,
            dir.join("sigma_optimizer"),
            &self.device,
        )
        .map_err(|e| CheckpointError::ModelLoad(e.to_string()))?;
        let sigma_optimizer: OptimizerAdaptor<Sgd<B::InnerBackend>, SigmaParams<B>, B> =
            self.config.sgd().init();
        self.sigma_optimizer = sigma_optimizer.load_record(record);
        Ok(())
    }

    fn checkpoint_state(&self) -> CheckpointState {
        CheckpointState {
            training: self.state.clone(),
            sigmas: self.sigma_snapshot.clone(),
            amp_grad_scaler: self.scaler.as_ref().map(|s| s.state().clone()),
        }
    }

    fn build_checkpoint_metadata(
        &self,
        kind: CheckpointKind,
        metrics: &CheckpointMetrics,
        timestamp: u64,
    ) -> CheckpointMetadata {
        CheckpointMetadata {
            epoch: self.state.epoch,
            timestamp,
            kind,
            fold: self.config.fold,
            metrics: metrics.clone(),
            hyperparameters: CheckpointHyperparameters {
                base_lr: self.config.base_lr,
                learning_rate: self.state.learning_rate,
                loss_function: self.config.loss_function.to_string(),
                num_res_supervisions: self.config.num_res_supervisions,
                lambda_scale: self.config.lambda_scale,
                regress_sigma: self.config.regress_sigma,
                use_amp: self.config.use_amp,
                max_grad_norm: self.config.max_grad_norm,
                batch_size: self.train_loader.batch_size(),
            },
        }
    }
}
