use std::path::Path;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::checkpoint::CheckpointManagerConfig;
use crate::data::{AugmentationStrategy, DataSourceDescriptor};
use crate::error::ConfigError;
use crate::heatmap::ImageSize;
use crate::model::{LossKind, PyramidNetConfig};
use crate::training::{EvaluationMode, TrainerConfig};

/// Which landmarks to learn and where the raw data lives in pixel space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    /// Indices into each sample's landmark list.
    pub landmarks: Vec<usize>,
    /// Cross-validation fold, carried into checkpoint metadata.
    pub fold: Option<usize>,
    pub original_size: ImageSize,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        DatasetConfig {
            landmarks: vec![0, 1, 2],
            fold: None,
            original_size: ImageSize::new(512, 512),
        }
    }
}

/// How samples are drawn and turned into supervision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Initial Gaussian spread, used for every landmark.
    pub sigma: f32,
    /// Named augmentation strategy for training samples. None disables it.
    pub data_augmentation: Option<AugmentationStrategy>,
    pub normalize: bool,
    pub shuffle: bool,
    pub seed: u64,
    pub input_size: ImageSize,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        SamplerConfig {
            sigma: 3.0,
            data_augmentation: Some(AugmentationStrategy::AffineSimple),
            normalize: true,
            shuffle: true,
            seed: 42,
            input_size: ImageSize::new(512, 512),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Resolution levels, including full resolution.
    pub depth: usize,
    pub base_features: usize,
    pub max_features: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        ModelConfig {
            depth: 5,
            base_features: 32,
            max_features: 512,
        }
    }
}

/// Optimisation, loss and stopping parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    pub base_lr: f64,
    pub poly_exponent: f64,
    pub momentum: f32,
    pub weight_decay: f32,
    pub max_grad_norm: f32,
    pub max_epochs: usize,
    pub iterations_per_epoch: usize,
    /// 0 means one pass over the validation set.
    pub validation_iterations: usize,
    pub batch_size: usize,
    pub loss_function: LossKind,
    pub num_res_supervisions: usize,
    /// Peak amplitude of target heatmaps.
    pub lambda_scale: f32,
    pub regress_sigma: bool,
    pub regress_sigma_loss_weight: f32,
    /// 0 disables early stopping.
    pub early_stop_patience: usize,
    pub use_amp: bool,
}

impl Default for SolverConfig {
    fn default() -> Self {
        let trainer = TrainerConfig::default();
        SolverConfig {
            base_lr: trainer.base_lr,
            poly_exponent: trainer.poly_exponent,
            momentum: trainer.momentum,
            weight_decay: trainer.weight_decay,
            max_grad_norm: trainer.max_grad_norm,
            max_epochs: trainer.max_epochs,
            iterations_per_epoch: trainer.iterations_per_epoch,
            validation_iterations: trainer.validation_iterations,
            batch_size: 2,
            loss_function: trainer.loss_function,
            num_res_supervisions: trainer.num_res_supervisions,
            lambda_scale: trainer.lambda_scale,
            regress_sigma: trainer.regress_sigma,
            regress_sigma_loss_weight: trainer.regress_sigma_loss_weight,
            early_stop_patience: trainer.early_stop_patience,
            use_amp: trainer.use_amp,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub evaluation_mode: EvaluationMode,
}

/// Top-level application configuration, loadable from TOML.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub dataset: DatasetConfig,
    pub sampler: SamplerConfig,
    pub model: ModelConfig,
    pub solver: SolverConfig,
    pub inference: InferenceConfig,
    pub checkpoint: CheckpointManagerConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: AppConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the file
    /// does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            warn!("config file '{}' not found, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dataset.landmarks.is_empty() {
            return Err(ConfigError::Validation(
                "dataset.landmarks must not be empty".into(),
            ));
        }
        if self.dataset.original_size.area() == 0 {
            return Err(ConfigError::Validation(
                "dataset.original_size must be non-zero".into(),
            ));
        }

        if self.sampler.input_size.area() == 0 {
            return Err(ConfigError::Validation(
                "sampler.input_size must be non-zero".into(),
            ));
        }
        if self.sampler.sigma <= 0.0 {
            return Err(ConfigError::Validation("sampler.sigma must be > 0".into()));
        }

        if self.model.depth == 0 {
            return Err(ConfigError::Validation("model.depth must be >= 1".into()));
        }
        if self.model.base_features == 0 || self.model.max_features < self.model.base_features {
            return Err(ConfigError::Validation(
                "model.max_features must be >= model.base_features > 0".into(),
            ));
        }
        let factor = 1usize << (self.model.depth - 1);
        if self.sampler.input_size.height % factor != 0 || self.sampler.input_size.width % factor != 0
        {
            return Err(ConfigError::Validation(format!(
                "sampler.input_size must be divisible by {factor} for model.depth {}",
                self.model.depth
            )));
        }

        if self.solver.base_lr <= 0.0 {
            return Err(ConfigError::Validation("solver.base_lr must be > 0".into()));
        }
        if self.solver.max_epochs == 0 {
            return Err(ConfigError::Validation(
                "solver.max_epochs must be > 0".into(),
            ));
        }
        if self.solver.iterations_per_epoch == 0 {
            return Err(ConfigError::Validation(
                "solver.iterations_per_epoch must be > 0".into(),
            ));
        }
        if self.solver.batch_size == 0 {
            return Err(ConfigError::Validation(
                "solver.batch_size must be > 0".into(),
            ));
        }
        if self.solver.num_res_supervisions == 0
            || self.solver.num_res_supervisions > self.model.depth
        {
            return Err(ConfigError::Validation(format!(
                "solver.num_res_supervisions must be in [1, {}]",
                self.model.depth
            )));
        }
        if self.solver.lambda_scale <= 0.0 {
            return Err(ConfigError::Validation(
                "solver.lambda_scale must be > 0".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.solver.momentum) {
            return Err(ConfigError::Validation(
                "solver.momentum must be in [0, 1)".into(),
            ));
        }
        if self.solver.weight_decay < 0.0 {
            return Err(ConfigError::Validation(
                "solver.weight_decay must be >= 0".into(),
            ));
        }
        if self.solver.max_grad_norm <= 0.0 {
            return Err(ConfigError::Validation(
                "solver.max_grad_norm must be > 0".into(),
            ));
        }
        if self.solver.poly_exponent < 0.0 {
            return Err(ConfigError::Validation(
                "solver.poly_exponent must be >= 0".into(),
            ));
        }
        if self.solver.regress_sigma_loss_weight < 0.0 {
            return Err(ConfigError::Validation(
                "solver.regress_sigma_loss_weight must be >= 0".into(),
            ));
        }

        if self.checkpoint.keep_last_n == 0 {
            return Err(ConfigError::Validation(
                "checkpoint.keep_last_n must be >= 1".into(),
            ));
        }
        if self.checkpoint.schedule.then_every == 0
            || self.checkpoint.schedule.stages.iter().any(|s| s.every == 0)
        {
            return Err(ConfigError::Validation(
                "checkpoint.schedule intervals must be > 0".into(),
            ));
        }
        if self
            .checkpoint
            .schedule
            .stages
            .windows(2)
            .any(|w| w[0].until_epoch >= w[1].until_epoch)
        {
            return Err(ConfigError::Validation(
                "checkpoint.schedule.stages must be in ascending until_epoch order".into(),
            ));
        }

        Ok(())
    }

    /// Generate a TOML string with all default values (useful for creating
    /// example config files).
    pub fn default_toml() -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(&AppConfig::default())?)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn trainer_config(&self) -> TrainerConfig {
        TrainerConfig {
            max_epochs: self.solver.max_epochs,
            iterations_per_epoch: self.solver.iterations_per_epoch,
            validation_iterations: self.solver.validation_iterations,
            num_res_supervisions: self.solver.num_res_supervisions,
            base_lr: self.solver.base_lr,
            poly_exponent: self.solver.poly_exponent,
            momentum: self.solver.momentum,
            weight_decay: self.solver.weight_decay,
            max_grad_norm: self.solver.max_grad_norm,
            early_stop_patience: self.solver.early_stop_patience,
            loss_function: self.solver.loss_function,
            lambda_scale: self.solver.lambda_scale,
            regress_sigma: self.solver.regress_sigma,
            regress_sigma_loss_weight: self.solver.regress_sigma_loss_weight,
            use_amp: self.solver.use_amp,
            evaluation_mode: self.inference.evaluation_mode,
            fold: self.dataset.fold,
            checkpoint: self.checkpoint.clone(),
        }
    }

    pub fn descriptor(&self) -> DataSourceDescriptor {
        DataSourceDescriptor {
            landmarks: self.dataset.landmarks.clone(),
            input_size: self.sampler.input_size,
            original_size: self.dataset.original_size,
            num_levels: self.model.depth,
            lambda_scale: self.solver.lambda_scale,
            normalize: self.sampler.normalize,
        }
    }

    pub fn network_config(&self) -> PyramidNetConfig {
        PyramidNetConfig::new(self.dataset.landmarks.len(), self.model.depth)
            .with_base_features(self.model.base_features)
            .with_max_features(self.model.max_features)
    }

    /// One initial sigma per configured landmark.
    pub fn initial_sigmas(&self) -> Vec<f32> {
        vec![self.sampler.sigma; self.dataset.landmarks.len()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        config.validate().expect("default config should be valid");
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let toml_str = r#"
[solver]
base_lr = 0.001
loss_function = "awl"
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert!((config.solver.base_lr - 0.001).abs() < 1e-9);
        assert_eq!(config.solver.loss_function, LossKind::Awl);
        assert_eq!(config.solver.max_epochs, 1000);
        assert_eq!(config.sampler.sigma, 3.0);
    }

    #[test]
    fn test_empty_toml_uses_all_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn test_unknown_names_fail_at_parse() {
        for toml_str in [
            "[solver]\nloss_function = \"l1\"\n",
            "[sampler]\ndata_augmentation = \"Mosaic\"\n",
            "[inference]\nevaluation_mode = \"nearest\"\n",
        ] {
            assert!(toml::from_str::<AppConfig>(toml_str).is_err(), "{toml_str}");
        }
    }

    #[test]
    fn test_named_choices_parse() {
        let config: AppConfig = toml::from_str(
            r#"
[sampler]
data_augmentation = "TTA"

[inference]
evaluation_mode = "resize_heatmap"
"#,
        )
        .unwrap();
        assert_eq!(config.sampler.data_augmentation, Some(AugmentationStrategy::Tta));
        assert_eq!(config.inference.evaluation_mode, EvaluationMode::ResizeHeatmap);
    }

    #[test]
    fn test_validation_rejects_zero_lr() {
        let mut config = AppConfig::default();
        config.solver.base_lr = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_too_many_supervisions() {
        let mut config = AppConfig::default();
        config.solver.num_res_supervisions = config.model.depth + 1;
        assert!(config.validate().is_err());
        config.solver.num_res_supervisions = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_indivisible_input_size() {
        let mut config = AppConfig::default();
        config.sampler.input_size = ImageSize::new(100, 512);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_empty_landmarks() {
        let mut config = AppConfig::default();
        config.dataset.landmarks.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_bad_momentum() {
        let mut config = AppConfig::default();
        config.solver.momentum = 1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_unordered_schedule() {
        let mut config = AppConfig::default();
        config.checkpoint.schedule.stages.reverse();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let config = AppConfig::load_or_default(Path::new("nonexistent_config.toml")).unwrap();
        assert_eq!(config.solver.max_epochs, 1000);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test_config.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            r#"
[dataset]
landmarks = [0, 4]
fold = 2

[solver]
max_epochs = 500
regress_sigma = true

[checkpoint]
keep_last_n = 3
"#
        )
        .unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.solver.max_epochs, 500);
        assert_eq!(config.checkpoint.keep_last_n, 3);
        assert_eq!(config.initial_sigmas(), vec![3.0, 3.0]);

        let trainer = config.trainer_config();
        assert_eq!(trainer.fold, Some(2));
        assert!(trainer.regress_sigma);
        assert_eq!(config.network_config().num_landmarks, 2);
        assert_eq!(config.descriptor().num_levels, config.model.depth);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[solver]\nbatch_size = 0\n").unwrap();
        let err = AppConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_default_toml_roundtrips() {
        let toml_str = AppConfig::default_toml().unwrap();
        let config: AppConfig = toml::from_str(&toml_str).unwrap();
        config.validate().expect("roundtripped config should be valid");
        assert_eq!(config, AppConfig::default());
    }
}
