use std::path::PathBuf;

/// Errors that can occur during checkpoint operations.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint directory not found: {0}")]
    DirNotFound(PathBuf),

    #[error("no 'latest' symlink found in {0}")]
    NoLatestSymlink(PathBuf),

    #[error("failed to read metadata from {path}: {source}")]
    MetadataRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse metadata from {path}: {source}")]
    MetadataParse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("failed to save model: {0}")]
    ModelSave(String),

    #[error("failed to load model: {0}")]
    ModelLoad(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised while producing training samples.
#[derive(Debug, thiserror::Error)]
pub enum DataError {
    #[error("data source is empty")]
    EmptySource,

    #[error("sample index {index} out of range (len {len})")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("landmark index {index} not present in sample '{sample}' ({available} landmarks)")]
    MissingLandmark {
        sample: String,
        index: usize,
        available: usize,
    },

    #[error("image '{sample}' is {actual_h}x{actual_w}, expected {expected_h}x{expected_w}")]
    ImageSize {
        sample: String,
        expected_h: usize,
        expected_w: usize,
        actual_h: usize,
        actual_w: usize,
    },

    #[error("expected {expected} sigma values, got {actual}")]
    SigmaCount { expected: usize, actual: usize },

    #[error("failed to read tensor data: {0}")]
    TensorRead(String),
}

/// Errors that can occur during training.
#[derive(Debug, thiserror::Error)]
pub enum TrainingError {
    #[error("loss became non-finite ({loss}) at epoch {epoch}, iteration {iteration}")]
    NonFiniteLoss {
        loss: f32,
        epoch: usize,
        iteration: usize,
    },

    #[error("network produced {produced} output levels, {required} are supervised")]
    OutputLevels { produced: usize, required: usize },

    #[error("data error: {0}")]
    Data(#[from] DataError),

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
}

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("failed to serialize TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("config validation error: {0}")]
    Validation(String),

    #[error("unsupported {kind} '{name}' (expected one of: {expected})")]
    Unsupported {
        kind: &'static str,
        name: String,
        expected: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_error_display() {
        let err = CheckpointError::NoLatestSymlink(PathBuf::from("checkpoints"));
        assert_eq!(
            err.to_string(),
            "no 'latest' symlink found in checkpoints"
        );
    }

    #[test]
    fn test_training_error_display() {
        let err = TrainingError::NonFiniteLoss {
            loss: f32::NAN,
            epoch: 3,
            iteration: 17,
        };
        assert_eq!(
            err.to_string(),
            "loss became non-finite (NaN) at epoch 3, iteration 17"
        );
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::Validation("solver.base_lr must be > 0".to_string());
        assert_eq!(
            err.to_string(),
            "config validation error: solver.base_lr must be > 0"
        );
    }

    #[test]
    fn test_unsupported_error_lists_choices() {
        let err = ConfigError::Unsupported {
            kind: "loss function",
            name: "l1".into(),
            expected: "mse, awl".into(),
        };
        assert_eq!(
            err.to_string(),
            "unsupported loss function 'l1' (expected one of: mse, awl)"
        );
    }
}
