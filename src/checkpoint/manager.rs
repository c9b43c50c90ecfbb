use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use log::debug;

use crate::checkpoint::metadata::{
    CheckpointKind, CheckpointMetadata, CheckpointMetrics, CheckpointState,
};
use crate::error::CheckpointError;
use crate::training::schedule::CheckpointSchedule;

/// Configuration for the checkpoint manager.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct CheckpointManagerConfig {
    pub checkpoint_dir: PathBuf,
    /// Periodic checkpoints to keep. Best and final checkpoints are never pruned.
    pub keep_last_n: usize,
    pub schedule: CheckpointSchedule,
}

impl Default for CheckpointManagerConfig {
    fn default() -> Self {
        CheckpointManagerConfig {
            checkpoint_dir: PathBuf::from("checkpoints"),
            keep_last_n: 5,
            schedule: CheckpointSchedule::default(),
        }
    }
}

/// Something that can write and restore its weights and resumable state.
pub trait Checkpointable {
    fn save_weights_to_dir(&self, dir: &Path) -> Result<(), CheckpointError>;

    fn load_weights_from_dir(&mut self, dir: &Path) -> Result<(), CheckpointError>;

    fn checkpoint_state(&self) -> CheckpointState;

    fn build_checkpoint_metadata(
        &self,
        kind: CheckpointKind,
        metrics: &CheckpointMetrics,
        timestamp: u64,
    ) -> CheckpointMetadata;
}

/// Metadata and state read back from a checkpoint directory.
#[derive(Debug, Clone)]
pub struct CheckpointData {
    pub path: PathBuf,
    pub metadata: CheckpointMetadata,
    pub state: CheckpointState,
}

/// Manages saving, loading, listing, and pruning checkpoints.
pub struct CheckpointManager {
    config: CheckpointManagerConfig,
}

impl CheckpointManager {
    pub fn new(config: CheckpointManagerConfig) -> Result<Self, CheckpointError> {
        fs::create_dir_all(&config.checkpoint_dir)?;
        Ok(CheckpointManager { config })
    }

    pub fn config(&self) -> &CheckpointManagerConfig {
        &self.config
    }

    pub fn checkpoint_dir(&self) -> &Path {
        &self.config.checkpoint_dir
    }

    /// Whether the periodic schedule wants a checkpoint after `epoch`.
    pub fn periodic_due(&self, epoch: usize) -> bool {
        self.config.schedule.is_due(epoch)
    }

    /// Write a checkpoint of the given kind for the target's current epoch.
    pub fn save_checkpoint(
        &self,
        target: &dyn Checkpointable,
        kind: CheckpointKind,
        metrics: &CheckpointMetrics,
    ) -> Result<PathBuf, CheckpointError> {
        let state = target.checkpoint_state();
        let dir_name = kind.dir_name(state.training.epoch);
        let tmp_dir = self.config.checkpoint_dir.join(format!("{dir_name}.tmp"));
        let final_dir = self.config.checkpoint_dir.join(&dir_name);

        if tmp_dir.exists() {
            fs::remove_dir_all(&tmp_dir)?;
        }
        fs::create_dir_all(&tmp_dir)?;

        target.save_weights_to_dir(&tmp_dir)?;

        fs::write(
            tmp_dir.join("training_state.json"),
            serde_json::to_string_pretty(&state)?,
        )?;

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let metadata = target.build_checkpoint_metadata(kind, metrics, timestamp);
        fs::write(
            tmp_dir.join("metadata.json"),
            serde_json::to_string_pretty(&metadata)?,
        )?;

        // Atomic rename
        if final_dir.exists() {
            fs::remove_dir_all(&final_dir)?;
        }
        fs::rename(&tmp_dir, &final_dir)?;

        self.update_latest_symlink(&dir_name)?;
        if kind == CheckpointKind::Periodic {
            self.prune_periodic_checkpoints()?;
        }

        debug!("wrote {:?} checkpoint to {}", kind, final_dir.display());
        Ok(final_dir)
    }

    /// Read metadata and resumable state from a checkpoint directory.
    pub fn load_checkpoint(&self, dir: &Path) -> Result<CheckpointData, CheckpointError> {
        if !dir.is_dir() {
            return Err(CheckpointError::DirNotFound(dir.to_path_buf()));
        }
        let metadata: CheckpointMetadata = read_json(&dir.join("metadata.json"))?;
        let state: CheckpointState = read_json(&dir.join("training_state.json"))?;
        Ok(CheckpointData {
            path: dir.to_path_buf(),
            metadata,
            state,
        })
    }

    /// Directory the `latest` symlink points at.
    pub fn latest_path(&self) -> Result<PathBuf, CheckpointError> {
        let latest_link = self.config.checkpoint_dir.join("latest");
        if latest_link.symlink_metadata().is_err() {
            return Err(CheckpointError::NoLatestSymlink(
                self.config.checkpoint_dir.clone(),
            ));
        }
        let resolved = fs::read_link(&latest_link)?;
        Ok(if resolved.is_relative() {
            self.config.checkpoint_dir.join(resolved)
        } else {
            resolved
        })
    }

    pub fn load_latest(&self) -> Result<CheckpointData, CheckpointError> {
        let target = self.latest_path()?;
        self.load_checkpoint(&target)
    }

    /// All checkpoints sorted by epoch (ascending).
    pub fn list_checkpoints(&self) -> Result<Vec<(PathBuf, CheckpointMetadata)>, CheckpointError> {
        let mut results = Vec::new();
        for entry in fs::read_dir(&self.config.checkpoint_dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_dir() || entry.file_type()?.is_symlink() {
                continue;
            }
            if entry.file_name().to_string_lossy().ends_with(".tmp") {
                continue;
            }
            let meta_path = path.join("metadata.json");
            if meta_path.exists() {
                let metadata: CheckpointMetadata = read_json(&meta_path)?;
                results.push((path, metadata));
            }
        }
        results.sort_by_key(|(_, m)| m.epoch);
        Ok(results)
    }

    /// Delete all but the newest `keep_last_n` periodic checkpoints.
    fn prune_periodic_checkpoints(&self) -> Result<(), CheckpointError> {
        let periodic: Vec<PathBuf> = self
            .list_checkpoints()?
            .into_iter()
            .filter(|(_, m)| m.kind == CheckpointKind::Periodic)
            .map(|(path, _)| path)
            .collect();
        let excess = periodic.len().saturating_sub(self.config.keep_last_n);
        for path in periodic.iter().take(excess) {
            debug!("pruning checkpoint {}", path.display());
            fs::remove_dir_all(path)?;
        }
        Ok(())
    }

    /// Update the `latest` symlink to point to the given checkpoint directory name.
    fn update_latest_symlink(&self, dir_name: &str) -> Result<(), CheckpointError> {
        let link_path = self.config.checkpoint_dir.join("latest");
        if link_path.symlink_metadata().is_ok() {
            fs::remove_file(&link_path)?;
        }
        std::os::unix::fs::symlink(dir_name, &link_path)?;
        Ok(())
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, CheckpointError> {
    let json = fs::read_to_string(path).map_err(|e| CheckpointError::MetadataRead {
        path: path.to_path_buf(),
        source: e,
    })?;
    serde_json::from_str(&json).map_err(|e| CheckpointError::MetadataParse {
        path: path.to_path_buf(),
        source: e,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::metadata::CheckpointHyperparameters;
    use crate::training::scaler::GradScalerState;
    use crate::training::state::TrainingState;

    /// Stand-in that writes a small weights file.
    struct FakeModel {
        state: CheckpointState,
        weights: String,
    }

    impl FakeModel {
        fn at_epoch(epoch: usize) -> Self {
            let mut training = TrainingState::initialized(0.01);
            training.epoch = epoch;
            FakeModel {
                state: CheckpointState {
                    training,
                    sigmas: vec![3.0, 2.5],
                    amp_grad_scaler: None,
                },
                weights: format!("weights@{epoch}"),
            }
        }
    }

    impl Checkpointable for FakeModel {
        fn save_weights_to_dir(&self, dir: &Path) -> Result<(), CheckpointError> {
            fs::write(dir.join("network.bin"), &self.weights)?;
            Ok(())
        }

        fn load_weights_from_dir(&mut self, dir: &Path) -> Result<(), CheckpointError> {
            self.weights = fs::read_to_string(dir.join("network.bin"))
                .map_err(|e| CheckpointError::ModelLoad(e.to_string()))?;
            Ok(())
        }

        fn checkpoint_state(&self) -> CheckpointState {
            self.state.clone()
        }

        fn build_checkpoint_metadata(
            &self,
            kind: CheckpointKind,
            metrics: &CheckpointMetrics,
            timestamp: u64,
        ) -> CheckpointMetadata {
            CheckpointMetadata {
                epoch: self.state.training.epoch,
                timestamp,
                kind,
                fold: Some(1),
                metrics: metrics.clone(),
                hyperparameters: CheckpointHyperparameters {
                    base_lr: 0.01,
                    learning_rate: self.state.training.learning_rate,
                    loss_function: "mse".into(),
                    num_res_supervisions: 3,
                    lambda_scale: 100.0,
                    regress_sigma: false,
                    use_amp: false,
                    max_grad_norm: 12.0,
                    batch_size: 4,
                },
            }
        }
    }

    fn metrics() -> CheckpointMetrics {
        CheckpointMetrics {
            train_loss: 1.0,
            valid_loss: 1.5,
            valid_coord_error: 4.2,
        }
    }

    fn manager(dir: &Path, keep_last_n: usize) -> CheckpointManager {
        CheckpointManager::new(CheckpointManagerConfig {
            checkpoint_dir: dir.to_path_buf(),
            keep_last_n,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), 5);
        let mut model = FakeModel::at_epoch(25);
        model.state.amp_grad_scaler = Some(GradScalerState::default());
        model.state.training.best_valid_coord_error = 3.25;

        let path = manager
            .save_checkpoint(&model, CheckpointKind::Periodic, &metrics())
            .unwrap();
        assert!(path.ends_with("model_ep_00025"));
        assert!(path.join("metadata.json").exists());
        assert!(path.join("training_state.json").exists());
        assert!(!dir.path().join("model_ep_00025.tmp").exists());

        let data = manager.load_checkpoint(&path).unwrap();
        assert_eq!(data.metadata.epoch, 25);
        assert_eq!(data.metadata.kind, CheckpointKind::Periodic);
        assert_eq!(data.metadata.fold, Some(1));
        assert_eq!(data.state, model.state);

        let mut restored = FakeModel::at_epoch(0);
        restored.load_weights_from_dir(&data.path).unwrap();
        assert_eq!(restored.weights, "weights@25");
    }

    #[test]
    fn test_training_state_json_field_names() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), 5);
        let path = manager
            .save_checkpoint(&FakeModel::at_epoch(3), CheckpointKind::Final, &metrics())
            .unwrap();
        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(path.join("training_state.json")).unwrap())
                .unwrap();
        for key in [
            "epoch",
            "best_valid_loss",
            "best_valid_coord_error",
            "best_valid_epoch",
            "best_valid_coords_epoch",
            "epochs_without_improvement",
            "learning_rate",
            "sigmas",
        ] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
        assert!(json.get("amp_grad_scaler").is_none());
    }

    #[test]
    fn test_latest_symlink_follows_newest_write() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), 5);

        manager
            .save_checkpoint(&FakeModel::at_epoch(25), CheckpointKind::Periodic, &metrics())
            .unwrap();
        manager
            .save_checkpoint(&FakeModel::at_epoch(30), CheckpointKind::BestCoordError, &metrics())
            .unwrap();

        let latest = manager.load_latest().unwrap();
        assert_eq!(latest.metadata.epoch, 30);
        assert!(latest.path.ends_with("best_valid_coord_error"));
    }

    #[test]
    fn test_best_checkpoint_is_overwritten_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), 5);
        for epoch in [4, 9] {
            manager
                .save_checkpoint(&FakeModel::at_epoch(epoch), CheckpointKind::BestValidLoss, &metrics())
                .unwrap();
        }
        let list = manager.list_checkpoints().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].1.epoch, 9);
    }

    #[test]
    fn test_pruning_only_touches_periodic() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), 2);

        manager
            .save_checkpoint(&FakeModel::at_epoch(10), CheckpointKind::BestCoordError, &metrics())
            .unwrap();
        for epoch in [25, 50, 75, 100] {
            manager
                .save_checkpoint(&FakeModel::at_epoch(epoch), CheckpointKind::Periodic, &metrics())
                .unwrap();
        }

        let list = manager.list_checkpoints().unwrap();
        let epochs: Vec<usize> = list.iter().map(|(_, m)| m.epoch).collect();
        assert_eq!(epochs, vec![10, 75, 100]);
    }

    #[test]
    fn test_load_latest_no_symlink() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), 5);
        let err = manager.load_latest().unwrap_err();
        assert!(
            matches!(err, CheckpointError::NoLatestSymlink(_)),
            "expected NoLatestSymlink, got: {err}"
        );
    }

    #[test]
    fn test_load_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), 5);
        let err = manager.load_checkpoint(&dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, CheckpointError::DirNotFound(_)));
    }

    #[test]
    fn test_corrupt_metadata_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), 5);
        let path = manager
            .save_checkpoint(&FakeModel::at_epoch(1), CheckpointKind::Final, &metrics())
            .unwrap();
        fs::write(path.join("metadata.json"), "{ not json").unwrap();
        let err = manager.load_checkpoint(&path).unwrap_err();
        assert!(matches!(err, CheckpointError::MetadataParse { .. }));
    }
}
