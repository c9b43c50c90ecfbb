mod manager;
mod metadata;

pub use manager::{CheckpointData, CheckpointManager, CheckpointManagerConfig, Checkpointable};
pub use metadata::{
    CheckpointHyperparameters, CheckpointKind, CheckpointMetadata, CheckpointMetrics,
    CheckpointState,
};
