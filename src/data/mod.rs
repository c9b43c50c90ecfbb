//! Sample preparation: images, augmentation, dataset and batching.

pub mod augment;
pub mod dataset;
pub mod loader;
pub mod raster;

pub use augment::{
    AugmentOp, AugmentStep, AugmentationPolicy, AugmentationStrategy, Augmented,
    KeypointAugmenter, PolicyAugmenter,
};
pub use dataset::{
    DataSourceDescriptor, InMemorySource, LandmarkDataset, SampleSource, SourceSample,
    TrainingSample,
};
pub use loader::{collate, heatmaps_to_tensor, Batch, CyclingLoader};
pub use raster::{GrayF32, Image};
