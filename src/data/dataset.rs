use log::{debug, warn};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use super::augment::KeypointAugmenter;
use super::raster::Image;
use crate::error::DataError;
use crate::heatmap::{to_level_rounded, Heatmap, ImageSize, LabelGenerator, Point2};

/// One raw sample as supplied by a data source.
///
/// `image` is already at the model input resolution; `landmarks` holds every
/// annotated landmark at the original image resolution.
#[derive(Debug, Clone)]
pub struct SourceSample {
    pub id: String,
    pub image: Image,
    pub landmarks: Vec<Point2>,
}

/// Indexable supplier of raw samples (file indexing and decoding live behind
/// this trait).
pub trait SampleSource: Send {
    fn len(&self) -> usize;

    fn get(&self, index: usize) -> Result<SourceSample, DataError>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Samples held in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemorySource {
    samples: Vec<SourceSample>,
}

impl InMemorySource {
    pub fn new(samples: Vec<SourceSample>) -> Self {
        InMemorySource { samples }
    }

    pub fn push(&mut self, sample: SourceSample) {
        self.samples.push(sample);
    }
}

impl SampleSource for InMemorySource {
    fn len(&self) -> usize {
        self.samples.len()
    }

    fn get(&self, index: usize) -> Result<SourceSample, DataError> {
        self.samples
            .get(index)
            .cloned()
            .ok_or(DataError::IndexOutOfRange {
                index,
                len: self.samples.len(),
            })
    }
}

/// How raw samples are turned into training samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSourceDescriptor {
    /// Indices into each sample's landmark list, in output order.
    pub landmarks: Vec<usize>,
    pub input_size: ImageSize,
    pub original_size: ImageSize,
    pub num_levels: usize,
    pub lambda_scale: f32,
    pub normalize: bool,
}

/// A fully prepared training sample.
#[derive(Debug, Clone)]
pub struct TrainingSample {
    pub id: String,
    pub image: Image,
    /// One heatmap stack per pyramid level, coarsest first.
    pub heatmaps: Vec<Heatmap>,
    /// Landmarks at input resolution (after augmentation, if any).
    pub target_coords: Vec<Point2>,
    /// Landmarks at original resolution, never augmented.
    pub full_res_coords: Vec<Point2>,
    /// Set when augmentation pushed landmarks out of frame.
    pub flagged: bool,
}

/// Produces heatmap-supervised samples from a [`SampleSource`].
pub struct LandmarkDataset {
    source: Box<dyn SampleSource>,
    descriptor: DataSourceDescriptor,
    augmenter: Option<Box<dyn KeypointAugmenter>>,
    labels: LabelGenerator,
}

impl LandmarkDataset {
    pub fn new(source: Box<dyn SampleSource>, descriptor: DataSourceDescriptor) -> Self {
        let labels = LabelGenerator::new(
            descriptor.input_size,
            descriptor.num_levels,
            descriptor.lambda_scale,
        );
        LandmarkDataset {
            source,
            descriptor,
            augmenter: None,
            labels,
        }
    }

    pub fn with_augmenter(mut self, augmenter: Box<dyn KeypointAugmenter>) -> Self {
        self.augmenter = Some(augmenter);
        self
    }

    pub fn len(&self) -> usize {
        self.source.len()
    }

    pub fn is_empty(&self) -> bool {
        self.source.is_empty()
    }

    pub fn descriptor(&self) -> &DataSourceDescriptor {
        &self.descriptor
    }

    pub fn num_landmarks(&self) -> usize {
        self.descriptor.landmarks.len()
    }

    /// Build sample `index`, rendering heatmaps with the given sigma snapshot.
    pub fn sample(
        &self,
        index: usize,
        sigmas: &[f32],
        rng: &mut StdRng,
    ) -> Result<TrainingSample, DataError> {
        let raw = self.source.get(index)?;
        let input_size = self.descriptor.input_size;

        let actual = raw.image.size();
        if actual != input_size {
            return Err(DataError::ImageSize {
                sample: raw.id,
                expected_h: input_size.height,
                expected_w: input_size.width,
                actual_h: actual.height,
                actual_w: actual.width,
            });
        }

        let full_res_coords = self
            .descriptor
            .landmarks
            .iter()
            .map(|&i| {
                raw.landmarks
                    .get(i)
                    .copied()
                    .ok_or_else(|| DataError::MissingLandmark {
                        sample: raw.id.clone(),
                        index: i,
                        available: raw.landmarks.len(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut target_coords =
            to_level_rounded(&full_res_coords, self.descriptor.original_size, input_size);
        let mut image = raw.image;
        let mut flagged = false;

        if let Some(augmenter) = &self.augmenter {
            let augmented = augmenter.augment(&image, &target_coords, rng);
            image = augmented.image;
            target_coords = augmented.keypoints.iter().map(Point2::rounded).collect();

            let in_frame = target_coords
                .iter()
                .filter(|p| p.in_bounds(image.size()))
                .count();
            if in_frame < target_coords.len() {
                warn!(
                    "sample '{}': {} of {} landmarks pushed out of frame by augmentation",
                    raw.id,
                    target_coords.len() - in_frame,
                    target_coords.len()
                );
                flagged = true;
            }
        }

        if self.descriptor.normalize {
            image = image.normalize_zscore();
        }

        let heatmaps = self.labels.generate(&target_coords, sigmas)?;
        debug!("prepared sample '{}' ({} levels)", raw.id, heatmaps.len());

        Ok(TrainingSample {
            id: raw.id,
            image,
            heatmaps,
            target_coords,
            full_res_coords,
            flagged,
        })
    }
}
