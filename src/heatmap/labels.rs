use super::codec::{encode, Heatmap};
use super::rescale::to_level_rounded;
use super::{ImageSize, Point2};
use crate::error::DataError;

/// Deep-supervision resolution levels.
///
/// Index 0 is the coarsest level and the last index is the finest, equal to
/// the model input size. Network outputs follow the same order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionPyramid {
    levels: Vec<ImageSize>,
}

impl ResolutionPyramid {
    /// Build `num_levels` levels by repeatedly halving `input_size`.
    pub fn new(input_size: ImageSize, num_levels: usize) -> Self {
        let mut levels = Vec::with_capacity(num_levels);
        let mut size = input_size;
        for _ in 0..num_levels {
            levels.push(size);
            size = size.halved();
        }
        levels.reverse();
        ResolutionPyramid { levels }
    }

    pub fn levels(&self) -> &[ImageSize] {
        &self.levels
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn finest(&self) -> Option<ImageSize> {
        self.levels.last().copied()
    }

    pub fn coarsest(&self) -> Option<ImageSize> {
        self.levels.first().copied()
    }
}

/// Renders per-level heatmap targets for one sample.
#[derive(Debug, Clone)]
pub struct LabelGenerator {
    pyramid: ResolutionPyramid,
    lambda_scale: f32,
}

impl LabelGenerator {
    pub fn new(input_size: ImageSize, num_levels: usize, lambda_scale: f32) -> Self {
        LabelGenerator {
            pyramid: ResolutionPyramid::new(input_size, num_levels),
            lambda_scale,
        }
    }

    pub fn pyramid(&self) -> &ResolutionPyramid {
        &self.pyramid
    }

    pub fn lambda_scale(&self) -> f32 {
        self.lambda_scale
    }

    /// One heatmap per pyramid level, coarsest first.
    ///
    /// `coords` are in input-resolution pixels. `sigmas` is the snapshot of the
    /// spread values the trainer is currently optimising (one shared value or
    /// one per landmark); the same sigma applies at every level.
    pub fn generate(&self, coords: &[Point2], sigmas: &[f32]) -> Result<Vec<Heatmap>, DataError> {
        let Some(input_size) = self.pyramid.finest() else {
            return Ok(Vec::new());
        };
        self.pyramid
            .levels()
            .iter()
            .map(|&level| {
                let scaled = to_level_rounded(coords, input_size, level);
                encode(&scaled, level, sigmas, self.lambda_scale)
            })
            .collect()
    }
}

/// Free-function form of [`LabelGenerator::generate`].
pub fn generate(
    coords: &[Point2],
    input_size: ImageSize,
    sigmas: &[f32],
    num_levels: usize,
    lambda_scale: f32,
) -> Result<Vec<Heatmap>, DataError> {
    LabelGenerator::new(input_size, num_levels, lambda_scale).generate(coords, sigmas)
}
