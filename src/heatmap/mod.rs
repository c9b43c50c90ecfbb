//! Heatmap supervision primitives: Gaussian encoding/decoding of landmark
//! coordinates, resolution rescaling, and the deep-supervision label pyramid.

pub mod codec;
pub mod labels;
pub mod rescale;

pub use codec::{decode_tensor, encode, resize_heatmaps, Heatmap, Peak};
pub use labels::{LabelGenerator, ResolutionPyramid};
pub use rescale::{to_level, to_level_rounded};

use serde::{Deserialize, Serialize};

/// A 2D landmark position in pixel space. `x` indexes columns, `y` rows.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point2 {
    pub x: f32,
    pub y: f32,
}

impl Point2 {
    pub fn new(x: f32, y: f32) -> Self {
        Point2 { x, y }
    }

    pub fn distance(&self, other: &Point2) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }

    /// Both coordinates rounded to the nearest integer.
    pub fn rounded(&self) -> Point2 {
        Point2 {
            x: self.x.round(),
            y: self.y.round(),
        }
    }

    /// Whether the rounded point lies inside a grid of the given size.
    pub fn in_bounds(&self, size: ImageSize) -> bool {
        let p = self.rounded();
        p.x >= 0.0 && p.y >= 0.0 && (p.x as usize) < size.width && (p.y as usize) < size.height
    }
}

/// Spatial extent of an image or heatmap grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageSize {
    pub height: usize,
    pub width: usize,
}

impl ImageSize {
    pub fn new(height: usize, width: usize) -> Self {
        ImageSize { height, width }
    }

    pub fn area(&self) -> usize {
        self.height * self.width
    }

    /// The next coarser pyramid level: both axes halved (integer division).
    pub fn halved(&self) -> ImageSize {
        ImageSize {
            height: self.height / 2,
            width: self.width / 2,
        }
    }
}

/// Mean Euclidean distance between paired point sets.
///
/// Returns 0.0 for empty input. Extra points on either side are ignored.
pub fn mean_radial_error(predicted: &[Point2], truth: &[Point2]) -> f32 {
    let n = predicted.len().min(truth.len());
    if n == 0 {
        return 0.0;
    }
    let total: f32 = predicted
        .iter()
        .zip(truth)
        .map(|(p, t)| p.distance(t))
        .sum();
    total / n as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance() {
        let a = Point2::new(0.0, 0.0);
        let b = Point2::new(3.0, 4.0);
        assert!((a.distance(&b) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_in_bounds_uses_rounding() {
        let size = ImageSize::new(10, 20);
        assert!(Point2::new(19.4, 9.4).in_bounds(size));
        assert!(!Point2::new(19.6, 0.0).in_bounds(size));
        assert!(!Point2::new(-0.6, 0.0).in_bounds(size));
        assert!(Point2::new(-0.4, 0.0).in_bounds(size));
    }

    #[test]
    fn test_halved() {
        assert_eq!(ImageSize::new(512, 256).halved(), ImageSize::new(256, 128));
        assert_eq!(ImageSize::new(5, 3).halved(), ImageSize::new(2, 1));
    }

    #[test]
    fn test_mean_radial_error() {
        let pred = [Point2::new(0.0, 0.0), Point2::new(10.0, 10.0)];
        let truth = [Point2::new(3.0, 4.0), Point2::new(10.0, 10.0)];
        assert!((mean_radial_error(&pred, &truth) - 2.5).abs() < 1e-6);
        assert_eq!(mean_radial_error(&[], &truth), 0.0);
    }
}
