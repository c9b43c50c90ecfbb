use super::{ImageSize, Point2};

/// Scale coordinates from the `from` grid to the `to` grid, per axis.
///
/// Results stay fractional; use this for error metrics.
pub fn to_level(coords: &[Point2], from: ImageSize, to: ImageSize) -> Vec<Point2> {
    let sx = to.width as f32 / from.width as f32;
    let sy = to.height as f32 / from.height as f32;
    coords
        .iter()
        .map(|c| Point2::new(c.x * sx, c.y * sy))
        .collect()
}

/// Like [`to_level`] but snapped to the nearest pixel of the target grid.
pub fn to_level_rounded(coords: &[Point2], from: ImageSize, to: ImageSize) -> Vec<Point2> {
    to_level(coords, from, to)
        .iter()
        .map(Point2::rounded)
        .collect()
}
