use burn::prelude::*;
use burn::tensor::module::interpolate;
use burn::tensor::ops::{InterpolateMode, InterpolateOptions};

use super::{ImageSize, Point2};
use crate::error::DataError;

/// Per-landmark heatmap stack for one sample at one resolution.
///
/// Layout is row-major `[landmark][y][x]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Heatmap {
    pub num_landmarks: usize,
    pub size: ImageSize,
    pub data: Vec<f32>,
}

/// Location and value of a heatmap channel's maximum.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Peak {
    pub x: usize,
    pub y: usize,
    pub value: f32,
}

impl Peak {
    pub fn to_point(&self) -> Point2 {
        Point2::new(self.x as f32, self.y as f32)
    }
}

impl Heatmap {
    pub fn zeros(num_landmarks: usize, size: ImageSize) -> Self {
        Heatmap {
            num_landmarks,
            size,
            data: vec![0.0; num_landmarks * size.area()],
        }
    }

    /// Borrow one landmark channel.
    pub fn channel(&self, landmark: usize) -> &[f32] {
        let area = self.size.area();
        &self.data[landmark * area..(landmark + 1) * area]
    }

    pub fn get(&self, landmark: usize, x: usize, y: usize) -> f32 {
        self.channel(landmark)[y * self.size.width + x]
    }

    /// Peak of every channel, in landmark order.
    pub fn decode(&self) -> Vec<Peak> {
        (0..self.num_landmarks)
            .map(|l| channel_peak(self.channel(l), self.size.width))
            .collect()
    }

    /// Peak coordinates only.
    pub fn decode_points(&self) -> Vec<Point2> {
        self.decode().iter().map(Peak::to_point).collect()
    }
}

/// Render one Gaussian per landmark over a `size` grid.
///
/// Each centre is the coordinate rounded to the nearest pixel; the peak value
/// equals `lambda_scale`. `sigmas` holds either one shared value or one value
/// per landmark. Centres outside the grid are legal and simply leave little or
/// no mass inside it. A non-positive sigma renders a single-pixel spike.
pub fn encode(
    coords: &[Point2],
    size: ImageSize,
    sigmas: &[f32],
    lambda_scale: f32,
) -> Result<Heatmap, DataError> {
    if sigmas.len() != 1 && sigmas.len() != coords.len() {
        return Err(DataError::SigmaCount {
            expected: coords.len(),
            actual: sigmas.len(),
        });
    }

    let mut heatmap = Heatmap::zeros(coords.len(), size);
    let area = size.area();

    for (l, coord) in coords.iter().enumerate() {
        let sigma = if sigmas.len() == 1 { sigmas[0] } else { sigmas[l] };
        let centre = coord.rounded();
        let gx = gaussian_profile(size.width, centre.x, sigma);
        let gy = gaussian_profile(size.height, centre.y, sigma);

        let channel = &mut heatmap.data[l * area..(l + 1) * area];
        for (y, &wy) in gy.iter().enumerate() {
            if wy == 0.0 {
                continue;
            }
            let row = &mut channel[y * size.width..(y + 1) * size.width];
            for (cell, &wx) in row.iter_mut().zip(&gx) {
                *cell = lambda_scale * wy * wx;
            }
        }
    }

    Ok(heatmap)
}

/// 1D Gaussian factor along one axis. The 2D isotropic Gaussian is separable,
/// so the grid value is `lambda * gy[y] * gx[x]`.
fn gaussian_profile(len: usize, centre: f32, sigma: f32) -> Vec<f32> {
    if sigma <= 0.0 {
        return (0..len)
            .map(|i| if i as f32 == centre { 1.0 } else { 0.0 })
            .collect();
    }
    let denom = 2.0 * (sigma as f64) * (sigma as f64);
    (0..len)
        .map(|i| {
            let d = i as f64 - centre as f64;
            (-(d * d) / denom).exp() as f32
        })
        .collect()
}

/// Argmax over a row-major channel. Ties keep the first cell in scan order.
fn channel_peak(channel: &[f32], width: usize) -> Peak {
    let mut best_idx = 0usize;
    let mut best = f32::NEG_INFINITY;
    for (i, &v) in channel.iter().enumerate() {
        if v > best {
            best = v;
            best_idx = i;
        }
    }
    Peak {
        x: best_idx % width,
        y: best_idx / width,
        value: channel.get(best_idx).copied().unwrap_or(f32::NAN),
    }
}

/// Decode a batched heatmap tensor `[batch, landmarks, H, W]` into one peak
/// list per sample.
///
/// The scan runs on the host so the tie-break is identical on every backend.
pub fn decode_tensor<B: Backend>(heatmaps: Tensor<B, 4>) -> Result<Vec<Vec<Peak>>, DataError> {
    let [batch, landmarks, height, width] = heatmaps.dims();
    let values = heatmaps
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| DataError::TensorRead(format!("{e:?}")))?;

    let area = height * width;
    Ok((0..batch)
        .map(|b| {
            (0..landmarks)
                .map(|l| {
                    let start = (b * landmarks + l) * area;
                    channel_peak(&values[start..start + area], width)
                })
                .collect()
        })
        .collect())
}

/// Bicubic resize of a heatmap batch to `size`, used to decode predictions at
/// the original image resolution.
pub fn resize_heatmaps<B: Backend>(heatmaps: Tensor<B, 4>, size: ImageSize) -> Tensor<B, 4> {
    let [_, _, height, width] = heatmaps.dims();
    if height == size.height && width == size.width {
        return heatmaps;
    }
    interpolate(
        heatmaps,
        [size.height, size.width],
        InterpolateOptions::new(InterpolateMode::Bicubic),
    )
}
