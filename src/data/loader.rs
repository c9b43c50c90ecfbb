use burn::prelude::*;
use burn::tensor::TensorData;
use log::debug;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use super::dataset::{LandmarkDataset, TrainingSample};
use crate::error::DataError;
use crate::heatmap::{Heatmap, ImageSize, Point2};

/// A collated mini-batch.
#[derive(Debug, Clone)]
pub struct Batch<B: Backend> {
    /// `[batch, 1, H, W]`
    pub images: Tensor<B, 4>,
    /// One `[batch, landmarks, h, w]` tensor per pyramid level, coarsest first.
    pub targets: Vec<Tensor<B, 4>>,
    pub target_coords: Vec<Vec<Point2>>,
    pub full_res_coords: Vec<Vec<Point2>>,
    pub ids: Vec<String>,
    pub flagged: Vec<bool>,
}

impl<B: Backend> Batch<B> {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Endless mini-batch iterator over a dataset.
///
/// Walks a permutation of the dataset; when it runs out, the order is
/// reshuffled (if enabled) and iteration restarts, so an epoch is defined by
/// the number of batches drawn rather than by dataset size. Batches are always
/// full and may straddle a restart.
pub struct CyclingLoader {
    dataset: LandmarkDataset,
    batch_size: usize,
    shuffle: bool,
    order: Vec<usize>,
    cursor: usize,
    restarts: usize,
    rng: StdRng,
}

impl CyclingLoader {
    pub fn new(
        dataset: LandmarkDataset,
        batch_size: usize,
        shuffle: bool,
        seed: u64,
    ) -> Result<Self, DataError> {
        if dataset.is_empty() {
            return Err(DataError::EmptySource);
        }
        let mut loader = CyclingLoader {
            order: (0..dataset.len()).collect(),
            dataset,
            batch_size: batch_size.max(1),
            shuffle,
            cursor: 0,
            restarts: 0,
            rng: StdRng::seed_from_u64(seed),
        };
        if loader.shuffle {
            loader.order.shuffle(&mut loader.rng);
        }
        Ok(loader)
    }

    pub fn dataset(&self) -> &LandmarkDataset {
        &self.dataset
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// How many times the loader has wrapped around the dataset.
    pub fn restarts(&self) -> usize {
        self.restarts
    }

    /// Move back to the start of the current order without reshuffling.
    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    fn next_index(&mut self) -> usize {
        if self.cursor >= self.order.len() {
            self.cursor = 0;
            self.restarts += 1;
            if self.shuffle {
                self.order.shuffle(&mut self.rng);
            }
            debug!("loader exhausted, restarting (restart #{})", self.restarts);
        }
        let index = self.order[self.cursor];
        self.cursor += 1;
        index
    }

    /// Draw the next batch, rendering targets with the given sigma snapshot.
    pub fn next_batch<B: Backend>(
        &mut self,
        sigmas: &[f32],
        device: &B::Device,
    ) -> Result<Batch<B>, DataError> {
        let mut samples = Vec::with_capacity(self.batch_size);
        for _ in 0..self.batch_size {
            let index = self.next_index();
            samples.push(self.dataset.sample(index, sigmas, &mut self.rng)?);
        }
        Ok(collate(samples, device))
    }

    /// Draw the next batch of the current pass without wrapping around.
    ///
    /// The last batch of a pass may be short; `None` once every sample of the
    /// pass has been drawn. Call [`rewind`](Self::rewind) to start a new pass.
    pub fn next_batch_in_pass<B: Backend>(
        &mut self,
        sigmas: &[f32],
        device: &B::Device,
    ) -> Result<Option<Batch<B>>, DataError> {
        let end = (self.cursor + self.batch_size).min(self.order.len());
        if self.cursor >= end {
            return Ok(None);
        }
        let mut samples = Vec::with_capacity(end - self.cursor);
        while self.cursor < end {
            let index = self.order[self.cursor];
            self.cursor += 1;
            samples.push(self.dataset.sample(index, sigmas, &mut self.rng)?);
        }
        Ok(Some(collate(samples, device)))
    }
}

/// Stack prepared samples into batch tensors.
pub fn collate<B: Backend>(samples: Vec<TrainingSample>, device: &B::Device) -> Batch<B> {
    let n = samples.len();
    let image_size = samples
        .first()
        .map(|s| s.image.size())
        .unwrap_or(ImageSize::new(0, 0));

    let mut pixels = Vec::with_capacity(n * image_size.area());
    for s in &samples {
        pixels.extend_from_slice(s.image.pixels());
    }
    let images = Tensor::<B, 4>::from_data(
        TensorData::new(pixels, [n, 1, image_size.height, image_size.width]),
        device,
    );

    let levels = samples.first().map(|s| s.heatmaps.len()).unwrap_or(0);
    let targets = (0..levels)
        .map(|level| {
            let per_sample: Vec<&Heatmap> = samples.iter().map(|s| &s.heatmaps[level]).collect();
            heatmaps_to_tensor(&per_sample, device)
        })
        .collect();

    let mut batch = Batch {
        images,
        targets,
        target_coords: Vec::with_capacity(n),
        full_res_coords: Vec::with_capacity(n),
        ids: Vec::with_capacity(n),
        flagged: Vec::with_capacity(n),
    };
    for s in samples {
        batch.target_coords.push(s.target_coords);
        batch.full_res_coords.push(s.full_res_coords);
        batch.ids.push(s.id);
        batch.flagged.push(s.flagged);
    }
    batch
}

/// `[len, landmarks, H, W]` tensor from same-shaped heatmaps.
pub fn heatmaps_to_tensor<B: Backend>(heatmaps: &[&Heatmap], device: &B::Device) -> Tensor<B, 4> {
    let (landmarks, size) = heatmaps
        .first()
        .map(|h| (h.num_landmarks, h.size))
        .unwrap_or((0, ImageSize::new(0, 0)));
    let mut data = Vec::with_capacity(heatmaps.len() * landmarks * size.area());
    for h in heatmaps {
        data.extend_from_slice(&h.data);
    }
    Tensor::from_data(
        TensorData::new(data, [heatmaps.len(), landmarks, size.height, size.width]),
        device,
    )
}
