use std::fmt;
use std::str::FromStr;

use burn::prelude::*;
use burn::tensor::ElementConversion;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, TrainingError};
use crate::heatmap::{decode_tensor, mean_radial_error, resize_heatmaps, to_level, ImageSize, Point2};
use crate::model::{DeepSupervisionLoss, HeatmapNetwork};

/// Resolution at which predictions are decoded and scored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationMode {
    /// Decode at input resolution and compare with input-resolution targets.
    #[default]
    InputResolution,
    /// Decode at input resolution, scale coordinates up to the original size.
    ScaleCoordinates,
    /// Resize the final heatmap to the original size, then decode.
    ResizeHeatmap,
}

impl EvaluationMode {
    pub const ALL: [EvaluationMode; 3] = [
        EvaluationMode::InputResolution,
        EvaluationMode::ScaleCoordinates,
        EvaluationMode::ResizeHeatmap,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            EvaluationMode::InputResolution => "input_resolution",
            EvaluationMode::ScaleCoordinates => "scale_coordinates",
            EvaluationMode::ResizeHeatmap => "resize_heatmap",
        }
    }

    /// Whether predictions are compared against original-resolution coordinates.
    pub fn uses_original_resolution(&self) -> bool {
        !matches!(self, EvaluationMode::InputResolution)
    }
}

impl fmt::Display for EvaluationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EvaluationMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EvaluationMode::ALL
            .iter()
            .copied()
            .find(|m| m.name() == s)
            .ok_or_else(|| ConfigError::Unsupported {
                kind: "evaluation mode",
                name: s.to_string(),
                expected: "input_resolution, scale_coordinates, resize_heatmap".into(),
            })
    }
}

/// Network output decoded into coordinates.
#[derive(Debug, Clone)]
pub struct Prediction<B: Backend> {
    /// Supervised output levels, coarsest first.
    pub levels: Vec<Tensor<B, 4>>,
    /// Finest output, resized to the original size in `ResizeHeatmap` mode.
    pub final_heatmap: Tensor<B, 4>,
    /// Per sample, per landmark, in the evaluation resolution.
    pub coords: Vec<Vec<Point2>>,
    pub peak_values: Vec<Vec<f32>>,
    /// Deep-supervision loss, when targets were supplied.
    pub loss: Option<f32>,
}

/// Runs a network forward and decodes its finest output.
#[derive(Debug, Clone)]
pub struct Predictor {
    loss: DeepSupervisionLoss,
    mode: EvaluationMode,
    input_size: ImageSize,
    original_size: ImageSize,
}

impl Predictor {
    pub fn new(
        loss: DeepSupervisionLoss,
        mode: EvaluationMode,
        input_size: ImageSize,
        original_size: ImageSize,
    ) -> Self {
        Predictor {
            loss,
            mode,
            input_size,
            original_size,
        }
    }

    pub fn mode(&self) -> EvaluationMode {
        self.mode
    }

    pub fn loss(&self) -> &DeepSupervisionLoss {
        &self.loss
    }

    /// Forward `images` and decode. `targets`, if given, hold at least the
    /// supervised levels (coarsest first); only the last ones are used.
    pub fn predict<B, N>(
        &self,
        network: &N,
        images: Tensor<B, 4>,
        targets: Option<&[Tensor<B, 4>]>,
    ) -> Result<Prediction<B>, TrainingError>
    where
        B: Backend,
        N: HeatmapNetwork<B>,
    {
        let outputs = network.forward_levels(images);
        let levels = supervised_tail(outputs, self.loss.num_supervised())?;

        let loss = match targets {
            Some(targets) => {
                let targets = supervised_slice(targets, self.loss.num_supervised())?;
                let value: f32 = self.loss.forward(&levels, targets).into_scalar().elem();
                Some(value)
            }
            None => None,
        };

        let finest = levels
            .last()
            .cloned()
            .ok_or(TrainingError::OutputLevels {
                produced: 0,
                required: 1,
            })?;
        let final_heatmap = match self.mode {
            EvaluationMode::ResizeHeatmap => resize_heatmaps(finest, self.original_size),
            _ => finest,
        };

        let peaks = decode_tensor(final_heatmap.clone())?;
        let mut coords = Vec::with_capacity(peaks.len());
        let mut peak_values = Vec::with_capacity(peaks.len());
        for sample in peaks {
            let points: Vec<Point2> = sample.iter().map(|p| p.to_point()).collect();
            coords.push(match self.mode {
                EvaluationMode::ScaleCoordinates => {
                    to_level(&points, self.input_size, self.original_size)
                }
                _ => points,
            });
            peak_values.push(sample.iter().map(|p| p.value).collect());
        }

        Ok(Prediction {
            levels,
            final_heatmap,
            coords,
            peak_values,
            loss,
        })
    }

    /// Mean radial error per sample against the ground truth matching the
    /// evaluation mode.
    pub fn coordinate_errors(
        &self,
        predicted: &[Vec<Point2>],
        target_coords: &[Vec<Point2>],
        full_res_coords: &[Vec<Point2>],
    ) -> Vec<f32> {
        let truth = if self.mode.uses_original_resolution() {
            full_res_coords
        } else {
            target_coords
        };
        predicted
            .iter()
            .zip(truth)
            .map(|(p, t)| mean_radial_error(p, t))
            .collect()
    }
}

/// Keep the last `k` levels of the network output.
pub fn supervised_tail<B: Backend>(
    mut outputs: Vec<Tensor<B, 4>>,
    k: usize,
) -> Result<Vec<Tensor<B, 4>>, TrainingError> {
    if outputs.len() < k || k == 0 {
        return Err(TrainingError::OutputLevels {
            produced: outputs.len(),
            required: k.max(1),
        });
    }
    Ok(outputs.split_off(outputs.len() - k))
}

fn supervised_slice<B: Backend>(
    targets: &[Tensor<B, 4>],
    k: usize,
) -> Result<&[Tensor<B, 4>], TrainingError> {
    if targets.len() < k || k == 0 {
        return Err(TrainingError::OutputLevels {
            produced: targets.len(),
            required: k.max(1),
        });
    }
    Ok(&targets[targets.len() - k..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::heatmaps_to_tensor;
    use crate::heatmap::encode;
    use crate::model::LossKind;
    use burn::backend::NdArray;
    use burn::module::Module;

    type TestBackend = NdArray<f32>;

    /// Returns fixed heatmaps regardless of input.
    #[derive(Module, Debug)]
    struct Oracle<B: Backend> {
        coarse: Tensor<B, 4>,
        fine: Tensor<B, 4>,
    }

    impl<B: Backend> HeatmapNetwork<B> for Oracle<B> {
        fn forward_levels(&self, _images: Tensor<B, 4>) -> Vec<Tensor<B, 4>> {
            vec![self.coarse.clone(), self.fine.clone()]
        }

        fn num_levels(&self) -> usize {
            2
        }
    }

    fn oracle(points: &[Point2]) -> Oracle<TestBackend> {
        let device = Default::default();
        let coarse_pts: Vec<Point2> = points.iter().map(|p| Point2::new(p.x / 2.0, p.y / 2.0)).collect();
        let coarse = encode(&coarse_pts, ImageSize::new(8, 8), &[1.0], 10.0).unwrap();
        let fine = encode(points, ImageSize::new(16, 16), &[1.0], 10.0).unwrap();
        Oracle {
            coarse: heatmaps_to_tensor(&[&coarse], &device),
            fine: heatmaps_to_tensor(&[&fine], &device),
        }
    }

    fn predictor(mode: EvaluationMode, k: usize) -> Predictor {
        Predictor::new(
            DeepSupervisionLoss::new(LossKind::Mse, k, 10.0),
            mode,
            ImageSize::new(16, 16),
            ImageSize::new(64, 32),
        )
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!(
            "resize_heatmap".parse::<EvaluationMode>().unwrap(),
            EvaluationMode::ResizeHeatmap
        );
        assert!("bogus".parse::<EvaluationMode>().is_err());
    }

    #[test]
    fn test_predict_input_resolution_with_loss() {
        let device = Default::default();
        let points = [Point2::new(4.0, 6.0), Point2::new(12.0, 2.0)];
        let net = oracle(&points);
        let targets = vec![net.coarse.clone(), net.fine.clone()];

        let p = predictor(EvaluationMode::InputResolution, 2)
            .predict(&net, Tensor::zeros([1, 1, 16, 16], &device), Some(targets.as_slice()))
            .unwrap();
        assert_eq!(p.levels.len(), 2);
        assert_eq!(p.coords, vec![points.to_vec()]);
        assert_eq!(p.peak_values, vec![vec![10.0, 10.0]]);
        assert!(p.loss.unwrap().abs() < 1e-6);
    }

    #[test]
    fn test_predict_only_last_level_when_k_is_one() {
        let device = Default::default();
        let net = oracle(&[Point2::new(4.0, 6.0)]);
        let p = predictor(EvaluationMode::InputResolution, 1)
            .predict(&net, Tensor::zeros([1, 1, 16, 16], &device), None)
            .unwrap();
        assert_eq!(p.levels.len(), 1);
        assert_eq!(p.levels[0].dims(), [1, 1, 16, 16]);
        assert!(p.loss.is_none());
    }

    #[test]
    fn test_scale_coordinates_mode() {
        let device = Default::default();
        let net = oracle(&[Point2::new(4.0, 6.0)]);
        let predictor = predictor(EvaluationMode::ScaleCoordinates, 1);
        let p = predictor
            .predict(&net, Tensor::zeros([1, 1, 16, 16], &device), None)
            .unwrap();
        // width 16 -> 32, height 16 -> 64
        assert_eq!(p.coords, vec![vec![Point2::new(8.0, 24.0)]]);

        let errors = predictor.coordinate_errors(
            &p.coords,
            &[vec![Point2::new(4.0, 6.0)]],
            &[vec![Point2::new(11.0, 28.0)]],
        );
        assert!((errors[0] - 5.0).abs() < 1e-5);
    }

    #[test]
    fn test_resize_heatmap_mode() {
        let device = Default::default();
        let net = oracle(&[Point2::new(8.0, 8.0)]);
        let p = predictor(EvaluationMode::ResizeHeatmap, 1)
            .predict(&net, Tensor::zeros([1, 1, 16, 16], &device), None)
            .unwrap();
        assert_eq!(p.final_heatmap.dims(), [1, 1, 64, 32]);
        let c = p.coords[0][0];
        // centre of pixel 8 maps to 16.5 / 33.5 in the resized grid
        assert!((c.x - 16.5).abs() <= 1.0, "{c:?}");
        assert!((c.y - 33.5).abs() <= 1.5, "{c:?}");
    }

    #[test]
    fn test_too_few_outputs() {
        let device = Default::default();
        let net = oracle(&[Point2::new(1.0, 1.0)]);
        let err = predictor(EvaluationMode::InputResolution, 3)
            .predict(&net, Tensor::zeros([1, 1, 16, 16], &device), None)
            .unwrap_err();
        assert!(matches!(
            err,
            TrainingError::OutputLevels {
                produced: 2,
                required: 3
            }
        ));
    }
}
