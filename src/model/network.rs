use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{PaddingConfig2d, Relu};
use burn::prelude::*;
use burn::tensor::module::interpolate;
use burn::tensor::ops::{InterpolateMode, InterpolateOptions};

/// A network that maps an image batch to one heatmap batch per resolution
/// level.
///
/// Outputs are ordered coarsest first; the last output has the input's
/// spatial size. Each output is `[batch, landmarks, h, w]`.
pub trait HeatmapNetwork<B: Backend>: Module<B> {
    fn forward_levels(&self, images: Tensor<B, 4>) -> Vec<Tensor<B, 4>>;

    fn num_levels(&self) -> usize;
}

/// Two 3x3 convolutions with ReLU. The first may downsample by 2.
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    conv1: Conv2d<B>,
    conv2: Conv2d<B>,
    relu: Relu,
}

impl<B: Backend> ConvBlock<B> {
    fn new(in_channels: usize, out_channels: usize, downsample: bool, device: &B::Device) -> Self {
        let stride = if downsample { 2 } else { 1 };
        ConvBlock {
            conv1: Conv2dConfig::new([in_channels, out_channels], [3, 3])
                .with_stride([stride, stride])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device),
            conv2: Conv2dConfig::new([out_channels, out_channels], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device),
            relu: Relu::new(),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.relu.forward(self.conv1.forward(x));
        self.relu.forward(self.conv2.forward(x))
    }
}

/// U-Net style encoder/decoder with a 1x1 heatmap head at every level.
///
/// ```text
/// Input [batch, in_channels, H, W]
/// Encoder level 0:   ConvBlock -> base_features          @ H x W
/// Encoder level i:   ConvBlock (stride 2) -> features(i) @ H/2^i
/// Decoder level i:   upsample(level i+1) ++ skip(i) -> ConvBlock -> features(i)
/// Head level i:      1x1 conv -> num_landmarks
/// ```
/// `features(i) = min(base_features * 2^i, max_features)`. The bottleneck
/// (deepest encoder level) also gets a head, so there are `depth` outputs.
#[derive(Module, Debug)]
pub struct PyramidNet<B: Backend> {
    encoders: Vec<ConvBlock<B>>,
    decoders: Vec<ConvBlock<B>>,
    heads: Vec<Conv2d<B>>,
}

#[derive(Config, Debug)]
pub struct PyramidNetConfig {
    pub num_landmarks: usize,
    /// Number of resolution levels, including the full-resolution one.
    pub depth: usize,
    #[config(default = 1)]
    pub in_channels: usize,
    #[config(default = 16)]
    pub base_features: usize,
    #[config(default = 256)]
    pub max_features: usize,
}

impl PyramidNetConfig {
    pub fn features(&self, level: usize) -> usize {
        (self.base_features << level).min(self.max_features)
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> PyramidNet<B> {
        let depth = self.depth.max(1);

        let encoders = (0..depth)
            .map(|level| {
                let in_channels = if level == 0 {
                    self.in_channels
                } else {
                    self.features(level - 1)
                };
                ConvBlock::new(in_channels, self.features(level), level > 0, device)
            })
            .collect();

        let decoders = (0..depth - 1)
            .map(|level| {
                ConvBlock::new(
                    self.features(level + 1) + self.features(level),
                    self.features(level),
                    false,
                    device,
                )
            })
            .collect();

        let heads = (0..depth)
            .map(|level| Conv2dConfig::new([self.features(level), self.num_landmarks], [1, 1]).init(device))
            .collect();

        PyramidNet {
            encoders,
            decoders,
            heads,
        }
    }
}

impl<B: Backend> HeatmapNetwork<B> for PyramidNet<B> {
    fn forward_levels(&self, images: Tensor<B, 4>) -> Vec<Tensor<B, 4>> {
        let depth = self.encoders.len();
        let mut skips = Vec::with_capacity(depth);
        let mut x = images;
        for encoder in &self.encoders {
            x = encoder.forward(x);
            skips.push(x.clone());
        }

        let bottom = depth - 1;
        let mut outputs = Vec::with_capacity(depth);
        outputs.push(self.heads[bottom].forward(x.clone()));

        for level in (0..bottom).rev() {
            let skip = skips[level].clone();
            let [_, _, height, width] = skip.dims();
            let up = interpolate(
                x,
                [height, width],
                InterpolateOptions::new(InterpolateMode::Nearest),
            );
            x = self.decoders[level].forward(Tensor::cat(vec![up, skip], 1));
            outputs.push(self.heads[level].forward(x.clone()));
        }

        outputs
    }

    fn num_levels(&self) -> usize {
        self.encoders.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_output_levels_coarsest_first() {
        let device = Default::default();
        let config = PyramidNetConfig::new(3, 4).with_base_features(4);
        let network = config.init::<TestBackend>(&device);

        let outputs = network.forward_levels(Tensor::zeros([2, 1, 32, 24], &device));
        assert_eq!(network.num_levels(), 4);
        let dims: Vec<[usize; 4]> = outputs.iter().map(|t| t.dims()).collect();
        assert_eq!(
            dims,
            vec![[2, 3, 4, 3], [2, 3, 8, 6], [2, 3, 16, 12], [2, 3, 32, 24]]
        );
    }

    #[test]
    fn test_single_level() {
        let device = Default::default();
        let network = PyramidNetConfig::new(2, 1).init::<TestBackend>(&device);
        let outputs = network.forward_levels(Tensor::zeros([1, 1, 8, 8], &device));
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].dims(), [1, 2, 8, 8]);
    }

    #[test]
    fn test_feature_cap() {
        let config = PyramidNetConfig::new(1, 6)
            .with_base_features(32)
            .with_max_features(128);
        assert_eq!(config.features(0), 32);
        assert_eq!(config.features(2), 128);
        assert_eq!(config.features(5), 128);
    }
}
