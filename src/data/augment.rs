//! Augmentation policies as plain configuration records, and the augmenter
//! that executes them.
//!
//! A policy is an ordered list of steps, each firing with its own probability.
//! Anything that moves keypoints must move them exactly as it moves pixels.

use std::fmt;
use std::str::FromStr;

use rand::rngs::StdRng;
use rand::Rng;
use image::Luma;
use serde::{Deserialize, Serialize};

use super::raster::{GrayF32, Image};
use crate::error::ConfigError;
use crate::heatmap::{ImageSize, Point2};

/// Named augmentation strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AugmentationStrategy {
    AffineSimple,
    AffineComplex,
    AffineComplexElastic,
    AffineComplexElasticLight,
    AffineComplexElasticBlur,
    AffineComplexElasticBlurSharp,
    #[serde(rename = "TTA")]
    Tta,
}

impl AugmentationStrategy {
    pub const ALL: [AugmentationStrategy; 7] = [
        AugmentationStrategy::AffineSimple,
        AugmentationStrategy::AffineComplex,
        AugmentationStrategy::AffineComplexElastic,
        AugmentationStrategy::AffineComplexElasticLight,
        AugmentationStrategy::AffineComplexElasticBlur,
        AugmentationStrategy::AffineComplexElasticBlurSharp,
        AugmentationStrategy::Tta,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            AugmentationStrategy::AffineSimple => "AffineSimple",
            AugmentationStrategy::AffineComplex => "AffineComplex",
            AugmentationStrategy::AffineComplexElastic => "AffineComplexElastic",
            AugmentationStrategy::AffineComplexElasticLight => "AffineComplexElasticLight",
            AugmentationStrategy::AffineComplexElasticBlur => "AffineComplexElasticBlur",
            AugmentationStrategy::AffineComplexElasticBlurSharp => "AffineComplexElasticBlurSharp",
            AugmentationStrategy::Tta => "TTA",
        }
    }

    /// The versioned step list for this strategy.
    pub fn policy(&self) -> AugmentationPolicy {
        let affine_complex = AugmentStep::new(
            0.5,
            AugmentOp::Affine {
                rotate: (-45.0, 45.0),
                scale_x: (0.8, 1.2),
                scale_y: (0.8, 1.2),
                keep_aspect: false,
                translate_percent_x: (-0.07, 0.07),
                translate_percent_y: (-0.07, 0.07),
                shear: (-16.0, 16.0),
            },
        );
        let flip_ud = AugmentStep::new(0.5, AugmentOp::FlipVertical);
        let crop = AugmentStep::new(1.0, AugmentOp::CenterCrop);
        let blur = AugmentStep::new(
            0.5,
            AugmentOp::BlurOneOf {
                gaussian_sigma: (0.0, 0.2),
                kernel: (3, 5),
                pooling: 2,
            },
        );

        let steps = match self {
            AugmentationStrategy::AffineSimple => vec![
                AugmentStep::new(
                    0.75,
                    AugmentOp::Affine {
                        rotate: (-45.0, 45.0),
                        scale_x: (0.8, 1.2),
                        scale_y: (0.8, 1.2),
                        keep_aspect: true,
                        translate_percent_x: (0.0, 0.0),
                        translate_percent_y: (0.0, 0.0),
                        shear: (0.0, 0.0),
                    },
                ),
                flip_ud,
                crop,
            ],
            AugmentationStrategy::AffineComplex => vec![affine_complex, flip_ud, crop],
            AugmentationStrategy::AffineComplexElastic => vec![
                affine_complex,
                flip_ud,
                AugmentStep::new(
                    0.5,
                    AugmentOp::Elastic {
                        alpha: (0.0, 200.0),
                        sigma: (9.0, 13.0),
                    },
                ),
                crop,
            ],
            AugmentationStrategy::AffineComplexElasticLight => vec![
                affine_complex,
                flip_ud,
                AugmentStep::new(
                    0.5,
                    AugmentOp::Elastic {
                        alpha: (0.0, 50.0),
                        sigma: (5.0, 10.0),
                    },
                ),
                crop,
            ],
            AugmentationStrategy::AffineComplexElasticBlur => vec![
                affine_complex,
                flip_ud,
                AugmentStep::new(
                    0.5,
                    AugmentOp::Elastic {
                        alpha: (0.0, 50.0),
                        sigma: (2.0, 5.0),
                    },
                ),
                blur,
                crop,
            ],
            AugmentationStrategy::AffineComplexElasticBlurSharp => vec![
                affine_complex,
                flip_ud,
                AugmentStep::new(
                    0.5,
                    AugmentOp::Elastic {
                        alpha: (0.0, 50.0),
                        sigma: (2.0, 5.0),
                    },
                ),
                blur,
                AugmentStep::new(
                    0.5,
                    AugmentOp::SharpenSomeOf {
                        max_ops: 3,
                        sharpen_alpha: (0.0, 0.75),
                        sharpen_lightness: (0.0, 0.5),
                        emboss_alpha: (0.0, 0.5),
                        emboss_strength: (0.0, 1.0),
                        contrast: (0.4, 1.6),
                    },
                ),
                crop,
            ],
            AugmentationStrategy::Tta => vec![
                AugmentStep::new(
                    0.6,
                    AugmentOp::TranslatePx {
                        x: (-10.0, 10.0),
                        y: (-10.0, 10.0),
                    },
                ),
                flip_ud,
                AugmentStep::new(0.5, AugmentOp::FlipHorizontal),
            ],
        };

        AugmentationPolicy {
            name: self.name().to_string(),
            version: 1,
            steps,
        }
    }
}

impl fmt::Display for AugmentationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AugmentationStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AugmentationStrategy::ALL
            .iter()
            .copied()
            .find(|strategy| strategy.name() == s)
            .ok_or_else(|| ConfigError::Unsupported {
                kind: "augmentation strategy",
                name: s.to_string(),
                expected: AugmentationStrategy::ALL
                    .iter()
                    .map(|s| s.name())
                    .collect::<Vec<_>>()
                    .join(", "),
            })
    }
}

/// One augmentation operation with its parameter ranges. Ranges are sampled
/// uniformly and inclusively. Angles are in degrees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum AugmentOp {
    Affine {
        rotate: (f32, f32),
        scale_x: (f32, f32),
        scale_y: (f32, f32),
        /// Sample one scale factor for both axes.
        keep_aspect: bool,
        translate_percent_x: (f32, f32),
        translate_percent_y: (f32, f32),
        shear: (f32, f32),
    },
    FlipVertical,
    FlipHorizontal,
    TranslatePx {
        x: (f32, f32),
        y: (f32, f32),
    },
    /// Crop or pad around the centre to the augmenter's output size.
    CenterCrop,
    Elastic {
        alpha: (f32, f32),
        sigma: (f32, f32),
    },
    BlurOneOf {
        gaussian_sigma: (f32, f32),
        kernel: (usize, usize),
        pooling: usize,
    },
    SharpenSomeOf {
        max_ops: usize,
        sharpen_alpha: (f32, f32),
        sharpen_lightness: (f32, f32),
        emboss_alpha: (f32, f32),
        emboss_strength: (f32, f32),
        contrast: (f32, f32),
    },
}

impl AugmentOp {
    pub fn name(&self) -> &'static str {
        match self {
            AugmentOp::Affine { .. } => "affine",
            AugmentOp::FlipVertical => "flip_vertical",
            AugmentOp::FlipHorizontal => "flip_horizontal",
            AugmentOp::TranslatePx { .. } => "translate_px",
            AugmentOp::CenterCrop => "center_crop",
            AugmentOp::Elastic { .. } => "elastic",
            AugmentOp::BlurOneOf { .. } => "blur_one_of",
            AugmentOp::SharpenSomeOf { .. } => "sharpen_some_of",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AugmentStep {
    pub probability: f32,
    #[serde(flatten)]
    pub op: AugmentOp,
}

impl AugmentStep {
    pub fn new(probability: f32, op: AugmentOp) -> Self {
        AugmentStep { probability, op }
    }
}

/// Ordered, versioned list of augmentation steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AugmentationPolicy {
    pub name: String,
    pub version: u32,
    pub steps: Vec<AugmentStep>,
}

/// Result of augmenting one sample. Keypoints keep their input order and count;
/// points pushed outside the frame are kept as-is for the caller to detect.
#[derive(Debug, Clone)]
pub struct Augmented {
    pub image: Image,
    pub keypoints: Vec<Point2>,
}

/// Joint image + keypoint transform capability.
pub trait KeypointAugmenter: Send {
    fn augment(&self, image: &Image, keypoints: &[Point2], rng: &mut StdRng) -> Augmented;
}

/// 2D affine map: `x' = a x + b y + tx`, `y' = c x + d y + ty`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Affine2 {
    a: f32,
    b: f32,
    c: f32,
    d: f32,
    tx: f32,
    ty: f32,
}

impl Affine2 {
    const IDENTITY: Affine2 = Affine2 {
        a: 1.0,
        b: 0.0,
        c: 0.0,
        d: 1.0,
        tx: 0.0,
        ty: 0.0,
    };

    fn translation(tx: f32, ty: f32) -> Self {
        Affine2 { tx, ty, ..Self::IDENTITY }
    }

    fn linear(a: f32, b: f32, c: f32, d: f32) -> Self {
        Affine2 { a, b, c, d, tx: 0.0, ty: 0.0 }
    }

    fn apply(&self, p: Point2) -> Point2 {
        Point2::new(
            self.a * p.x + self.b * p.y + self.tx,
            self.c * p.x + self.d * p.y + self.ty,
        )
    }

    /// `next ∘ self`: apply `self` first, then `next`.
    fn then(&self, next: &Affine2) -> Affine2 {
        Affine2 {
            a: next.a * self.a + next.b * self.c,
            b: next.a * self.b + next.b * self.d,
            c: next.c * self.a + next.d * self.c,
            d: next.c * self.b + next.d * self.d,
            tx: next.a * self.tx + next.b * self.ty + next.tx,
            ty: next.c * self.tx + next.d * self.ty + next.ty,
        }
    }

    fn inverse(&self) -> Option<Affine2> {
        let det = self.a * self.d - self.b * self.c;
        if det.abs() < 1e-12 {
            return None;
        }
        let inv = 1.0 / det;
        let a = self.d * inv;
        let b = -self.b * inv;
        let c = -self.c * inv;
        let d = self.a * inv;
        Some(Affine2 {
            a,
            b,
            c,
            d,
            tx: -(a * self.tx + b * self.ty),
            ty: -(c * self.tx + d * self.ty),
        })
    }
}


/// Executes an [`AugmentationPolicy`] step by step.
///
/// Consecutive geometric steps are folded into one affine map and applied
/// with a single bilinear warp (zero fill) right before the next non-affine
/// step and at the end. Elastic deformation moves keypoints through the
/// inverse of its displacement field; blur and sharpen steps leave keypoints
/// untouched.
#[derive(Debug, Clone)]
pub struct PolicyAugmenter {
    policy: AugmentationPolicy,
    output_size: ImageSize,
}

impl PolicyAugmenter {
    /// Fails on a probability outside `[0, 1]` or an unusable parameter range.
    pub fn new(policy: AugmentationPolicy, output_size: ImageSize) -> Result<Self, ConfigError> {
        for step in &policy.steps {
            let invalid = |reason: String| {
                ConfigError::Validation(format!(
                    "augmentation step '{}' in policy {} v{}: {reason}",
                    step.op.name(),
                    policy.name,
                    policy.version
                ))
            };
            if !(0.0..=1.0).contains(&step.probability) {
                return Err(invalid(format!(
                    "probability {} not in [0, 1]",
                    step.probability
                )));
            }
            match &step.op {
                AugmentOp::Elastic { sigma, .. } if sigma.0 < 0.0 || sigma.1 < sigma.0 => {
                    return Err(invalid(format!("sigma range {sigma:?}")));
                }
                AugmentOp::BlurOneOf {
                    kernel, pooling, ..
                } => {
                    if kernel.0 == 0 || kernel.1 < kernel.0 {
                        return Err(invalid(format!("kernel range {kernel:?}")));
                    }
                    if *pooling == 0 {
                        return Err(invalid("pooling must be at least 1".into()));
                    }
                }
                _ => {}
            }
        }
        Ok(PolicyAugmenter {
            policy,
            output_size,
        })
    }

    pub fn from_strategy(
        strategy: AugmentationStrategy,
        output_size: ImageSize,
    ) -> Result<Self, ConfigError> {
        Self::new(strategy.policy(), output_size)
    }

    pub fn policy(&self) -> &AugmentationPolicy {
        &self.policy
    }

    /// Affine map for one geometric step on a `canvas`-sized frame. Crops
    /// update `canvas` to the output size.
    fn geometric(&self, op: &AugmentOp, canvas: &mut ImageSize, rng: &mut StdRng) -> Affine2 {
        let cx = (canvas.width as f32 - 1.0) / 2.0;
        let cy = (canvas.height as f32 - 1.0) / 2.0;

        match op {
            AugmentOp::Affine {
                rotate,
                scale_x,
                scale_y,
                keep_aspect,
                translate_percent_x,
                translate_percent_y,
                shear,
            } => {
                let sx = sample(rng, *scale_x);
                let sy = if *keep_aspect { sx } else { sample(rng, *scale_y) };
                let angle = sample(rng, *rotate).to_radians();
                let shear = sample(rng, *shear).to_radians();
                let tx = sample(rng, *translate_percent_x) * canvas.width as f32;
                let ty = sample(rng, *translate_percent_y) * canvas.height as f32;

                let (sin, cos) = angle.sin_cos();
                let scale = Affine2::linear(sx, 0.0, 0.0, sy);
                let shear = Affine2::linear(1.0, shear.tan(), 0.0, 1.0);
                let rotation = Affine2::linear(cos, -sin, sin, cos);

                Affine2::translation(-cx, -cy)
                    .then(&scale)
                    .then(&shear)
                    .then(&rotation)
                    .then(&Affine2::translation(cx + tx, cy + ty))
            }
            AugmentOp::FlipVertical => Affine2 {
                d: -1.0,
                ty: canvas.height as f32 - 1.0,
                ..Affine2::IDENTITY
            },
            AugmentOp::FlipHorizontal => Affine2 {
                a: -1.0,
                tx: canvas.width as f32 - 1.0,
                ..Affine2::IDENTITY
            },
            AugmentOp::TranslatePx { x, y } => {
                Affine2::translation(sample(rng, *x).round(), sample(rng, *y).round())
            }
            AugmentOp::CenterCrop => {
                let ox = (canvas.width as isize - self.output_size.width as isize) / 2;
                let oy = (canvas.height as isize - self.output_size.height as isize) / 2;
                *canvas = self.output_size;
                Affine2::translation(-(ox as f32), -(oy as f32))
            }
            AugmentOp::Elastic { .. } | AugmentOp::BlurOneOf { .. } | AugmentOp::SharpenSomeOf { .. } => {
                Affine2::IDENTITY
            }
        }
    }
}

impl KeypointAugmenter for PolicyAugmenter {
    fn augment(&self, image: &Image, keypoints: &[Point2], rng: &mut StdRng) -> Augmented {
        let mut out = Augmented {
            image: image.clone(),
            keypoints: keypoints.to_vec(),
        };
        let mut pending = Affine2::IDENTITY;
        let mut canvas = image.size();

        for step in &self.policy.steps {
            if step.probability < 1.0 && !rng.random_bool(step.probability as f64) {
                continue;
            }
            match &step.op {
                AugmentOp::Elastic { alpha, sigma } => {
                    warp_affine(&mut out, &pending, canvas);
                    pending = Affine2::IDENTITY;
                    let alpha = sample(rng, *alpha);
                    let sigma = sample(rng, *sigma);
                    elastic(&mut out, alpha, sigma, rng);
                }
                AugmentOp::BlurOneOf {
                    gaussian_sigma,
                    kernel,
                    pooling,
                } => {
                    warp_affine(&mut out, &pending, canvas);
                    pending = Affine2::IDENTITY;
                    out.image = match rng.random_range(0..4) {
                        0 => out.image.gaussian_blur(sample(rng, *gaussian_sigma)),
                        1 => box_filter(&out.image, rng.random_range(kernel.0..=kernel.1)),
                        2 => median_filter(&out.image, rng.random_range(kernel.0..=kernel.1) | 1),
                        _ => average_pool(&out.image, *pooling),
                    };
                }
                AugmentOp::SharpenSomeOf {
                    max_ops,
                    sharpen_alpha,
                    sharpen_lightness,
                    emboss_alpha,
                    emboss_strength,
                    contrast,
                } => {
                    warp_affine(&mut out, &pending, canvas);
                    pending = Affine2::IDENTITY;
                    let count = rng.random_range(0..=(*max_ops).min(3));
                    let mut chosen = rand::seq::index::sample(rng, 3, count).into_vec();
                    chosen.sort_unstable();
                    for op in chosen {
                        out.image = match op {
                            0 => {
                                let alpha = sample(rng, *sharpen_alpha);
                                let lightness = sample(rng, *sharpen_lightness);
                                convolve3x3(&out.image, &sharpen_kernel(alpha, lightness))
                            }
                            1 => {
                                let alpha = sample(rng, *emboss_alpha);
                                let strength = sample(rng, *emboss_strength);
                                convolve3x3(&out.image, &emboss_kernel(alpha, strength))
                            }
                            _ => linear_contrast(&out.image, sample(rng, *contrast)),
                        };
                    }
                }
                geometric => {
                    let next = self.geometric(geometric, &mut canvas, rng);
                    pending = pending.then(&next);
                }
            }
        }

        warp_affine(&mut out, &pending, canvas);
        out
    }
}

/// Warp image and keypoints by `transform` onto a `canvas`-sized frame.
/// A singular transform leaves both untouched.
fn warp_affine(out: &mut Augmented, transform: &Affine2, canvas: ImageSize) {
    if *transform == Affine2::IDENTITY && canvas == out.image.size() {
        return;
    }
    let Some(inverse) = transform.inverse() else {
        return;
    };

    let mut warped = Image::zeros(canvas);
    for y in 0..canvas.height {
        for x in 0..canvas.width {
            let src = inverse.apply(Point2::new(x as f32, y as f32));
            warped.put(x, y, out.image.sample_bilinear(src.x, src.y));
        }
    }
    out.image = warped;
    for p in &mut out.keypoints {
        *p = transform.apply(*p);
    }
}

/// Elastic deformation: output pixel `q` reads the input at `q + d(q)`, where
/// `d` is uniform noise in `[-1, 1]` smoothed with a Gaussian of `sigma` and
/// scaled by `alpha`. A keypoint at `p` moves to the `q` solving
/// `q + d(q) = p`, found by fixed-point iteration.
fn elastic(out: &mut Augmented, alpha: f32, sigma: f32, rng: &mut StdRng) {
    if alpha <= 0.0 {
        return;
    }
    let size = out.image.size();
    let mut noise = || {
        let buffer = GrayF32::from_fn(size.width as u32, size.height as u32, |_, _| {
            Luma([rng.random_range(-1.0f32..=1.0)])
        });
        Image::from_buffer(buffer).gaussian_blur(sigma).map(|v| v * alpha)
    };
    let dx = noise();
    let dy = noise();

    let mut warped = Image::zeros(size);
    for y in 0..size.height {
        for x in 0..size.width {
            let sx = x as f32 + dx.get(x, y);
            let sy = y as f32 + dy.get(x, y);
            warped.put(x, y, out.image.sample_bilinear(sx, sy));
        }
    }
    out.image = warped;

    let max_x = size.width.saturating_sub(1) as f32;
    let max_y = size.height.saturating_sub(1) as f32;
    for p in &mut out.keypoints {
        let target = *p;
        let mut q = target;
        for _ in 0..10 {
            let fx = q.x.clamp(0.0, max_x);
            let fy = q.y.clamp(0.0, max_y);
            q = Point2::new(
                target.x - dx.sample_bilinear(fx, fy),
                target.y - dy.sample_bilinear(fx, fy),
            );
        }
        *p = q;
    }
}

/// Window offsets for a `k`-wide kernel centred on the pixel.
fn window(k: usize) -> std::ops::RangeInclusive<isize> {
    let k = k.max(1) as isize;
    -((k - 1) / 2)..=k / 2
}

fn box_filter(image: &Image, k: usize) -> Image {
    let size = image.size();
    let mut out = Image::zeros(size);
    let n = (k.max(1) * k.max(1)) as f32;
    for y in 0..size.height as isize {
        for x in 0..size.width as isize {
            let mut sum = 0.0;
            for oy in window(k) {
                for ox in window(k) {
                    sum += image.get_clamped(x + ox, y + oy);
                }
            }
            out.put(x as usize, y as usize, sum / n);
        }
    }
    out
}

fn median_filter(image: &Image, k: usize) -> Image {
    let size = image.size();
    let mut out = Image::zeros(size);
    let mut values = Vec::with_capacity(k * k);
    for y in 0..size.height as isize {
        for x in 0..size.width as isize {
            values.clear();
            for oy in window(k) {
                for ox in window(k) {
                    values.push(image.get_clamped(x + ox, y + oy));
                }
            }
            values.sort_by(f32::total_cmp);
            out.put(x as usize, y as usize, values[values.len() / 2]);
        }
    }
    out
}

/// Average over `p`x`p` blocks, upsampled back to the input size.
fn average_pool(image: &Image, p: usize) -> Image {
    let size = image.size();
    let p = p.max(1);
    let blocks_w = size.width.div_ceil(p);
    let blocks_h = size.height.div_ceil(p);
    let mut sums = vec![0.0f32; blocks_w * blocks_h];
    let mut counts = vec![0usize; blocks_w * blocks_h];
    for y in 0..size.height {
        for x in 0..size.width {
            let b = (y / p) * blocks_w + x / p;
            sums[b] += image.get(x, y);
            counts[b] += 1;
        }
    }

    let mut out = Image::zeros(size);
    for y in 0..size.height {
        for x in 0..size.width {
            let b = (y / p) * blocks_w + x / p;
            out.put(x, y, sums[b] / counts[b] as f32);
        }
    }
    out
}

/// Identity blended with the sharpen kernel.
fn sharpen_kernel(alpha: f32, lightness: f32) -> [f32; 9] {
    let effect = [-1.0, -1.0, -1.0, -1.0, 8.0 + lightness, -1.0, -1.0, -1.0, -1.0];
    blend_with_identity(alpha, effect)
}

/// Identity blended with the emboss kernel.
fn emboss_kernel(alpha: f32, strength: f32) -> [f32; 9] {
    let s = strength;
    let effect = [-1.0 - s, -s, 0.0, -s, 1.0, s, 0.0, s, 1.0 + s];
    blend_with_identity(alpha, effect)
}

fn blend_with_identity(alpha: f32, effect: [f32; 9]) -> [f32; 9] {
    let mut kernel = effect.map(|v| alpha * v);
    kernel[4] += 1.0 - alpha;
    kernel
}

/// 3x3 convolution (row-major kernel) with clamped borders.
fn convolve3x3(image: &Image, kernel: &[f32; 9]) -> Image {
    let size = image.size();
    let mut out = Image::zeros(size);
    for y in 0..size.height as isize {
        for x in 0..size.width as isize {
            let mut acc = 0.0;
            for (i, k) in kernel.iter().enumerate() {
                let ox = (i % 3) as isize - 1;
                let oy = (i / 3) as isize - 1;
                acc += k * image.get_clamped(x + ox, y + oy);
            }
            out.put(x as usize, y as usize, acc);
        }
    }
    out
}

/// Scale intensities around the image mean.
fn linear_contrast(image: &Image, factor: f32) -> Image {
    let mean = image.mean();
    image.map(|v| mean + factor * (v - mean))
}

fn sample(rng: &mut StdRng, (lo, hi): (f32, f32)) -> f32 {
    if hi <= lo {
        lo
    } else {
        rng.random_range(lo..=hi)
    }
}
