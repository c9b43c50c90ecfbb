use image::imageops;
use image::{ImageBuffer, Luma};

use crate::heatmap::ImageSize;

/// Float grayscale buffer from the `image` crate.
pub type GrayF32 = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Single-channel float image.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    buffer: GrayF32,
}

impl Image {
    /// Row-major pixels; `None` when the length does not match `size`.
    pub fn from_raw(size: ImageSize, pixels: Vec<f32>) -> Option<Self> {
        ImageBuffer::from_raw(size.width as u32, size.height as u32, pixels)
            .map(|buffer| Image { buffer })
    }

    pub fn from_buffer(buffer: GrayF32) -> Self {
        Image { buffer }
    }

    pub fn zeros(size: ImageSize) -> Self {
        Image {
            buffer: ImageBuffer::new(size.width as u32, size.height as u32),
        }
    }

    pub fn size(&self) -> ImageSize {
        let (width, height) = self.buffer.dimensions();
        ImageSize::new(height as usize, width as usize)
    }

    pub fn buffer(&self) -> &GrayF32 {
        &self.buffer
    }

    pub fn pixels(&self) -> &[f32] {
        self.buffer.as_raw()
    }

    pub fn pixels_mut(&mut self) -> &mut [f32] {
        &mut self.buffer
    }

    pub fn get(&self, x: usize, y: usize) -> f32 {
        self.buffer.get_pixel(x as u32, y as u32).0[0]
    }

    pub fn put(&mut self, x: usize, y: usize, value: f32) {
        self.buffer.put_pixel(x as u32, y as u32, Luma([value]));
    }

    /// Pixel lookup clamped to the border.
    pub fn get_clamped(&self, x: isize, y: isize) -> f32 {
        let size = self.size();
        let x = x.clamp(0, size.width as isize - 1) as usize;
        let y = y.clamp(0, size.height as isize - 1) as usize;
        self.get(x, y)
    }

    /// Bilinear sample at a sub-pixel position, 0.0 outside the image.
    pub fn sample_bilinear(&self, x: f32, y: f32) -> f32 {
        imageops::interpolate_bilinear(&self.buffer, x, y).map_or(0.0, |p| p.0[0])
    }

    /// Gaussian blur; `sigma <= 0` is the identity.
    pub fn gaussian_blur(&self, sigma: f32) -> Image {
        if sigma.is_nan() || sigma <= 0.0 {
            return self.clone();
        }
        Image {
            buffer: imageops::blur(&self.buffer, sigma),
        }
    }

    pub fn map(&self, f: impl Fn(f32) -> f32) -> Image {
        let mut out = self.clone();
        for v in out.pixels_mut() {
            *v = f(*v);
        }
        out
    }

    pub fn mean(&self) -> f32 {
        let n = self.pixels().len().max(1) as f64;
        (self.pixels().iter().map(|&v| v as f64).sum::<f64>() / n) as f32
    }

    /// Zero-mean, unit-variance intensities. A constant image maps to zeros.
    pub fn normalize_zscore(&self) -> Image {
        let mean = self.mean() as f64;
        let n = self.pixels().len().max(1) as f64;
        let var = self
            .pixels()
            .iter()
            .map(|&v| {
                let d = v as f64 - mean;
                d * d
            })
            .sum::<f64>()
            / n;
        let std = var.sqrt();

        if std < 1e-12 {
            return self.map(|_| 0.0);
        }
        self.map(|v| ((v as f64 - mean) / std) as f32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zscore_statistics() {
        let img = Image::from_raw(ImageSize::new(2, 3), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let norm = img.normalize_zscore();
        let mean: f32 = norm.pixels().iter().sum::<f32>() / 6.0;
        let var: f32 = norm.pixels().iter().map(|v| (v - mean).powi(2)).sum::<f32>() / 6.0;
        assert!(mean.abs() < 1e-5);
        assert!((var - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_zscore_constant_image() {
        let img = Image::from_raw(ImageSize::new(2, 2), vec![7.0; 4]).unwrap();
        assert_eq!(img.normalize_zscore().pixels(), &[0.0; 4]);
    }

    #[test]
    fn test_from_raw_checks_length() {
        assert!(Image::from_raw(ImageSize::new(2, 2), vec![0.0; 3]).is_none());
    }

    #[test]
    fn test_row_major_layout() {
        let img = Image::from_raw(ImageSize::new(2, 3), vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]).unwrap();
        assert_eq!(img.size(), ImageSize::new(2, 3));
        assert_eq!(img.get(2, 0), 2.0);
        assert_eq!(img.get(0, 1), 3.0);
    }

    #[test]
    fn test_bilinear_sampling() {
        let img = Image::from_raw(ImageSize::new(1, 2), vec![2.0, 4.0]).unwrap();
        assert!((img.sample_bilinear(0.5, 0.0) - 3.0).abs() < 1e-6);
        assert!((img.sample_bilinear(0.25, 0.0) - 2.5).abs() < 1e-6);
        assert_eq!(img.sample_bilinear(-1.0, 0.0), 0.0);
        assert_eq!(img.sample_bilinear(2.0, 0.0), 0.0);
    }

    #[test]
    fn test_clamped_lookup() {
        let img = Image::from_raw(ImageSize::new(1, 2), vec![3.0, 4.0]).unwrap();
        assert_eq!(img.get_clamped(5, 0), 4.0);
        assert_eq!(img.get_clamped(-1, 3), 3.0);
    }

    #[test]
    fn test_gaussian_blur_spreads_a_spike_and_keeps_mass() {
        let mut img = Image::zeros(ImageSize::new(15, 15));
        img.put(7, 7, 1.0);
        let blurred = img.gaussian_blur(1.5);
        assert!(blurred.get(7, 7) < 1.0);
        assert!(blurred.get(8, 7) > 0.0);
        let total: f32 = blurred.pixels().iter().sum();
        assert!((total - 1.0).abs() < 1e-2, "{total}");
        assert_eq!(img.gaussian_blur(0.0), img);
    }
}
