use image::imageops::FilterType;
use image::{ImageBuffer, Luma, RgbImage};
use ndarray::{Array2, ArrayView3};

/// A 2-D importance map with values normalized to [0, 1].
///
/// `synthetic` distinguishes a true gradient attribution from the
/// confidence-weighted fallback; consumers must surface the difference so an
/// operator never mistakes a placeholder for an attribution.
#[derive(Debug, Clone)]
pub struct ImportanceMap {
    grid: Array2<f32>,
    synthetic: bool,
}

impl ImportanceMap {
    pub fn new(grid: Array2<f32>, synthetic: bool) -> Self {
        Self { grid, synthetic }
    }

    /// Combine tap-layer activations with their gradients into a class
    /// activation map: per-channel weights are the spatial mean of the
    /// gradient, channels are weighted and summed, negative contributions are
    /// clipped, and the result is min-max normalized.
    pub fn from_gradients(activations: ArrayView3<'_, f32>, gradients: ArrayView3<'_, f32>) -> Self {
        let (channels, height, width) = activations.dim();
        let spatial = (height * width) as f32;
        let mut grid = Array2::<f32>::zeros((height, width));
        for c in 0..channels {
            let weight = gradients
                .index_axis(ndarray::Axis(0), c)
                .sum()
                / spatial;
            let channel = activations.index_axis(ndarray::Axis(0), c);
            for y in 0..height {
                for x in 0..width {
                    grid[[y, x]] += weight * channel[[y, x]];
                }
            }
        }
        grid.mapv_inplace(|v| v.max(0.0));
        let mut map = Self {
            grid,
            synthetic: false,
        };
        map.normalize();
        map
    }

    /// Confidence-weighted fallback: a Gaussian blob centered on the image,
    /// sigma = min(h, w) / 4, peak intensity equal to the classification
    /// confidence. Always succeeds.
    pub fn gaussian_fallback(height: usize, width: usize, confidence: f32) -> Self {
        let confidence = confidence.clamp(0.0, 1.0);
        let center_y = height as f32 / 2.0;
        let center_x = width as f32 / 2.0;
        let sigma = (height.min(width) as f32) / 4.0;
        let denom = 2.0 * sigma * sigma;
        let grid = Array2::from_shape_fn((height, width), |(y, x)| {
            let dy = y as f32 - center_y;
            let dx = x as f32 - center_x;
            (-(dx * dx + dy * dy) / denom).exp() * confidence
        });
        Self {
            grid,
            synthetic: true,
        }
    }

    pub fn grid(&self) -> &Array2<f32> {
        &self.grid
    }

    pub fn synthetic(&self) -> bool {
        self.synthetic
    }

    /// `(height, width)` of the map.
    pub fn dim(&self) -> (usize, usize) {
        self.grid.dim()
    }

    pub fn max_value(&self) -> f32 {
        self.grid.iter().copied().fold(0.0f32, f32::max)
    }

    /// Min-max normalize into [0, 1]; a flat map becomes all zeros.
    pub fn normalize(&mut self) {
        let max = self.grid.iter().copied().fold(f32::MIN, f32::max);
        let min = self.grid.iter().copied().fold(f32::MAX, f32::min);
        if max > min && max.is_finite() && min.is_finite() {
            self.grid.mapv_inplace(|v| (v - min) / (max - min));
        } else {
            self.grid.fill(0.0);
        }
    }

    /// Upsample to the input image's resolution with smooth (triangle)
    /// interpolation, preserving the synthetic tag.
    pub fn upsample(&self, width: u32, height: u32) -> Self {
        let (map_h, map_w) = self.grid.dim();
        if (map_w as u32, map_h as u32) == (width, height) {
            return self.clone();
        }
        let buffer: ImageBuffer<Luma<f32>, Vec<f32>> = ImageBuffer::from_fn(
            map_w as u32,
            map_h as u32,
            |x, y| Luma([self.grid[[y as usize, x as usize]]]),
        );
        let resized = image::imageops::resize(&buffer, width, height, FilterType::Triangle);
        let grid = Array2::from_shape_fn((height as usize, width as usize), |(y, x)| {
            resized.get_pixel(x as u32, y as u32)[0].clamp(0.0, 1.0)
        });
        Self {
            grid,
            synthetic: self.synthetic,
        }
    }

    /// Render with the jet colormap as an RGB image.
    pub fn to_rgb(&self) -> RgbImage {
        let (height, width) = self.grid.dim();
        RgbImage::from_fn(width as u32, height as u32, |x, y| {
            image::Rgb(jet(self.grid[[y as usize, x as usize]]))
        })
    }

    /// Alpha-blend the colormapped heatmap over the original image. The
    /// original is resized if its dimensions differ from the map's.
    pub fn overlay_on(&self, original: &RgbImage, alpha: f32) -> RgbImage {
        let (height, width) = self.grid.dim();
        let (width, height) = (width as u32, height as u32);
        let base = if original.dimensions() == (width, height) {
            original.clone()
        } else {
            image::imageops::resize(original, width, height, FilterType::Triangle)
        };
        let alpha = alpha.clamp(0.0, 1.0);
        RgbImage::from_fn(width, height, |x, y| {
            let bg = base.get_pixel(x, y);
            let fg = jet(self.grid[[y as usize, x as usize]]);
            let mut blended = [0u8; 3];
            for c in 0..3 {
                blended[c] =
                    (bg[c] as f32 * (1.0 - alpha) + fg[c] as f32 * alpha).round() as u8;
            }
            image::Rgb(blended)
        })
    }
}

/// Classic jet colormap over [0, 1].
fn jet(value: f32) -> [u8; 3] {
    let v = value.clamp(0.0, 1.0);
    let r = (1.5 - (4.0 * v - 3.0).abs()).clamp(0.0, 1.0);
    let g = (1.5 - (4.0 * v - 2.0).abs()).clamp(0.0, 1.0);
    let b = (1.5 - (4.0 * v - 1.0).abs()).clamp(0.0, 1.0);
    [(r * 255.0) as u8, (g * 255.0) as u8, (b * 255.0) as u8]
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    #[test]
    fn gradient_map_is_normalized_and_nonnegative() {
        let activations = Array3::from_shape_fn((2, 4, 4), |(c, y, x)| {
            (c + 1) as f32 * (y as f32 - x as f32)
        });
        let gradients = Array3::from_elem((2, 4, 4), 0.5f32);
        let map = ImportanceMap::from_gradients(activations.view(), gradients.view());
        assert!(!map.synthetic());
        for &v in map.grid().iter() {
            assert!((0.0..=1.0).contains(&v), "value {v} out of bounds");
        }
        assert!((map.max_value() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn fallback_peak_scales_with_confidence() {
        let dim = ImportanceMap::gaussian_fallback(32, 32, 0.5);
        let bright = ImportanceMap::gaussian_fallback(32, 32, 0.95);
        assert!(dim.synthetic());
        assert!(bright.synthetic());
        assert!(bright.max_value() > dim.max_value());
        assert!((dim.max_value() - 0.5).abs() < 0.05);
        assert!((bright.max_value() - 0.95).abs() < 0.05);
    }

    #[test]
    fn fallback_is_centered() {
        let map = ImportanceMap::gaussian_fallback(33, 33, 1.0);
        let center = map.grid()[[16, 16]];
        let corner = map.grid()[[0, 0]];
        assert!(center > corner);
        assert!((center - 1.0).abs() < 0.05);
    }

    #[test]
    fn flat_map_normalizes_to_zeros() {
        let mut map = ImportanceMap::new(Array2::from_elem((4, 4), 0.7f32), false);
        map.normalize();
        assert!(map.grid().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn upsample_matches_requested_resolution() {
        let map = ImportanceMap::gaussian_fallback(7, 7, 1.0);
        let big = map.upsample(56, 42);
        assert_eq!(big.dim(), (42, 56));
        assert!(big.synthetic());
        assert!(big.grid().iter().all(|&v| (0.0..=1.0).contains(&v)));
    }

    #[test]
    fn jet_endpoints() {
        assert_eq!(jet(0.0)[0], 0);
        assert_eq!(jet(1.0)[2], 0);
        assert!(jet(0.5)[1] > 200);
    }
}
