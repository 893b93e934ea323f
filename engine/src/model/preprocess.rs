use super::network::ModelError;
use image::imageops::FilterType;
use image::{ImageReader, RgbImage};
use std::io::Cursor;
use tch::Tensor;

/// Decode an uploaded image into an RGB buffer, keeping the original
/// resolution for overlay rendering and region reporting.
pub fn decode_rgb(image_data: &[u8]) -> Result<RgbImage, ModelError> {
    let decoded = ImageReader::new(Cursor::new(image_data))
        .with_guessed_format()?
        .decode()?;
    Ok(decoded.to_rgb8())
}

/// Resize to the model's square input resolution and convert to a normalized
/// `[1, 3, size, size]` CHW float tensor.
pub fn image_to_tensor(rgb: &RgbImage, size: u32) -> Tensor {
    let resized = image::imageops::resize(rgb, size, size, FilterType::Triangle);
    let side = size as usize;
    let mut chw = vec![0f32; 3 * side * side];
    for (x, y, pixel) in resized.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        for channel in 0..3 {
            chw[channel * side * side + y * side + x] = pixel[channel] as f32 / 255.0;
        }
    }
    Tensor::from_slice(&chw).reshape([1, 3, size as i64, size as i64])
}

/// Decode and preprocess in one step; returns the input tensor together with
/// the original image dimensions `(width, height)`.
pub fn decode_to_tensor(image_data: &[u8], size: u32) -> Result<(Tensor, u32, u32), ModelError> {
    let rgb = decode_rgb(image_data)?;
    let (width, height) = rgb.dimensions();
    Ok((image_to_tensor(&rgb, size), width, height))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn encode_png(img: &RgbImage) -> Vec<u8> {
        let mut buf = Vec::new();
        image::DynamicImage::ImageRgb8(img.clone())
            .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        buf
    }

    #[test]
    fn tensor_has_model_input_shape() {
        let img = RgbImage::from_pixel(64, 48, Rgb([128, 64, 255]));
        let tensor = image_to_tensor(&img, 32);
        assert_eq!(tensor.size(), vec![1, 3, 32, 32]);
    }

    #[test]
    fn tensor_values_are_normalized() {
        let img = RgbImage::from_pixel(16, 16, Rgb([255, 0, 127]));
        let tensor = image_to_tensor(&img, 16);
        let max = tensor.max().double_value(&[]);
        let min = tensor.min().double_value(&[]);
        assert!(max <= 1.0 + 1e-6);
        assert!(min >= 0.0);
    }

    #[test]
    fn decode_roundtrip_keeps_dimensions() {
        let img = RgbImage::from_pixel(40, 30, Rgb([10, 20, 30]));
        let bytes = encode_png(&img);
        let (_, width, height) = decode_to_tensor(&bytes, 16).unwrap();
        assert_eq!((width, height), (40, 30));
    }

    #[test]
    fn garbage_bytes_are_a_fatal_decode_error() {
        let result = decode_rgb(&[0u8, 1, 2, 3, 4]);
        assert!(result.is_err());
    }
}
