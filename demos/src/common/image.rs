//! Image conversion for the inference front-end

use anyhow::{Context, Result};
use burn::tensor::{backend::Backend, DType, Tensor, TensorData};
use image::{imageops::FilterType, DynamicImage, GrayImage, ImageBuffer, Luma, Rgb, RgbImage};

/// ImageNet channel means
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
/// ImageNet channel standard deviations
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Color painted over foreground pixels in the overlay
pub const OVERLAY_COLOR: Rgb<u8> = Rgb([255, 0, 0]);

/// Conversions between images and model tensors
pub struct ImageUtils;

impl ImageUtils {
    /// Resize `img` to `size`x`size` (bilinear) and normalize it with the ImageNet
    /// statistics.
    ///
    /// # Returns
    /// Tensor of shape [1, 3, size, size]
    pub fn preprocess<B: Backend>(img: &DynamicImage, size: u32, device: &B::Device) -> Tensor<B, 4> {
        let resized = img.resize_exact(size, size, FilterType::Triangle);
        let buf = resized.into_rgb32f().into_raw();
        let side = size as usize;

        let data = TensorData::new(buf, [side, side, 3]).convert::<B::FloatElem>();
        let tensor = Tensor::<B, 3>::from_data(data, device)
            .permute([2, 0, 1])
            .unsqueeze::<4>();

        let mean = Tensor::<B, 1>::from_floats(IMAGENET_MEAN, device).reshape([1, 3, 1, 1]);
        let std = Tensor::<B, 1>::from_floats(IMAGENET_STD, device).reshape([1, 3, 1, 1]);
        (tensor - mean) / std
    }

    /// Min-max scale a `[1, 1, H, W]` probability map to an 8-bit mask.
    pub fn probability_to_mask<B: Backend>(probability: Tensor<B, 4>) -> Result<GrayImage> {
        let [batch, channels, height, width] = probability.dims();
        if batch != 1 || channels != 1 {
            anyhow::bail!("Expected a [1, 1, H, W] map, got {:?}", [batch, channels, height, width]);
        }

        let min = probability.clone().min();
        let max = probability.clone().max();
        let scaled = (probability - min.clone().unsqueeze()) / (max - min + 1e-8).unsqueeze();

        let data = scaled
            .into_data()
            .convert_dtype(DType::F32)
            .to_vec::<f32>()
            .map_err(|e| anyhow::anyhow!("Failed to convert tensor to f32: {:#?}", e))?;
        // Truncate like a float-to-u8 cast
        let pixels = data.iter().map(|&v| (v * 255.0) as u8).collect();

        ImageBuffer::<Luma<u8>, _>::from_raw(width as u32, height as u32, pixels)
            .context("Failed to create grayscale image buffer")
    }

    /// Blend [`OVERLAY_COLOR`] over `original`, weighted by `mask`.
    ///
    /// The mask is resized to the original size with nearest-neighbor sampling first.
    pub fn red_overlay(original: &RgbImage, mask: &GrayImage) -> RgbImage {
        let (width, height) = original.dimensions();
        let mask = if mask.dimensions() == (width, height) {
            mask.clone()
        } else {
            image::imageops::resize(mask, width, height, FilterType::Nearest)
        };

        ImageBuffer::from_fn(width, height, |x, y| {
            let alpha = u32::from(mask.get_pixel(x, y)[0]);
            let base = original.get_pixel(x, y);
            Rgb(std::array::from_fn(|c| {
                let blended = u32::from(OVERLAY_COLOR[c]) * alpha
                    + u32::from(base[c]) * (255 - alpha);
                ((blended + 127) / 255) as u8
            }))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Tolerance;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_preprocess_normalizes_channels() {
        let device = Default::default();
        let white = DynamicImage::ImageRgb8(RgbImage::from_pixel(40, 30, Rgb([255, 255, 255])));

        let tensor = ImageUtils::preprocess::<TestBackend>(&white, 32, &device);

        assert_eq!(tensor.dims(), [1, 3, 32, 32]);
        let expected: Vec<f32> = (0..3)
            .map(|c| (1.0 - IMAGENET_MEAN[c]) / IMAGENET_STD[c])
            .collect();
        tensor
            .mean_dim(3)
            .mean_dim(2)
            .into_data()
            .assert_approx_eq::<f32>(&TensorData::new(expected, [1, 3, 1, 1]), Tolerance::absolute(1e-4));
    }

    #[test]
    fn test_probability_to_mask_stretches_range() {
        let device = Default::default();
        let probability =
            Tensor::<TestBackend, 4>::from_floats([[[[0.2, 0.4], [0.6, 0.6]]]], &device);

        let mask = ImageUtils::probability_to_mask(probability).unwrap();

        assert_eq!(mask.dimensions(), (2, 2));
        assert_eq!(mask.get_pixel(0, 0)[0], 0);
        assert!(mask.get_pixel(1, 0)[0] >= 127 && mask.get_pixel(1, 0)[0] <= 128);
        assert!(mask.get_pixel(0, 1)[0] >= 254);
    }

    #[test]
    fn test_probability_to_mask_rejects_batches() {
        let device = Default::default();
        let probability = Tensor::<TestBackend, 4>::zeros([2, 1, 4, 4], &device);

        assert!(ImageUtils::probability_to_mask(probability).is_err());
    }

    #[test]
    fn test_red_overlay_blends_by_mask() {
        let original = RgbImage::from_pixel(4, 4, Rgb([0, 0, 200]));
        let mut mask = GrayImage::new(2, 2);
        mask.put_pixel(0, 0, Luma([255]));

        let overlay = ImageUtils::red_overlay(&original, &mask);

        assert_eq!(overlay.dimensions(), (4, 4));
        assert_eq!(*overlay.get_pixel(0, 0), Rgb([255, 0, 0]));
        assert_eq!(*overlay.get_pixel(3, 3), Rgb([0, 0, 200]));
    }
}
