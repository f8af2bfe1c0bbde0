use burn::{
    prelude::*,
    tensor::{
        module::interpolate,
        ops::{InterpolateMode, InterpolateOptions},
    },
};

use crate::config::InterpolationStrategy;

/// Resizes `tensor` to `size` with the mode chosen by `strategy`.
///
/// Bilinear sampling is half-pixel centred: output pixel `o` reads the input at
/// `(o + 0.5) * in / out - 0.5`, clamped at zero. Corner pixels are not pinned.
pub fn resize_to<B: Backend>(
    tensor: Tensor<B, 4>,
    size: [usize; 2],
    strategy: &InterpolationStrategy,
) -> Tensor<B, 4> {
    match strategy {
        InterpolationStrategy::Bilinear => bilinear_half_pixel(tensor, size),
        InterpolationStrategy::Nearest => interpolate(
            tensor,
            size,
            InterpolateOptions::new(InterpolateMode::Nearest),
        ),
    }
}

/// Resizes `tensor` by a fixed scale factor.
///
/// The output size is `floor(size * factor)`.
pub fn resize_by<B: Backend>(
    tensor: Tensor<B, 4>,
    factor: f64,
    strategy: &InterpolationStrategy,
) -> Tensor<B, 4> {
    let [_, _, h, w] = tensor.dims();
    resize_to(tensor, scaled_size([h, w], factor), strategy)
}

/// Resizes `tensor` by `factor` with corner-aligned bilinear sampling.
///
/// The first and last pixels of input and output coincide.
pub fn resize_aligned_by<B: Backend>(
    tensor: Tensor<B, 4>,
    factor: f64,
    strategy: &InterpolationStrategy,
) -> Tensor<B, 4> {
    let [_, _, h, w] = tensor.dims();
    let mode = match strategy {
        InterpolationStrategy::Bilinear => InterpolateMode::Bilinear,
        InterpolationStrategy::Nearest => InterpolateMode::Nearest,
    };

    interpolate(tensor, scaled_size([h, w], factor), InterpolateOptions::new(mode))
}

/// Spatial size after scaling `[h, w]` by `factor`.
pub fn scaled_size(size: [usize; 2], factor: f64) -> [usize; 2] {
    size.map(|s| (s as f64 * factor).floor() as usize)
}

/// Separable bilinear resize, one matmul per axis.
fn bilinear_half_pixel<B: Backend>(tensor: Tensor<B, 4>, size: [usize; 2]) -> Tensor<B, 4> {
    let [b, c, h, w] = tensor.dims();
    let [out_h, out_w] = size;
    let device = tensor.device();

    let rows = tensor
        .reshape([b * c * h, w])
        .matmul(interpolation_weights::<B>(w, out_w, &device));
    let cols = rows
        .reshape([b * c, h, out_w])
        .swap_dims(1, 2)
        .reshape([b * c * out_w, h])
        .matmul(interpolation_weights::<B>(h, out_h, &device));

    cols.reshape([b, c, out_w, out_h]).swap_dims(2, 3)
}

/// `[input, output]` matrix whose column `o` holds the two taps of output sample `o`.
fn interpolation_weights<B: Backend>(
    input: usize,
    output: usize,
    device: &B::Device,
) -> Tensor<B, 2> {
    let scale = input as f64 / output as f64;
    let last = input - 1;
    let mut weights = vec![0.0f32; input * output];

    for o in 0..output {
        let source = ((o as f64 + 0.5) * scale - 0.5).max(0.0);
        let lower = (source.floor() as usize).min(last);
        let upper = (lower + 1).min(last);
        let frac = (source - lower as f64) as f32;

        weights[lower * output + o] += 1.0 - frac;
        weights[upper * output + o] += frac;
    }

    Tensor::from_data(TensorData::new(weights, [input, output]), device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::{backend::NdArray, tensor::Tolerance};

    type TestBackend = NdArray<f32>;

    fn ramp(width: usize) -> Tensor<TestBackend, 4> {
        Tensor::<TestBackend, 1, Int>::arange(0..width as i64, &Default::default())
            .float()
            .reshape([1, 1, 1, width])
    }

    #[test]
    fn test_scaled_size_floors() {
        assert_eq!(scaled_size([44, 44], 0.25), [11, 11]);
        assert_eq!(scaled_size([45, 30], 0.25), [11, 7]);
        assert_eq!(scaled_size([11, 11], 32.0), [352, 352]);
    }

    #[test]
    fn test_resize_by_preserves_constant_maps() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 4>::full([2, 1, 8, 8], 0.75, &device);

        let up = resize_by(x.clone(), 2.0, &InterpolationStrategy::Bilinear);
        let down = resize_by(x, 0.25, &InterpolationStrategy::Bilinear);

        assert_eq!(up.dims(), [2, 1, 16, 16]);
        assert_eq!(down.dims(), [2, 1, 2, 2]);
        up.into_data().assert_approx_eq::<f32>(
            &Tensor::<TestBackend, 4>::full([2, 1, 16, 16], 0.75, &device).into_data(),
            Tolerance::default(),
        );
        down.into_data().assert_approx_eq::<f32>(
            &Tensor::<TestBackend, 4>::full([2, 1, 2, 2], 0.75, &device).into_data(),
            Tolerance::default(),
        );
    }

    #[test]
    fn test_bilinear_downsample_samples_pixel_centres() {
        // torch: F.interpolate(arange(8), scale_factor=0.25, mode="bilinear")
        let down = resize_by(ramp(8), 0.25, &InterpolationStrategy::Bilinear);

        down.into_data().assert_approx_eq::<f32>(
            &TensorData::new(vec![1.5f32, 5.5], [1, 1, 1, 2]),
            Tolerance::default(),
        );
    }

    #[test]
    fn test_bilinear_upsample_clamps_borders() {
        // torch: F.interpolate(arange(4), scale_factor=2, mode="bilinear")
        let up = resize_by(ramp(4), 2.0, &InterpolationStrategy::Bilinear);

        up.into_data().assert_approx_eq::<f32>(
            &TensorData::new(
                vec![0.0f32, 0.25, 0.75, 1.25, 1.75, 2.25, 2.75, 3.0],
                [1, 1, 1, 8],
            ),
            Tolerance::default(),
        );
    }

    #[test]
    fn test_bilinear_resizes_both_axes() {
        let device = Default::default();
        // rows 0 and 10 times the column ramp, so both axes interpolate
        let x = Tensor::<TestBackend, 4>::from_data(
            TensorData::new(vec![0.0f32, 1.0, 10.0, 11.0], [1, 1, 2, 2]),
            &device,
        );

        let up = resize_to(x, [4, 4], &InterpolationStrategy::Bilinear);

        // torch: F.interpolate(x, size=(4, 4), mode="bilinear", align_corners=False)
        let axis = [0.0f32, 0.25, 0.75, 1.0];
        let expected: Vec<f32> = axis
            .iter()
            .flat_map(|r| axis.iter().map(move |c| 10.0 * r + c))
            .collect();
        up.into_data().assert_approx_eq::<f32>(
            &TensorData::new(expected, [1, 1, 4, 4]),
            Tolerance::default(),
        );
    }

    #[test]
    fn test_aligned_resize_pins_corners() {
        let up = resize_aligned_by(ramp(4), 2.0, &InterpolationStrategy::Bilinear);
        let values = up.into_data().to_vec::<f32>().unwrap();

        assert_eq!(values.len(), 8);
        assert!((values[0] - 0.0).abs() < 1e-6);
        assert!((values[7] - 3.0).abs() < 1e-6);
    }
}
