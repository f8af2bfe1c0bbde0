use burn::prelude::*;

/// L2-normalizes `x` along `dim`.
///
/// The norm is clamped from below by `eps`, so an all-zero slice stays zero
/// instead of producing NaN.
pub fn l2_normalize<B: Backend, const D: usize>(
    x: Tensor<B, D>,
    dim: usize,
    eps: f64,
) -> Tensor<B, D> {
    let norm = x.clone().powf_scalar(2.0).sum_dim(dim).sqrt().clamp_min(eps);
    x / norm
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::{backend::NdArray, tensor::Tolerance};

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_l2_normalize_unit_norm() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 3>::random(
            [2, 5, 7],
            burn::tensor::Distribution::Normal(0.0, 1.0),
            &device,
        );

        let norms = l2_normalize(x, 2, 1e-12).powf_scalar(2.0).sum_dim(2).sqrt();

        norms.into_data().assert_approx_eq::<f32>(
            &Tensor::<TestBackend, 3>::ones([2, 5, 1], &device).into_data(),
            Tolerance::default(),
        );
    }

    #[test]
    fn test_l2_normalize_zero_input_is_finite() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 2>::zeros([3, 4], &device);

        let out = l2_normalize(x, 1, 1e-12);

        out.into_data().assert_eq(
            &Tensor::<TestBackend, 2>::zeros([3, 4], &device).into_data(),
            false,
        );
    }
}
