//! # Spatial Token Layout
//!
//! Conversions between the `(batch, channels, height, width)` feature-map layout and the
//! `(batch, tokens, channels)` layout consumed by linear and normalization layers.

use burn::prelude::*;

/// `(b, c, h, w) -> (b, h*w, c)`
pub fn flatten_spatial<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 3> {
    let [b, c, h, w] = x.dims();
    x.reshape([b, c, h * w]).swap_dims(1, 2)
}

/// `(b, h*w, c) -> (b, c, h, w)`
///
/// # Panics
///
/// Panics if the token count is not `height * width`.
pub fn unflatten_spatial<B: Backend>(x: Tensor<B, 3>, height: usize, width: usize) -> Tensor<B, 4> {
    let [b, n, c] = x.dims();
    assert_eq!(
        n,
        height * width,
        "token count {n} does not match a {height}x{width} grid"
    );
    x.swap_dims(1, 2).reshape([b, c, height, width])
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_flatten_spatial_token_order() {
        let device = Default::default();
        // channel 0 holds 0..4, channel 1 holds 10..14
        let x = Tensor::<TestBackend, 4>::from_floats(
            [[[[0.0, 1.0], [2.0, 3.0]], [[10.0, 11.0], [12.0, 13.0]]]],
            &device,
        );

        let tokens = flatten_spatial(x.clone());

        assert_eq!(tokens.dims(), [1, 4, 2]);
        tokens.clone().into_data().assert_eq(
            &TensorData::from([[[0.0f32, 10.0], [1.0, 11.0], [2.0, 12.0], [3.0, 13.0]]]),
            false,
        );
        unflatten_spatial(tokens, 2, 2)
            .into_data()
            .assert_eq(&x.into_data(), true);
    }

    #[test]
    #[should_panic(expected = "does not match")]
    fn test_unflatten_spatial_rejects_wrong_grid() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 3>::zeros([1, 6, 2], &device);
        let _ = unflatten_spatial(x, 2, 2);
    }
}
