//! # Multi-Head Layout
//!
//! Moves the head axis of a channel-packed projection `(batch, heads * head_dim, ...)`
//! in and out of the leading position used by batched attention matmuls.

use burn::prelude::*;

/// `(b, heads*d, h, w) -> (b, heads, h*w, d)`
///
/// # Panics
///
/// Panics if the channel count is not divisible by `heads`.
pub fn split_heads<B: Backend>(x: Tensor<B, 4>, heads: usize) -> Tensor<B, 4> {
    let [b, c, h, w] = x.dims();
    assert_eq!(c % heads, 0, "{c} channels cannot be split into {heads} heads");
    x.reshape([b, heads, c / heads, h * w]).swap_dims(2, 3)
}

/// `(b, heads*d, n) -> (b, heads, n, d)`
///
/// # Panics
///
/// Panics if the channel count is not divisible by `heads`.
pub fn split_token_heads<B: Backend>(x: Tensor<B, 3>, heads: usize) -> Tensor<B, 4> {
    let [b, c, n] = x.dims();
    assert_eq!(c % heads, 0, "{c} channels cannot be split into {heads} heads");
    x.reshape([b, heads, c / heads, n]).swap_dims(2, 3)
}

/// `(b, heads, n, d) -> (b, n, heads*d)`
pub fn merge_heads<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 3> {
    let [b, heads, n, d] = x.dims();
    x.swap_dims(1, 2).reshape([b, n, heads * d])
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_split_heads_shapes() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 4>::zeros([2, 512, 11, 11], &device);

        assert_eq!(split_heads(x, 8).dims(), [2, 8, 121, 64]);
    }

    #[test]
    fn test_split_heads_groups_contiguous_channels() {
        let device = Default::default();
        // 4 channels, 2 heads, 1x2 grid: channel k holds the value k at both positions
        let x = Tensor::<TestBackend, 1>::from_floats([0.0, 0.0, 1.0, 1.0, 2.0, 2.0, 3.0, 3.0], &device)
            .reshape([1, 4, 1, 2]);

        let heads = split_heads(x, 2);

        heads.into_data().assert_eq(
            &TensorData::from([[[[0.0f32, 1.0], [0.0, 1.0]], [[2.0, 3.0], [2.0, 3.0]]]]),
            false,
        );
    }

    #[test]
    fn test_merge_inverts_token_split() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 3>::random(
            [2, 16, 35],
            burn::tensor::Distribution::Normal(0.0, 1.0),
            &device,
        );

        let split = split_token_heads(x.clone(), 4);
        assert_eq!(split.dims(), [2, 4, 35, 4]);

        // (b, n, heads*d) is the transpose of the original (b, heads*d, n)
        merge_heads(split)
            .swap_dims(1, 2)
            .into_data()
            .assert_eq(&x.into_data(), true);
    }
}
