//! Additional operations for the Burn deep learning framework
//!
//! This crate provides the statically typed layout helpers used by the MdfraNet
//! attention blocks. Every helper has a fixed input/output shape contract instead of
//! a generic pattern interpreter.

use burn::prelude::*;

mod heads;
mod normalize;
mod spatial;

// Convenient re-exports
pub use heads::{merge_heads, split_heads, split_token_heads};
pub use normalize::l2_normalize;
pub use spatial::{flatten_spatial, unflatten_spatial};

/// Additional operations for Burn tensors
pub trait TensorExtraOps<B: Backend, const D: usize> {
    /// Divide the tensor by its L2 norm along `dim`, with the norm clamped to `1e-12`.
    fn l2_normalize(self, dim: usize) -> Self;
}

impl<B: Backend, const D: usize> TensorExtraOps<B, D> for Tensor<B, D> {
    fn l2_normalize(self, dim: usize) -> Self {
        l2_normalize(self, dim, 1e-12)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::{backend::ndarray::NdArray, tensor::Tolerance};

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_tensor_extra_ops() {
        let device = Default::default();
        let tensor = Tensor::<TestBackend, 2>::from_floats([[3.0, 4.0], [0.0, 0.0]], &device);

        let result = tensor.l2_normalize(1);

        result.into_data().assert_approx_eq::<f32>(
            &TensorData::from([[0.6, 0.8], [0.0, 0.0]]),
            Tolerance::default(),
        );
    }
}
