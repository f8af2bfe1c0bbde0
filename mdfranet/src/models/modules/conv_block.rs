//! # Convolution Block
//!
//! The `conv → norm → activation` unit shared by the projector, aggregator, MSMB,
//! APA and the refinement heads. Which parts are present is decided once, by
//! [`ConvBlockConfig`], instead of by each caller.

use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        BatchNorm, BatchNormConfig, GroupNorm, GroupNormConfig, Initializer, PaddingConfig2d,
        Relu,
    },
    prelude::*,
};

use crate::config::NormKind;

/// An enum to wrap the normalization layers a `ConvBlock` can carry.
#[derive(Module, Debug)]
pub enum NormLayer<B: Backend> {
    BatchNorm(BatchNorm<B, 2>),
    GroupNorm(GroupNorm<B>),
}

impl<B: Backend> NormLayer<B> {
    fn new(kind: &NormKind, channels: usize, device: &Device<B>) -> Option<Self> {
        match kind {
            NormKind::None => None,
            NormKind::Batch => Some(Self::BatchNorm(BatchNormConfig::new(channels).init(device))),
            NormKind::Group => Some(Self::GroupNorm(
                GroupNormConfig::new(channels.min(32), channels).init(device),
            )),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        match self {
            Self::BatchNorm(bn) => bn.forward(x),
            Self::GroupNorm(gn) => gn.forward(x),
        }
    }
}

/// Configuration for the `ConvBlock` module.
#[derive(Config, Debug)]
pub struct ConvBlockConfig {
    /// Input and output channels.
    pub channels: [usize; 2],
    /// Square kernel size. Padding is `kernel_size / 2`.
    #[config(default = "3")]
    pub kernel_size: usize,
    #[config(default = "1")]
    pub stride: usize,
    #[config(default = "1")]
    pub groups: usize,
    #[config(default = "false")]
    pub bias: bool,
    #[config(default = "NormKind::Batch")]
    pub norm: NormKind,
    /// Apply a ReLU after the normalization.
    #[config(default = "true")]
    pub activation: bool,
    /// Initialize the convolution weights (and bias) to zero.
    #[config(default = "false")]
    pub zero_init: bool,
}

impl ConvBlockConfig {
    /// Initializes a new `ConvBlock` module.
    pub fn init<B: Backend>(&self, device: &Device<B>) -> ConvBlock<B> {
        let padding = self.kernel_size / 2;
        let mut conv = Conv2dConfig::new(self.channels, [self.kernel_size, self.kernel_size])
            .with_stride([self.stride, self.stride])
            .with_padding(PaddingConfig2d::Explicit(padding, padding))
            .with_groups(self.groups)
            .with_bias(self.bias);
        if self.zero_init {
            conv = conv.with_initializer(Initializer::Zeros);
        }

        ConvBlock {
            conv: conv.init(device),
            bn: NormLayer::new(&self.norm, self.channels[1], device),
            act: self.activation.then(Relu::new),
        }
    }
}

/// A convolution followed by optional normalization and ReLU.
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    conv: Conv2d<B>,
    bn: Option<NormLayer<B>>,
    act: Option<Relu>,
}

impl<B: Backend> ConvBlock<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = match &self.bn {
            Some(bn) => bn.forward(x),
            None => x,
        };
        match &self.act {
            Some(act) => act.forward(x),
            None => x,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_conv_block_same_padding() {
        let device = Default::default();
        let input = Tensor::<TestBackend, 4>::random(
            [2, 8, 11, 11],
            burn::tensor::Distribution::Normal(0.0, 1.0),
            &device,
        );

        for kernel_size in [1, 3, 7] {
            let block = ConvBlockConfig::new([8, 4])
                .with_kernel_size(kernel_size)
                .init::<TestBackend>(&device);
            assert_eq!(block.forward(input.clone()).dims(), [2, 4, 11, 11]);
        }
    }

    #[test]
    fn test_conv_block_activation_is_non_negative() {
        let device = Default::default();
        let block = ConvBlockConfig::new([4, 32])
            .with_norm(NormKind::Group)
            .init::<TestBackend>(&device);
        let input = Tensor::<TestBackend, 4>::random(
            [1, 4, 6, 6],
            burn::tensor::Distribution::Normal(0.0, 1.0),
            &device,
        );

        let out = block.forward(input);

        assert!(out.min().into_scalar() >= 0.0);
    }

    #[test]
    fn test_conv_block_without_norm_or_activation() {
        let device = Default::default();
        let block = ConvBlockConfig::new([4, 4])
            .with_norm(NormKind::None)
            .with_activation(false)
            .with_zero_init(true)
            .init::<TestBackend>(&device);
        assert!(block.bn.is_none());
        assert!(block.act.is_none());

        let input = Tensor::<TestBackend, 4>::ones([1, 4, 5, 5], &device);

        block.forward(input).into_data().assert_eq(
            &Tensor::<TestBackend, 4>::zeros([1, 4, 5, 5], &device).into_data(),
            false,
        );
    }
}
