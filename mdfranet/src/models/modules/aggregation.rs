//! # Partial Decoder Aggregation
//!
//! Fuses the three projected feature maps top-down into a single-channel coarse
//! prediction at the resolution of the finest input (stride 8). Its ×2 upsampling is
//! corner-aligned, unlike the half-pixel resizes of the refinement stages.

use burn::{
    module::Ignored,
    nn::conv::{Conv2d, Conv2dConfig},
    prelude::*,
};

use super::{resize_aligned_by, ConvBlock, ConvBlockConfig};
use crate::config::InterpolationStrategy;

/// Configuration for the `Aggregation` module.
#[derive(Config, Debug)]
pub struct AggregationConfig {
    /// Channel width of each projected input.
    #[config(default = "32")]
    pub channel: usize,
    #[config(default = "InterpolationStrategy::Bilinear")]
    pub interpolation_strategy: InterpolationStrategy,
}

impl AggregationConfig {
    /// Initializes a new `Aggregation` module.
    pub fn init<B: Backend>(&self, device: &Device<B>) -> Aggregation<B> {
        let c = self.channel;
        let conv3x3 = |channels: usize| ConvBlockConfig::new([channels, channels]).init(device);

        Aggregation {
            conv_upsample1: conv3x3(c),
            conv_upsample2: conv3x3(c),
            conv_upsample3: conv3x3(c),
            conv_upsample4: conv3x3(c),
            conv_upsample5: conv3x3(2 * c),
            conv_concat2: conv3x3(2 * c),
            conv_concat3: conv3x3(3 * c),
            conv4: conv3x3(3 * c),
            conv5: Conv2dConfig::new([3 * c, 1], [1, 1]).init(device),
            interpolation_strategy: Ignored(self.interpolation_strategy.clone()),
        }
    }
}

/// Top-down aggregation of the stride-32, 16 and 8 projections.
#[derive(Module, Debug)]
pub struct Aggregation<B: Backend> {
    conv_upsample1: ConvBlock<B>,
    conv_upsample2: ConvBlock<B>,
    conv_upsample3: ConvBlock<B>,
    conv_upsample4: ConvBlock<B>,
    conv_upsample5: ConvBlock<B>,
    conv_concat2: ConvBlock<B>,
    conv_concat3: ConvBlock<B>,
    conv4: ConvBlock<B>,
    conv5: Conv2d<B>,
    interpolation_strategy: Ignored<InterpolationStrategy>,
}

impl<B: Backend> Aggregation<B> {
    /// # Shapes
    /// - `x4`: `[B, C, H/32, W/32]`
    /// - `x3`: `[B, C, H/16, W/16]`
    /// - `x2`: `[B, C, H/8, W/8]`
    /// - output: `[B, 1, H/8, W/8]`
    pub fn forward(&self, x4: Tensor<B, 4>, x3: Tensor<B, 4>, x2: Tensor<B, 4>) -> Tensor<B, 4> {
        let up = |x: Tensor<B, 4>| resize_aligned_by(x, 2.0, &self.interpolation_strategy.0);

        let x4_up = up(x4);
        let x4_up2 = up(x4_up.clone());

        let x3_1 = self.conv_upsample1.forward(x4_up.clone()) * x3.clone();
        let x2_1 = self.conv_upsample2.forward(x4_up2)
            * self.conv_upsample3.forward(up(x3))
            * x2;

        let x3_2 = Tensor::cat(vec![x3_1, self.conv_upsample4.forward(x4_up)], 1);
        let x3_2 = self.conv_concat2.forward(x3_2);

        let x2_2 = Tensor::cat(vec![x2_1, self.conv_upsample5.forward(up(x3_2))], 1);
        let x2_2 = self.conv_concat3.forward(x2_2);

        let x = self.conv4.forward(x2_2);
        self.conv5.forward(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_aggregation_output_at_finest_resolution() {
        let device = Default::default();
        let agg = AggregationConfig::new().init::<TestBackend>(&device);
        let feature = |size: usize| {
            Tensor::<TestBackend, 4>::random(
                [2, 32, size, size],
                burn::tensor::Distribution::Normal(0.0, 1.0),
                &device,
            )
        };

        let out = agg.forward(feature(11), feature(22), feature(44));

        assert_eq!(out.dims(), [2, 1, 44, 44]);
    }
}
