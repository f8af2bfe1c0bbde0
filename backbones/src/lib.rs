//! Backbone implementations for MdfraNet
//!
//! This crate provides the unified interface between MdfraNet and its hierarchical
//! image encoders.

use burn::prelude::*;

pub use res2net::{Res2NetBackbone, Res2NetConfig};

/// Unified backbone trait for MdfraNet
pub trait Backbone<B: Backend> {
    /// Forward pass through the backbone
    ///
    /// # Arguments
    /// * `input` - Input tensor of shape `[batch_size, channels, height, width]`
    ///
    /// # Returns
    /// Array of 4 feature maps at strides 4, 8, 16 and 32
    fn forward(&self, input: Tensor<B, 4>) -> [Tensor<B, 4>; 4];

    /// Get output channels for each scale
    fn output_channels(&self) -> [usize; 4];

    /// Total downsampling factor of the deepest feature map
    fn total_stride(&self) -> usize {
        32
    }
}

/// Implement Backbone trait for Res2Net
impl<B: Backend> Backbone<B> for Res2NetBackbone<B> {
    fn forward(&self, input: Tensor<B, 4>) -> [Tensor<B, 4>; 4] {
        self.forward(input)
    }

    fn output_channels(&self) -> [usize; 4] {
        self.output_channels()
    }
}

/// Res2Net variants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Res2NetVariant {
    /// Res2Net-50 v1b 26w×4s
    Res2Net50,
    /// Res2Net-101 v1b 26w×4s
    Res2Net101,
}

/// Factory function to create backbones
pub fn create_backbone<B: Backend>(
    variant: Res2NetVariant,
    device: &Device<B>,
) -> Res2NetBackbone<B> {
    let config = match variant {
        Res2NetVariant::Res2Net50 => Res2NetConfig::res2net50(),
        Res2NetVariant::Res2Net101 => Res2NetConfig::res2net101(),
    };
    config.init(device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn features<M: Backbone<TestBackend>>(
        backbone: &M,
        input: Tensor<TestBackend, 4>,
    ) -> [Tensor<TestBackend, 4>; 4] {
        Backbone::forward(backbone, input)
    }

    #[test]
    fn test_res2net_backbone() {
        let device = Default::default();
        let backbone = create_backbone::<TestBackend>(Res2NetVariant::Res2Net50, &device);

        let input = Tensor::<TestBackend, 4>::random(
            [1, 3, 96, 96],
            burn::tensor::Distribution::Normal(0.0, 1.0),
            &device,
        );

        let output = features(&backbone, input);
        let channels = Backbone::output_channels(&backbone);

        for (level, (feature, channels)) in output.iter().zip(channels).enumerate() {
            let stride = 4 << level;
            assert_eq!(feature.dims(), [1, channels, 96 / stride, 96 / stride]);
        }
        assert_eq!(Backbone::total_stride(&backbone), 32);
    }
}
