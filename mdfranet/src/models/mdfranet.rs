//! # MdfraNet Model Implementation
//!
//! This module defines the main `MdfraNet` model, which combines a Res2Net encoder with
//! the reverse-attention decoder to produce segmentation logits.
//!
//! ## Core Components
//!
//! - `MdfraNetConfig`: A configuration struct to initialize the `MdfraNet` model.
//! - `MdfraNet`: The main model struct, which checks the input and orchestrates the
//!   forward pass through the encoder and decoder.

use backbones::{create_backbone, Backbone as Encoder, Res2NetBackbone, Res2NetVariant};
use burn::prelude::*;

use super::decoder::{MdfraDecoder, MdfraDecoderConfig, MdfraOutput};
use crate::{
    config::{Backbone, ModelConfig, MIN_IMAGE_SIZE},
    error::{MdfraError, MdfraResult},
};

/// Configuration for the `MdfraNet` model.
#[derive(Config, Debug)]
pub struct MdfraNetConfig {
    /// The detailed model configuration.
    pub config: ModelConfig,
}

impl MdfraNetConfig {
    /// Initializes an `MdfraNet` model with the given configuration.
    ///
    /// # Arguments
    ///
    /// * `device` - The device to create the model on.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn init<B: Backend>(&self, device: &Device<B>) -> MdfraResult<MdfraNet<B>> {
        self.config.validate()?;

        let variant = match self.config.backbone.backbone {
            Backbone::Res2Net50 => Res2NetVariant::Res2Net50,
            Backbone::Res2Net101 => Res2NetVariant::Res2Net101,
        };
        let resnet = create_backbone(variant, device);

        let [_, c2, c3, c4] = resnet.output_channels();
        let decoder = MdfraDecoderConfig::new(self.config.clone(), [c2, c3, c4]).init(device);

        Ok(MdfraNet { resnet, decoder })
    }
}

/// The main MdfraNet model.
#[derive(Module, Debug)]
pub struct MdfraNet<B: Backend> {
    /// The backbone encoder.
    resnet: Res2NetBackbone<B>,
    /// The projection, aggregation and refinement decoder.
    decoder: MdfraDecoder<B>,
}

impl<B: Backend> MdfraNet<B> {
    /// The main forward pass for the `MdfraNet` model.
    ///
    /// # Arguments
    ///
    /// * `x` - A normalized RGB batch of shape `[B, 3, H, W]`. `H` and `W` must be
    ///   multiples of 32 and at least 128.
    ///
    /// # Returns
    ///
    /// The final, coarse and per-stage logits, each `[B, 1, H, W]`.
    ///
    /// # Errors
    ///
    /// Returns `MdfraError::InvalidTensorShape` if the input violates the constraints above.
    pub fn forward(&self, x: Tensor<B, 4>) -> MdfraResult<MdfraOutput<B>> {
        let [batch, channels, h, w] = x.dims();
        let stride = Encoder::total_stride(&self.resnet);
        let valid_side = |s: usize| s >= MIN_IMAGE_SIZE && s % stride == 0;
        if batch == 0 || channels != 3 || !valid_side(h) || !valid_side(w) {
            return Err(MdfraError::InvalidTensorShape {
                expected: format!(
                    "[B >= 1, 3, H, W] with H and W multiples of {stride}, at least {MIN_IMAGE_SIZE}"
                ),
                actual: format!("{:?}", [batch, channels, h, w]),
            });
        }

        let [_, x2, x3, x4] = self.resnet.forward(x);

        Ok(self.decoder.forward([x2, x3, x4]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackboneConfig, DecoderConfig};
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_init_rejects_invalid_config() {
        let device = Default::default();
        let config = ModelConfig::new().with_decoder(DecoderConfig::new().with_channel(24));

        let result = MdfraNetConfig::new(config).init::<TestBackend>(&device);

        assert!(matches!(
            result,
            Err(MdfraError::InvalidConfiguration { .. })
        ));
    }

    #[test]
    fn test_forward_rejects_bad_shapes() {
        let device = Default::default();
        let config = ModelConfig::new()
            .with_backbone(BackboneConfig::new().with_backbone(Backbone::Res2Net50));
        let model = MdfraNetConfig::new(config)
            .init::<TestBackend>(&device)
            .unwrap();

        for shape in [[1, 1, 128, 128], [1, 3, 120, 128], [1, 3, 96, 96]] {
            let result = model.forward(Tensor::zeros(shape, &device));
            assert!(matches!(
                result,
                Err(MdfraError::InvalidTensorShape { .. })
            ));
        }
    }
}
