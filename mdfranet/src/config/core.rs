//! Core configuration structures for MdfraNet.
//!
//! This module contains the primary configuration structures that define
//! the MdfraNet model architecture and behavior.

use crate::error::{MdfraError, MdfraResult};
use burn::prelude::*;

use super::enums::*;

/// Smallest input side the decoder supports.
pub const MIN_IMAGE_SIZE: usize = 128;

/// Main configuration for the MdfraNet model.
#[derive(Config, Debug)]
pub struct ModelConfig {
    /// Backbone network configuration.
    #[config(default = "BackboneConfig::new()")]
    pub backbone: BackboneConfig,
    /// Decoder configuration.
    #[config(default = "DecoderConfig::new()")]
    pub decoder: DecoderConfig,
    /// Interpolation used for every resize in the decoder.
    #[config(default = "InterpolationStrategy::Bilinear")]
    pub interpolation: InterpolationStrategy,
    /// Square input resolution expected by the preprocessing front-end.
    #[config(default = "352")]
    pub image_size: usize,
}

/// Backbone network configuration.
#[derive(Config, Debug)]
pub struct BackboneConfig {
    /// The chosen backbone architecture.
    #[config(default = "Backbone::Res2Net101")]
    pub backbone: Backbone,
}

/// Decoder-related configuration.
///
/// Controls the width of the projected features, the attention geometry of the ESA and
/// PCA blocks, and two layout switches that differ between the documented architecture
/// and the released checkpoints.
#[derive(Config, Debug)]
pub struct DecoderConfig {
    /// Common channel width after projection. Must be divisible by 16.
    #[config(default = "32")]
    pub channel: usize,
    /// Number of attention heads in ESA and PCA.
    #[config(default = "8")]
    pub heads: usize,
    /// Width of one attention head.
    #[config(default = "64")]
    pub dim_head: usize,
    /// Hidden width of the feed-forward sub-blocks.
    #[config(default = "512")]
    pub mlp_dim: usize,
    /// Dropout inside the attention output projection and feed-forward sub-blocks.
    #[config(default = "0.0")]
    pub attention_dropout: f64,
    /// Dropout applied by APA before its final normalization.
    #[config(default = "0.1")]
    pub apa_dropout: f64,
    /// Adaptive-pool grid sizes producing the ESA key/value tokens.
    #[config(default = "vec![1, 3, 5]")]
    pub pooling_sizes: Vec<usize>,
    /// Additive epsilon of the mask-weighted pooling denominator.
    #[config(default = "5e-4")]
    pub mask_pool_eps: f64,
    /// Kernel of the MSMB channel-reduction convolution (odd).
    #[config(default = "1")]
    pub msmb_reduce_kernel: usize,
    /// Normalize and activate the last convolution of each refinement head.
    #[config(default = "false")]
    pub head_output_activation: bool,
}

impl ModelConfig {
    /// Layout of the published MdfraNet checkpoints.
    ///
    /// The released weights use a 3x3 MSMB reduction and a normalized, activated last
    /// refinement-head convolution.
    pub fn released() -> Self {
        Self::new().with_decoder(
            DecoderConfig::new()
                .with_msmb_reduce_kernel(3)
                .with_head_output_activation(true),
        )
    }

    /// Validate the configuration and return appropriate errors for invalid settings.
    ///
    /// # Errors
    ///
    /// Returns `Err(MdfraError::InvalidConfiguration)` if any validation rule is violated.
    pub fn validate(&self) -> MdfraResult<()> {
        let decoder = &self.decoder;

        // The MSMB branch schedule divides the channel width by 16
        if decoder.channel == 0 || decoder.channel % 16 != 0 {
            return Err(MdfraError::InvalidConfiguration {
                reason: format!(
                    "Decoder channel width must be a positive multiple of 16, got {}",
                    decoder.channel
                ),
            });
        }

        if decoder.heads == 0 || decoder.dim_head == 0 {
            return Err(MdfraError::InvalidConfiguration {
                reason: format!(
                    "Attention needs at least one head of non-zero width, got {} heads of {}",
                    decoder.heads, decoder.dim_head
                ),
            });
        }

        if decoder.mlp_dim == 0 {
            return Err(MdfraError::InvalidConfiguration {
                reason: "Feed-forward hidden width must be non-zero".to_string(),
            });
        }

        if decoder.pooling_sizes.is_empty() || decoder.pooling_sizes.contains(&0) {
            return Err(MdfraError::InvalidConfiguration {
                reason: format!(
                    "Pooling grid sizes must be a non-empty list of positive sizes, got {:?}",
                    decoder.pooling_sizes
                ),
            });
        }

        if decoder.mask_pool_eps.is_nan() || decoder.mask_pool_eps <= 0.0 {
            return Err(MdfraError::InvalidConfiguration {
                reason: format!(
                    "Mask pooling epsilon must be positive, got {}",
                    decoder.mask_pool_eps
                ),
            });
        }

        for (name, p) in [
            ("attention_dropout", decoder.attention_dropout),
            ("apa_dropout", decoder.apa_dropout),
        ] {
            if !(0.0..1.0).contains(&p) {
                return Err(MdfraError::InvalidConfiguration {
                    reason: format!("{name} must be in [0, 1), got {p}"),
                });
            }
        }

        if decoder.msmb_reduce_kernel % 2 == 0 {
            return Err(MdfraError::InvalidConfiguration {
                reason: format!(
                    "MSMB reduction kernel must be odd to preserve the spatial size, got {}",
                    decoder.msmb_reduce_kernel
                ),
            });
        }

        // The coarsest stage runs local-global attention with 4x4 patches at stride 32
        if self.image_size < MIN_IMAGE_SIZE || self.image_size % 32 != 0 {
            return Err(MdfraError::InvalidConfiguration {
                reason: format!(
                    "Image size must be a multiple of the backbone stride 32 and at least {MIN_IMAGE_SIZE}, got {}",
                    self.image_size
                ),
            });
        }

        Ok(())
    }

    /// Number of key/value tokens ESA attends to: the sum of squared pooling grids.
    pub fn esa_tokens(&self) -> usize {
        self.decoder.pooling_sizes.iter().map(|s| s * s).sum()
    }
}
