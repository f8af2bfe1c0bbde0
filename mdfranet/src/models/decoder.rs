//! # Decoder for MdfraNet
//!
//! Takes the stride-8, 16 and 32 backbone features and turns them into segmentation
//! logits in two passes:
//!
//! 1. The three maps are projected to a common width and fused top-down by the
//!    [`Aggregation`] block into a coarse stride-8 prediction.
//! 2. Three refinement stages, coarsest first, each correct the running prediction at
//!    their own resolution. A stage refines its projected feature with its own MSMB and
//!    the shared ESA block, gates it with PCA guided by the reverse attention
//!    `1 - sigmoid(prediction)`, multiplies in the shared APA map, and adds the output
//!    of a three-layer head to the prediction.
//!
//! ## Scale factors
//!
//! | map                  | native stride | factor to input |
//! |----------------------|---------------|-----------------|
//! | aggregation output   | 8             | 8               |
//! | stage 1 prior        | 8 -> 32       | x0.25, then 32  |
//! | stage 2 prior        | 32 -> 16      | x2, then 16     |
//! | stage 3 prior        | 16 -> 8       | x2, then 8      |

use burn::{module::Ignored, prelude::*, tensor::activation::sigmoid};

use super::modules::{
    resize_by, Aggregation, AggregationConfig, Apa, ApaConfig, ConvBlock, ConvBlockConfig,
    EsaBlock, EsaBlockConfig, Msmb, MsmbConfig, PcaBlock, PcaBlockConfig,
};
use crate::config::{InterpolationStrategy, ModelConfig, NormKind};

/// Scale factor from the aggregation output back to the input resolution.
pub const COARSE_SCALE: f64 = 8.0;
/// Scale factor taking the aggregation output to the stride-32 stage.
pub const FIRST_PRIOR_SCALE: f64 = 0.25;
/// Scale factor between consecutive refinement stages.
pub const STAGE_SCALE: f64 = 2.0;
/// Scale factors from each stage's output back to the input resolution.
pub const STAGE_OUTPUT_SCALES: [f64; 3] = [32.0, 16.0, 8.0];

/// The predictions of one decoder pass. Every map is `[B, 1, H, W]` logits at input
/// resolution.
#[derive(Debug, Clone)]
pub struct MdfraOutput<B: Backend> {
    /// Prediction after the last (stride-8) refinement stage.
    pub final_map: Tensor<B, 4>,
    /// Aggregation prediction before any refinement.
    pub coarse_map: Tensor<B, 4>,
    /// Predictions after the stride-32 and stride-16 refinement stages.
    pub stage_maps: [Tensor<B, 4>; 2],
}

impl<B: Backend> MdfraOutput<B> {
    /// Sum of the final and coarse logits.
    pub fn fused(&self) -> Tensor<B, 4> {
        self.final_map.clone() + self.coarse_map.clone()
    }
}

/// Configuration for the `RefineHead` module.
#[derive(Config, Debug)]
pub struct RefineHeadConfig {
    #[config(default = "32")]
    pub channel: usize,
    /// Normalize and activate the single-channel output convolution.
    #[config(default = "false")]
    pub output_activation: bool,
}

impl RefineHeadConfig {
    /// Initializes a new `RefineHead` module.
    pub fn init<B: Backend>(&self, device: &Device<B>) -> RefineHead<B> {
        let c = self.channel;
        let conv3 = if self.output_activation {
            ConvBlockConfig::new([c, 1])
        } else {
            ConvBlockConfig::new([c, 1])
                .with_bias(true)
                .with_norm(NormKind::None)
                .with_activation(false)
        };

        RefineHead {
            conv1: ConvBlockConfig::new([c, c]).init(device),
            conv2: ConvBlockConfig::new([c, c]).init(device),
            conv3: conv3.init(device),
        }
    }
}

/// Three 3x3 conv blocks producing a single-channel residual correction.
#[derive(Module, Debug)]
pub struct RefineHead<B: Backend> {
    conv1: ConvBlock<B>,
    conv2: ConvBlock<B>,
    conv3: ConvBlock<B>,
}

impl<B: Backend> RefineHead<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv1.forward(x);
        let x = self.conv2.forward(x);
        self.conv3.forward(x)
    }
}

/// Reverse attention gate `1 - sigmoid(prediction)`.
pub fn reverse_attention<B: Backend>(prediction: Tensor<B, 4>) -> Tensor<B, 4> {
    sigmoid(prediction).neg().add_scalar(1.0)
}

/// Configuration for the `MdfraDecoder` module.
#[derive(Config, Debug)]
pub struct MdfraDecoderConfig {
    /// The main model configuration.
    config: ModelConfig,
    /// Channels of the stride-8, 16 and 32 backbone features.
    channels: [usize; 3],
}

impl MdfraDecoderConfig {
    /// Initializes a new `MdfraDecoder` module.
    pub fn init<B: Backend>(&self, device: &Device<B>) -> MdfraDecoder<B> {
        let decoder = &self.config.decoder;
        let c = decoder.channel;
        let interpolation = self.config.interpolation.clone();

        let projector = |in_channels: usize| ConvBlockConfig::new([in_channels, c]).init(device);
        let msmb = || {
            MsmbConfig::new()
                .with_channel(c)
                .with_reduce_kernel(decoder.msmb_reduce_kernel)
                .init(device)
        };
        let head = || {
            RefineHeadConfig::new()
                .with_channel(c)
                .with_output_activation(decoder.head_output_activation)
                .init(device)
        };

        MdfraDecoder {
            rfb2_1: projector(self.channels[0]),
            rfb3_1: projector(self.channels[1]),
            rfb4_1: projector(self.channels[2]),
            agg1: AggregationConfig::new()
                .with_channel(c)
                .with_interpolation_strategy(interpolation.clone())
                .init(device),
            msmb_1: msmb(),
            msmb_2: msmb(),
            msmb_3: msmb(),
            esa: EsaBlockConfig::new(c)
                .with_heads(decoder.heads)
                .with_dim_head(decoder.dim_head)
                .with_mlp_dim(decoder.mlp_dim)
                .with_dropout(decoder.attention_dropout)
                .with_pooling_sizes(decoder.pooling_sizes.clone())
                .init(device),
            pca: PcaBlockConfig::new(c)
                .with_heads(decoder.heads)
                .with_dim_head(decoder.dim_head)
                .with_mlp_dim(decoder.mlp_dim)
                .with_dropout(decoder.attention_dropout)
                .with_eps(decoder.mask_pool_eps)
                .init(device),
            apa: ApaConfig::new(c, c)
                .with_dropout(decoder.apa_dropout)
                .with_interpolation(interpolation.clone())
                .init(device),
            ra1: head(),
            ra2: head(),
            ra3: head(),
            interpolation_strategy: Ignored(interpolation),
        }
    }
}

/// The MdfraNet decoder.
///
/// `msmb_1`/`ra1` belong to the finest (stride-8) stage and `msmb_3`/`ra3` to the
/// coarsest (stride-32) one. ESA, PCA and APA are shared by all three stages.
#[derive(Module, Debug)]
pub struct MdfraDecoder<B: Backend> {
    rfb2_1: ConvBlock<B>,
    rfb3_1: ConvBlock<B>,
    rfb4_1: ConvBlock<B>,
    agg1: Aggregation<B>,
    msmb_1: Msmb<B>,
    msmb_2: Msmb<B>,
    msmb_3: Msmb<B>,
    esa: EsaBlock<B>,
    pca: PcaBlock<B>,
    apa: Apa<B>,
    ra1: RefineHead<B>,
    ra2: RefineHead<B>,
    ra3: RefineHead<B>,
    interpolation_strategy: Ignored<InterpolationStrategy>,
}

impl<B: Backend> MdfraDecoder<B> {
    fn resize(&self, x: Tensor<B, 4>, factor: f64) -> Tensor<B, 4> {
        resize_by(x, factor, &self.interpolation_strategy.0)
    }

    /// One reverse-attention refinement stage.
    ///
    /// `prior` must already be at the resolution of `feature`. Returns the corrected
    /// prediction at that resolution.
    fn refine(
        &self,
        feature: Tensor<B, 4>,
        prior: Tensor<B, 4>,
        msmb: &Msmb<B>,
        head: &RefineHead<B>,
    ) -> Tensor<B, 4> {
        let refined = self.esa.forward(msmb.forward(feature));

        let guided = self.pca.forward(refined.clone(), reverse_attention(prior.clone()));
        let attended = self.apa.forward(refined);

        head.forward(guided * attended) + prior
    }

    /// # Shapes
    /// - `features`: `[x2, x3, x4]` at strides 8, 16 and 32
    /// - every output map: `[B, 1, 8 * H/8, 8 * W/8]`
    pub fn forward(&self, features: [Tensor<B, 4>; 3]) -> MdfraOutput<B> {
        let [x2, x3, x4] = features;

        let x2_rfb = self.rfb2_1.forward(x2);
        let x3_rfb = self.rfb3_1.forward(x3);
        let x4_rfb = self.rfb4_1.forward(x4);

        let decoder_1 = self.agg1.forward(x4_rfb.clone(), x3_rfb.clone(), x2_rfb.clone());
        let coarse_map = self.resize(decoder_1.clone(), COARSE_SCALE);

        // stride 32
        let prior = self.resize(decoder_1, FIRST_PRIOR_SCALE);
        let x_3 = self.refine(x4_rfb, prior, &self.msmb_3, &self.ra3);
        let stage_32 = self.resize(x_3.clone(), STAGE_OUTPUT_SCALES[0]);

        // stride 16
        let prior = self.resize(x_3, STAGE_SCALE);
        let x_2 = self.refine(x3_rfb, prior, &self.msmb_2, &self.ra2);
        let stage_16 = self.resize(x_2.clone(), STAGE_OUTPUT_SCALES[1]);

        // stride 8
        let prior = self.resize(x_2, STAGE_SCALE);
        let x_1 = self.refine(x2_rfb, prior, &self.msmb_1, &self.ra1);
        let final_map = self.resize(x_1, STAGE_OUTPUT_SCALES[2]);

        MdfraOutput {
            final_map,
            coarse_map,
            stage_maps: [stage_32, stage_16],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DecoderConfig;
    use burn::{
        backend::NdArray,
        tensor::{Distribution, Tolerance},
    };

    type TestBackend = NdArray<f32>;

    fn small_config() -> ModelConfig {
        ModelConfig::new().with_decoder(
            DecoderConfig::new()
                .with_channel(16)
                .with_heads(2)
                .with_dim_head(8)
                .with_mlp_dim(32),
        )
    }

    fn features(batch: usize, side: usize, channels: [usize; 3]) -> [Tensor<TestBackend, 4>; 3] {
        let device = Default::default();
        [
            (channels[0], side / 8),
            (channels[1], side / 16),
            (channels[2], side / 32),
        ]
        .map(|(c, s)| Tensor::random([batch, c, s, s], Distribution::Normal(0.0, 1.0), &device))
    }

    #[test]
    fn test_reverse_attention_range() {
        let device = Default::default();
        let prediction =
            Tensor::<TestBackend, 4>::from_floats([[[[-1e4, 0.0, 1e4]]]], &device);

        reverse_attention(prediction).into_data().assert_approx_eq::<f32>(
            &TensorData::from([[[[1.0f32, 0.5, 0.0]]]]),
            Tolerance::default(),
        );
    }

    #[test]
    fn test_refine_head_output_layouts() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 4>::random(
            [1, 16, 8, 8],
            Distribution::Normal(0.0, 1.0),
            &device,
        );

        for output_activation in [false, true] {
            let head = RefineHeadConfig::new()
                .with_channel(16)
                .with_output_activation(output_activation)
                .init::<TestBackend>(&device);
            let out = head.forward(x.clone());

            assert_eq!(out.dims(), [1, 1, 8, 8]);
            if output_activation {
                assert!(!out.lower_elem(0.0).any().into_scalar());
            }
        }
    }

    #[test]
    fn test_decoder_output_shapes() {
        let device = Default::default();
        let channels = [24, 40, 48];
        let decoder = MdfraDecoderConfig::new(small_config(), channels).init::<TestBackend>(&device);

        for side in [128, 160] {
            let output = decoder.forward(features(2, side, channels));

            assert_eq!(output.final_map.dims(), [2, 1, side, side]);
            assert_eq!(output.coarse_map.dims(), [2, 1, side, side]);
            for map in &output.stage_maps {
                assert_eq!(map.dims(), [2, 1, side, side]);
            }
            assert_eq!(output.fused().dims(), [2, 1, side, side]);
        }
    }

    #[test]
    fn test_decoder_released_layout_shapes() {
        let device = Default::default();
        let channels = [24, 40, 48];
        let mut config = ModelConfig::released();
        config.decoder = config.decoder.with_channel(16).with_heads(2).with_dim_head(8);
        let decoder = MdfraDecoderConfig::new(config, channels).init::<TestBackend>(&device);

        let output = decoder.forward(features(1, 128, channels));

        assert_eq!(output.final_map.dims(), [1, 1, 128, 128]);
    }

    #[test]
    fn test_fused_is_sum_of_final_and_coarse() {
        let device = Default::default();
        let channels = [24, 40, 48];
        let decoder = MdfraDecoderConfig::new(small_config(), channels).init::<TestBackend>(&device);

        let output = decoder.forward(features(1, 128, channels));
        let expected = output.final_map.clone() + output.coarse_map.clone();

        output
            .fused()
            .into_data()
            .assert_approx_eq::<f32>(&expected.into_data(), Tolerance::default());
    }
}
