//! # Multi-Scale Multi-Branch Refiner (MSMB)
//!
//! Reduces a feature map to a quarter of its channels, runs three chains of inverted
//! bottleneck (MBConv) blocks on the reduced map, and concatenates every intermediate
//! block output so the concatenation restores the input width. A 1x1 fusion conv and a
//! global residual close the module.

use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        BatchNorm, BatchNormConfig, PRelu, PReluConfig, PaddingConfig2d,
    },
    prelude::*,
    tensor::{
        activation::{relu, sigmoid},
        module::adaptive_avg_pool2d,
    },
};

use super::{ConvBlock, ConvBlockConfig};
use crate::config::NormKind;

/// Channel chains of the three branches for a given module width.
///
/// Each row is `[input, block1, block2, block3]`; the three block outputs of all rows
/// sum to `channel`.
pub fn branch_schedule(channel: usize) -> [[usize; 4]; 3] {
    let (q, e, s) = (channel / 4, channel / 8, channel / 16);
    [[q, s, s, e], [q, s, s, e], [q, e, e, q]]
}

/// Batch normalization followed by a per-channel PReLU.
#[derive(Module, Debug)]
pub struct BnPrelu<B: Backend> {
    bn: BatchNorm<B, 2>,
    act: PRelu<B>,
}

impl<B: Backend> BnPrelu<B> {
    pub fn new(channels: usize, device: &Device<B>) -> Self {
        Self {
            bn: BatchNormConfig::new(channels).init(device),
            act: PReluConfig::new()
                .with_num_parameters(channels)
                .init(device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.act.forward(self.bn.forward(x))
    }
}

/// Squeeze-and-excitation channel gate with 1x1 convolutions.
#[derive(Module, Debug)]
pub struct SqueezeExcite<B: Backend> {
    fc1: Conv2d<B>,
    fc2: Conv2d<B>,
}

impl<B: Backend> SqueezeExcite<B> {
    pub fn new(channels: usize, reduction: usize, device: &Device<B>) -> Self {
        let reduced = (channels / reduction).max(1);
        Self {
            fc1: Conv2dConfig::new([channels, reduced], [1, 1]).init(device),
            fc2: Conv2dConfig::new([reduced, channels], [1, 1]).init(device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let gate = adaptive_avg_pool2d(x.clone(), [1, 1]);
        let gate = relu(self.fc1.forward(gate));
        let gate = sigmoid(self.fc2.forward(gate));

        x * gate
    }
}

/// Inverted bottleneck: 1x1 expansion, depthwise 3x3, SE gate, 1x1 projection.
#[derive(Module, Debug)]
pub struct MbConv<B: Backend> {
    expand_conv: Conv2d<B>,
    bn0: BatchNorm<B, 2>,
    depthwise_conv: Conv2d<B>,
    bn1: BatchNorm<B, 2>,
    se: SqueezeExcite<B>,
    project_conv: Conv2d<B>,
    bn2: BatchNorm<B, 2>,
    use_residual: bool,
}

impl<B: Backend> MbConv<B> {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        expand_ratio: usize,
        device: &Device<B>,
    ) -> Self {
        let hidden = in_channels * expand_ratio;

        let expand_conv = Conv2dConfig::new([in_channels, hidden], [1, 1])
            .with_bias(false)
            .init(device);
        let depthwise_conv = Conv2dConfig::new([hidden, hidden], [3, 3])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .with_groups(hidden)
            .with_bias(false)
            .init(device);
        let project_conv = Conv2dConfig::new([hidden, out_channels], [1, 1])
            .with_bias(false)
            .init(device);

        Self {
            expand_conv,
            bn0: BatchNormConfig::new(hidden).init(device),
            depthwise_conv,
            bn1: BatchNormConfig::new(hidden).init(device),
            se: SqueezeExcite::new(hidden, 4, device),
            project_conv,
            bn2: BatchNormConfig::new(out_channels).init(device),
            use_residual: in_channels == out_channels,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let out = self.bn0.forward(self.expand_conv.forward(x.clone()));
        let out = out.clamp(0.0, 6.0);
        let out = self.bn1.forward(self.depthwise_conv.forward(out));
        let out = out.clamp(0.0, 6.0);
        let out = self.se.forward(out);
        let out = self.bn2.forward(self.project_conv.forward(out));

        if self.use_residual {
            out + x
        } else {
            out
        }
    }
}

/// One chain of MBConv blocks. Every block output is kept.
#[derive(Module, Debug)]
pub struct MbBranch<B: Backend> {
    blocks: Vec<MbConv<B>>,
}

impl<B: Backend> MbBranch<B> {
    fn new(chain: [usize; 4], device: &Device<B>) -> Self {
        let blocks = chain
            .windows(2)
            .map(|io| MbConv::new(io[0], io[1], 4, device))
            .collect();
        Self { blocks }
    }

    /// Concatenation of all block outputs along channels.
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut outputs = Vec::with_capacity(self.blocks.len());
        let mut out = x;
        for block in &self.blocks {
            out = block.forward(out);
            outputs.push(out.clone());
        }
        Tensor::cat(outputs, 1)
    }
}

/// Configuration for the `Msmb` module.
#[derive(Config, Debug)]
pub struct MsmbConfig {
    /// Input and output channel width. Must be divisible by 16.
    #[config(default = "32")]
    pub channel: usize,
    /// Kernel of the reduction convolution.
    #[config(default = "1")]
    pub reduce_kernel: usize,
    /// Start the fusion conv at zero, making the module an identity map.
    #[config(default = "false")]
    pub zero_init_fusion: bool,
}

impl MsmbConfig {
    /// Initializes a new `Msmb` module.
    pub fn init<B: Backend>(&self, device: &Device<B>) -> Msmb<B> {
        let c = self.channel;
        let branches = branch_schedule(c)
            .into_iter()
            .map(|chain| MbBranch::new(chain, device))
            .collect();

        Msmb {
            bn_relu_1: BnPrelu::new(c, device),
            conv1x1_1: ConvBlockConfig::new([c, c / 4])
                .with_kernel_size(self.reduce_kernel)
                .init(device),
            branches,
            bn_relu_2: BnPrelu::new(c, device),
            conv1x1: ConvBlockConfig::new([c, c])
                .with_kernel_size(1)
                .with_norm(NormKind::None)
                .with_activation(false)
                .with_zero_init(self.zero_init_fusion)
                .init(device),
        }
    }
}

/// Multi-scale multi-branch refiner.
#[derive(Module, Debug)]
pub struct Msmb<B: Backend> {
    bn_relu_1: BnPrelu<B>,
    conv1x1_1: ConvBlock<B>,
    branches: Vec<MbBranch<B>>,
    bn_relu_2: BnPrelu<B>,
    conv1x1: ConvBlock<B>,
}

impl<B: Backend> Msmb<B> {
    /// # Shapes
    /// - input: `[B, C, H, W]`
    /// - output: `[B, C, H, W]`
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.bn_relu_1.forward(input.clone());
        let x = self.conv1x1_1.forward(x);

        let outputs = self
            .branches
            .iter()
            .map(|branch| branch.forward(x.clone()))
            .collect();
        let out = Tensor::cat(outputs, 1);

        let out = self.bn_relu_2.forward(out);
        let out = self.conv1x1.forward(out);

        out + input
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_branch_schedule_restores_width() {
        for channel in [16, 32, 64] {
            let restored: usize = branch_schedule(channel)
                .iter()
                .map(|chain| chain[1..].iter().sum::<usize>())
                .sum();
            assert_eq!(restored, channel);
        }
        assert_eq!(branch_schedule(32), [[8, 2, 2, 4], [8, 2, 2, 4], [8, 4, 4, 8]]);
    }

    #[test]
    fn test_mbconv_residual_only_on_matching_channels() {
        let device = Default::default();
        assert!(MbConv::<TestBackend>::new(2, 2, 4, &device).use_residual);
        assert!(!MbConv::<TestBackend>::new(8, 2, 4, &device).use_residual);
    }

    #[test]
    fn test_msmb_preserves_shape() {
        let device = Default::default();
        let input = Tensor::<TestBackend, 4>::random(
            [2, 32, 11, 11],
            burn::tensor::Distribution::Normal(0.0, 1.0),
            &device,
        );

        for reduce_kernel in [1, 3] {
            let msmb = MsmbConfig::new()
                .with_reduce_kernel(reduce_kernel)
                .init::<TestBackend>(&device);
            assert_eq!(msmb.forward(input.clone()).dims(), [2, 32, 11, 11]);
        }
    }

    #[test]
    fn test_msmb_zero_fusion_is_identity() {
        let device = Default::default();
        let msmb = MsmbConfig::new()
            .with_zero_init_fusion(true)
            .init::<TestBackend>(&device);
        let input = Tensor::<TestBackend, 4>::random(
            [1, 32, 22, 22],
            burn::tensor::Distribution::Normal(0.0, 1.0),
            &device,
        );

        let output = msmb.forward(input.clone());

        output.into_data().assert_eq(&input.into_data(), true);
    }
}
