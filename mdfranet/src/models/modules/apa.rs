//! # Adaptive Pixel Attention (APA)
//!
//! A multi-branch convolution block:
//!
//! - a 1x1 skip projection and a chain of three 3x3 conv blocks,
//! - two [`LocalGlobalAttention`] branches (patch sizes 2 and 4) on the skip output,
//! - an efficient channel attention gate ([`Eca`]) and a [`SpatialAttention`] gate on
//!   the summed branches, followed by dropout, batch norm and ReLU.

use burn::{
    module::{Ignored, Param},
    nn::{
        conv::{Conv1d, Conv1dConfig, Conv2d, Conv2dConfig},
        BatchNorm, BatchNormConfig, Dropout, DropoutConfig, LayerNorm, LayerNormConfig, Linear,
        LinearConfig, PaddingConfig1d, PaddingConfig2d, Relu,
    },
    prelude::*,
    tensor::{
        activation::{sigmoid, softmax},
        Distribution,
    },
};
use burn_extra_ops::TensorExtraOps;

use super::{resize_to, ConvBlock, ConvBlockConfig};
use crate::config::{InterpolationStrategy, NormKind};

/// Kernel size of the ECA 1-D convolution for `channels` inputs.
///
/// `|(log2(C) + 1) / 2|` truncated, bumped to the next odd number.
pub fn eca_kernel_size(channels: usize) -> usize {
    let k = (((channels as f64).log2() + 1.0) / 2.0).abs() as usize;
    if k % 2 == 1 {
        k
    } else {
        k + 1
    }
}

/// Efficient channel attention.
#[derive(Module, Debug)]
pub struct Eca<B: Backend> {
    conv: Conv1d<B>,
}

impl<B: Backend> Eca<B> {
    pub fn new(channels: usize, device: &Device<B>) -> Self {
        let kernel_size = eca_kernel_size(channels);
        Self {
            conv: Conv1dConfig::new(1, 1, kernel_size)
                .with_padding(PaddingConfig1d::Explicit(kernel_size / 2))
                .with_bias(false)
                .init(device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [b, c, _, _] = x.dims();
        let pooled = x.clone().mean_dim(3).mean_dim(2).reshape([b, 1, c]);
        let gate = sigmoid(self.conv.forward(pooled)).reshape([b, c, 1, 1]);
        x * gate
    }
}

/// Spatial attention from channel-wise mean and max maps.
#[derive(Module, Debug)]
pub struct SpatialAttention<B: Backend> {
    conv: Conv2d<B>,
}

impl<B: Backend> SpatialAttention<B> {
    pub fn new(device: &Device<B>) -> Self {
        Self {
            conv: Conv2dConfig::new([2, 1], [7, 7])
                .with_padding(PaddingConfig2d::Explicit(3, 3))
                .init(device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let avg = x.clone().mean_dim(1);
        let max = x.clone().max_dim(1);
        let gate = sigmoid(self.conv.forward(Tensor::cat(vec![avg, max], 1)));
        gate * x
    }
}

/// Configuration for the `LocalGlobalAttention` module.
#[derive(Config, Debug)]
pub struct LocalGlobalAttentionConfig {
    /// Channels of the input and output maps.
    pub channels: usize,
    /// Side of the square, non-overlapping patches.
    pub patch_size: usize,
    #[config(default = "InterpolationStrategy::Bilinear")]
    pub interpolation: InterpolationStrategy,
}

impl LocalGlobalAttentionConfig {
    /// Initializes a new `LocalGlobalAttention` module.
    pub fn init<B: Backend>(&self, device: &Device<B>) -> LocalGlobalAttention<B> {
        let c = self.channels;
        let hidden = c / 2;
        let p2 = self.patch_size * self.patch_size;

        LocalGlobalAttention {
            mlp1: LinearConfig::new(p2, hidden).init(device),
            norm: LayerNormConfig::new(hidden).init(device),
            mlp2: LinearConfig::new(hidden, c).init(device),
            conv: Conv2dConfig::new([c, c], [1, 1]).init(device),
            prompt: Param::from_tensor(Tensor::random(
                [c],
                Distribution::Normal(0.0, 1.0),
                device,
            )),
            top_down_transform: Param::from_tensor(Tensor::eye(c, device)),
            patch_size: self.patch_size,
            interpolation_strategy: Ignored(self.interpolation.clone()),
        }
    }
}

/// Patch descriptors gated by a learned prompt and mixed by a learned transform.
#[derive(Module, Debug)]
pub struct LocalGlobalAttention<B: Backend> {
    mlp1: Linear<B>,
    norm: LayerNorm<B>,
    mlp2: Linear<B>,
    conv: Conv2d<B>,
    prompt: Param<Tensor<B, 1>>,
    top_down_transform: Param<Tensor<B, 2>>,
    patch_size: usize,
    interpolation_strategy: Ignored<InterpolationStrategy>,
}

impl<B: Backend> LocalGlobalAttention<B> {
    /// One `P*P` descriptor per non-overlapping patch.
    ///
    /// Rows and columns beyond the last whole patch are dropped. Each patch's
    /// `C*P*P` values, taken in `(channel, row, col)` order, are cut into `P*P`
    /// consecutive runs of `C` values and every run is averaged.
    ///
    /// # Shapes
    /// - input: `[B, C, H, W]`
    /// - output: `[B, (H/P)*(W/P), P*P]`
    pub fn patch_descriptors(&self, x: Tensor<B, 4>) -> Tensor<B, 3> {
        let [b, c, h, w] = x.dims();
        let p = self.patch_size;
        let (hp, wp) = (h / p, w / p);

        let x = if hp * p != h || wp * p != w {
            x.slice([0..b, 0..c, 0..hp * p, 0..wp * p])
        } else {
            x
        };

        x.reshape([b, c, hp, p, wp, p])
            .permute([0, 2, 4, 1, 3, 5])
            .reshape([b, hp * wp, p * p, c])
            .mean_dim(3)
            .reshape([b, hp * wp, p * p])
    }

    /// # Shapes
    /// - input: `[B, C, H, W]` with `H, W >= patch_size`
    /// - output: `[B, C, H, W]`
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [b, c, h, w] = x.dims();
        let p = self.patch_size;
        let (hp, wp) = (h / p, w / p);

        let local = self.patch_descriptors(x);
        let local = self.mlp1.forward(local);
        let local = self.norm.forward(local);
        let local = self.mlp2.forward(local);

        let local = local.clone() * softmax(local, 2);

        let prompt = self.prompt.val().l2_normalize(0).reshape([1, 1, c]);
        let similarity = (local.clone().l2_normalize(2) * prompt)
            .sum_dim(2)
            .clamp(0.0, 1.0);
        let local = local * similarity;

        let transform = self.top_down_transform.val().unsqueeze::<3>().repeat_dim(0, b);
        let local = local.matmul(transform);

        let local = local.reshape([b, hp, wp, c]).permute([0, 3, 1, 2]);
        let local = resize_to(local, [h, w], &self.interpolation_strategy.0);
        self.conv.forward(local)
    }
}

/// Configuration for the `Apa` module.
#[derive(Config, Debug)]
pub struct ApaConfig {
    pub in_channels: usize,
    pub filters: usize,
    #[config(default = "0.1")]
    pub dropout: f64,
    #[config(default = "InterpolationStrategy::Bilinear")]
    pub interpolation: InterpolationStrategy,
}

impl ApaConfig {
    /// Initializes a new `Apa` module.
    pub fn init<B: Backend>(&self, device: &Device<B>) -> Apa<B> {
        let branch = |channels: [usize; 2], kernel_size: usize, activation: bool| {
            ConvBlockConfig::new(channels)
                .with_kernel_size(kernel_size)
                .with_bias(true)
                .with_norm(NormKind::Batch)
                .with_activation(activation)
                .init(device)
        };
        let f = self.filters;
        let lga = |patch_size| {
            LocalGlobalAttentionConfig::new(f, patch_size)
                .with_interpolation(self.interpolation.clone())
                .init(device)
        };

        Apa {
            skip: branch([self.in_channels, f], 1, false),
            c1: branch([self.in_channels, f], 3, true),
            c2: branch([f, f], 3, true),
            c3: branch([f, f], 3, true),
            lga2: lga(2),
            lga4: lga(4),
            cn: Eca::new(f, device),
            sa: SpatialAttention::new(device),
            drop: DropoutConfig::new(self.dropout).init(),
            bn1: BatchNormConfig::new(f).init(device),
            relu: Relu::new(),
        }
    }
}

#[derive(Module, Debug)]
pub struct Apa<B: Backend> {
    skip: ConvBlock<B>,
    c1: ConvBlock<B>,
    c2: ConvBlock<B>,
    c3: ConvBlock<B>,
    lga2: LocalGlobalAttention<B>,
    lga4: LocalGlobalAttention<B>,
    cn: Eca<B>,
    sa: SpatialAttention<B>,
    drop: Dropout,
    bn1: BatchNorm<B, 2>,
    relu: Relu,
}

impl<B: Backend> Apa<B> {
    /// # Shapes
    /// - input: `[B, in_channels, H, W]` with `H, W >= 4`
    /// - output: `[B, filters, H, W]`
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x_skip = self.skip.forward(x.clone());
        let x_lga2 = self.lga2.forward(x_skip.clone());
        let x_lga4 = self.lga4.forward(x_skip.clone());

        let x1 = self.c1.forward(x);
        let x2 = self.c2.forward(x1.clone());
        let x3 = self.c3.forward(x2.clone());

        let x = x1 + x2 + x3 + x_skip + x_lga2 + x_lga4;
        let x = self.cn.forward(x);
        let x = self.sa.forward(x);
        let x = self.drop.forward(x);
        let x = self.bn1.forward(x);
        self.relu.forward(x)
    }
}
