//! Res2Net-v1b block implementations.
//!
//! This module contains the building blocks for Res2Net: Bottle2neck, the average-pool
//! Downsample of the v1b variant, and LayerBlock.

use core::f64::consts::SQRT_2;

use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AvgPool2d, AvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, Initializer, PaddingConfig2d, Relu,
    },
    prelude::*,
};

/// Res2Net bottleneck expansion.
pub const EXPANSION: usize = 4;

fn kaiming() -> Initializer {
    Initializer::KaimingNormal {
        gain: SQRT_2,
        fan_out_only: true,
    }
}

/// Res2Net bottleneck block with hierarchical split-add 3x3 convolutions.
/// Derived from Res2Net_v1b.Bottle2neck
///
/// The first block of a stage (`stage == true`) convolves every split independently and
/// average-pools the last split. Other blocks feed each split's output into the next
/// split and pass the last split through unchanged.
#[derive(Module, Debug)]
pub struct Bottle2neck<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B, 2>,
    convs: Vec<Conv2d<B>>,
    bns: Vec<BatchNorm<B, 2>>,
    pool: Option<AvgPool2d>,
    conv3: Conv2d<B>,
    bn3: BatchNorm<B, 2>,
    relu: Relu,
    downsample: Option<Downsample<B>>,
    width: usize,
}

impl<B: Backend> Bottle2neck<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let identity = input.clone();

        let out = self.conv1.forward(input);
        let out = self.bn1.forward(out);
        let out = self.relu.forward(out);

        let splits = out.split(self.width, 1);
        let mut outputs = Vec::with_capacity(splits.len());
        let mut previous: Option<Tensor<B, 4>> = None;
        for (i, (conv, bn)) in self.convs.iter().zip(&self.bns).enumerate() {
            let sp = match (&self.pool, previous.take()) {
                (None, Some(prev)) => prev + splits[i].clone(),
                _ => splits[i].clone(),
            };
            let sp = self.relu.forward(bn.forward(conv.forward(sp)));
            outputs.push(sp.clone());
            previous = Some(sp);
        }

        let last = splits[self.convs.len()].clone();
        outputs.push(match &self.pool {
            Some(pool) => pool.forward(last),
            None => last,
        });

        let out = Tensor::cat(outputs, 1);
        let out = self.conv3.forward(out);
        let out = self.bn3.forward(out);

        // Skip connection
        let out = match &self.downsample {
            Some(downsample) => out + downsample.forward(identity),
            None => out + identity,
        };

        self.relu.forward(out)
    }

    /// Create a new Bottle2neck.
    ///
    /// `planes` is the bottleneck width before expansion; the block outputs
    /// `planes * 4` channels. `scale` must be at least 2.
    pub fn new(
        in_channels: usize,
        planes: usize,
        stride: usize,
        base_width: usize,
        scale: usize,
        stage: bool,
        device: &Device<B>,
    ) -> Self {
        let width = planes * base_width / 64;
        let out_channels = planes * EXPANSION;

        // conv1x1
        let conv1 = Conv2dConfig::new([in_channels, width * scale], [1, 1])
            .with_bias(false)
            .with_initializer(kaiming())
            .init(device);
        let bn1 = BatchNormConfig::new(width * scale).init(device);

        assert!(scale >= 2, "Res2Net scale must be at least 2, got {scale}");
        let nums = scale - 1;
        let convs = (0..nums)
            .map(|_| {
                Conv2dConfig::new([width, width], [3, 3])
                    .with_stride([stride, stride])
                    .with_padding(PaddingConfig2d::Explicit(1, 1))
                    .with_bias(false)
                    .with_initializer(kaiming())
                    .init(device)
            })
            .collect();
        let bns = (0..nums)
            .map(|_| BatchNormConfig::new(width).init(device))
            .collect();

        let pool = stage.then(|| {
            AvgPool2dConfig::new([3, 3])
                .with_strides([stride, stride])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init()
        });

        // conv1x1
        let conv3 = Conv2dConfig::new([width * scale, out_channels], [1, 1])
            .with_bias(false)
            .with_initializer(kaiming())
            .init(device);
        let bn3 = BatchNormConfig::new(out_channels).init(device);

        let downsample = (stride != 1 || in_channels != out_channels)
            .then(|| Downsample::new(in_channels, out_channels, stride, device));

        Self {
            conv1,
            bn1,
            convs,
            bns,
            pool,
            conv3,
            bn3,
            relu: Relu::new(),
            downsample,
            width,
        }
    }
}

/// Downsample path of the v1b variant: average pooling performs the striding, then a
/// 1x1 conv adjusts the number of channels.
#[derive(Module, Debug)]
pub struct Downsample<B: Backend> {
    pool: AvgPool2d,
    conv: Conv2d<B>,
    bn: BatchNorm<B, 2>,
}

impl<B: Backend> Downsample<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let out = self.pool.forward(input);
        let out = self.conv.forward(out);
        self.bn.forward(out)
    }

    /// Create a new Downsample.
    pub fn new(in_channels: usize, out_channels: usize, stride: usize, device: &Device<B>) -> Self {
        let pool = AvgPool2dConfig::new([stride, stride])
            .with_strides([stride, stride])
            .with_count_include_pad(false)
            .init();

        // conv1x1
        let conv = Conv2dConfig::new([in_channels, out_channels], [1, 1])
            .with_bias(false)
            .with_initializer(kaiming())
            .init(device);
        let bn = BatchNormConfig::new(out_channels).init(device);

        Self { pool, conv, bn }
    }
}

/// Collection of sequential Bottle2neck blocks.
#[derive(Module, Debug)]
pub struct LayerBlock<B: Backend> {
    blocks: Vec<Bottle2neck<B>>,
}

impl<B: Backend> LayerBlock<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut out = input;
        for block in &self.blocks {
            out = block.forward(out);
        }
        out
    }

    /// Create a new LayerBlock.
    pub fn new(
        num_blocks: usize,
        in_channels: usize,
        planes: usize,
        stride: usize,
        base_width: usize,
        scale: usize,
        device: &Device<B>,
    ) -> Self {
        let out_channels = planes * EXPANSION;
        let blocks = (0..num_blocks)
            .map(|b| {
                if b == 0 {
                    // First block strides and pools its last split
                    Bottle2neck::new(in_channels, planes, stride, base_width, scale, true, device)
                } else {
                    Bottle2neck::new(out_channels, planes, 1, base_width, scale, false, device)
                }
            })
            .collect();

        Self { blocks }
    }
}

/// Deep stem: three 3x3 convs replacing the single 7x7 conv, then bn + relu + maxpool.
#[derive(Module, Debug)]
pub struct DeepStem<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B, 2>,
    conv2: Conv2d<B>,
    bn2: BatchNorm<B, 2>,
    conv3: Conv2d<B>,
    bn3: BatchNorm<B, 2>,
    relu: Relu,
    maxpool: MaxPool2d,
}

impl<B: Backend> DeepStem<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let out = self.relu.forward(self.bn1.forward(self.conv1.forward(input)));
        let out = self.relu.forward(self.bn2.forward(self.conv2.forward(out)));
        let out = self.conv3.forward(out);
        let out = self.relu.forward(self.bn3.forward(out));
        self.maxpool.forward(out)
    }

    /// Create a new DeepStem.
    pub fn new(in_channels: usize, device: &Device<B>) -> Self {
        let conv3x3 = |channels: [usize; 2], stride: usize| {
            Conv2dConfig::new(channels, [3, 3])
                .with_stride([stride, stride])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .with_bias(false)
                .with_initializer(kaiming())
                .init(device)
        };

        // 3x3 maxpool, stride=2, padding=1
        let maxpool = MaxPool2dConfig::new([3, 3])
            .with_strides([2, 2])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init();

        Self {
            conv1: conv3x3([in_channels, 32], 2),
            bn1: BatchNormConfig::new(32).init(device),
            conv2: conv3x3([32, 32], 1),
            bn2: BatchNormConfig::new(32).init(device),
            conv3: conv3x3([32, 64], 1),
            bn3: BatchNormConfig::new(64).init(device),
            relu: Relu::new(),
            maxpool,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_bottle2neck_stage_block_strides() {
        let device = Default::default();
        let block = Bottle2neck::<TestBackend>::new(256, 128, 2, 26, 4, true, &device);

        let input = Tensor::<TestBackend, 4>::random(
            [1, 256, 16, 16],
            burn::tensor::Distribution::Normal(0.0, 1.0),
            &device,
        );

        assert_eq!(block.forward(input).dims(), [1, 512, 8, 8]);
    }

    #[test]
    fn test_bottle2neck_normal_block_keeps_shape() {
        let device = Default::default();
        let block = Bottle2neck::<TestBackend>::new(256, 64, 1, 26, 4, false, &device);
        assert!(block.downsample.is_none());
        assert!(block.pool.is_none());

        let input = Tensor::<TestBackend, 4>::random(
            [2, 256, 8, 8],
            burn::tensor::Distribution::Normal(0.0, 1.0),
            &device,
        );

        assert_eq!(block.forward(input).dims(), [2, 256, 8, 8]);
    }

    #[test]
    fn test_deep_stem_reduces_by_four() {
        let device = Default::default();
        let stem = DeepStem::<TestBackend>::new(3, &device);

        let input = Tensor::<TestBackend, 4>::random(
            [1, 3, 64, 64],
            burn::tensor::Distribution::Normal(0.0, 1.0),
            &device,
        );

        assert_eq!(stem.forward(input).dims(), [1, 64, 16, 16]);
    }
}
