//! Res2Net-v1b implementation for the MdfraNet backbone.
//!
//! This module provides the 26w×4s Res2Net-v1b encoder: a deep 3x3 stem followed by
//! four stages of Bottle2neck blocks producing stride-4/8/16/32 feature maps.

use burn::prelude::*;

mod blocks;
pub use blocks::*;

// Res2Net residual layer block configs
const RES2NET50_BLOCKS: [usize; 4] = [3, 4, 6, 3];
const RES2NET101_BLOCKS: [usize; 4] = [3, 4, 23, 3];

/// Res2Net backbone.
///
/// Provides the 4 feature levels (layer1-4) with 256/512/1024/2048 channels.
/// Derived from Res2Net_v1b.Res2Net
#[derive(Module, Debug)]
pub struct Res2NetBackbone<B: Backend> {
    pub stem: DeepStem<B>,
    pub layer1: LayerBlock<B>,
    pub layer2: LayerBlock<B>,
    pub layer3: LayerBlock<B>,
    pub layer4: LayerBlock<B>,
}

impl<B: Backend> Res2NetBackbone<B> {
    /// Forward pass returning the stride-4, 8, 16 and 32 feature maps.
    pub fn forward(&self, input: Tensor<B, 4>) -> [Tensor<B, 4>; 4] {
        let x = self.stem.forward(input);

        let x1 = self.layer1.forward(x);
        let x2 = self.layer2.forward(x1.clone());
        let x3 = self.layer3.forward(x2.clone());
        let x4 = self.layer4.forward(x3.clone());

        [x1, x2, x3, x4]
    }

    /// Channels of the four feature levels.
    pub const fn output_channels(&self) -> [usize; 4] {
        [64 * EXPANSION, 128 * EXPANSION, 256 * EXPANSION, 512 * EXPANSION]
    }

    fn new(blocks: [usize; 4], base_width: usize, scale: usize, device: &Device<B>) -> Self {
        let stem = DeepStem::new(3, device);

        let layer1 = LayerBlock::new(blocks[0], 64, 64, 1, base_width, scale, device);
        let layer2 = LayerBlock::new(
            blocks[1],
            64 * EXPANSION,
            128,
            2,
            base_width,
            scale,
            device,
        );
        let layer3 = LayerBlock::new(
            blocks[2],
            128 * EXPANSION,
            256,
            2,
            base_width,
            scale,
            device,
        );
        let layer4 = LayerBlock::new(
            blocks[3],
            256 * EXPANSION,
            512,
            2,
            base_width,
            scale,
            device,
        );

        Self {
            stem,
            layer1,
            layer2,
            layer3,
            layer4,
        }
    }
}

/// Res2Net configuration
#[derive(Config, Debug)]
pub struct Res2NetConfig {
    /// Number of blocks in each stage, [3, 4, 6, 3] for Res2Net-50
    pub layers: [usize; 4],
    /// Width of one split relative to a 64-channel bottleneck
    #[config(default = "26")]
    pub base_width: usize,
    /// Number of splits per block
    #[config(default = "4")]
    pub scale: usize,
}

impl Res2NetConfig {
    /// Res2Net-50 configuration
    pub fn res2net50() -> Self {
        Self::new(RES2NET50_BLOCKS)
    }

    /// Res2Net-101 configuration
    pub fn res2net101() -> Self {
        Self::new(RES2NET101_BLOCKS)
    }

    /// Initialize the Res2Net backbone
    pub fn init<B: Backend>(&self, device: &B::Device) -> Res2NetBackbone<B> {
        Res2NetBackbone::new(self.layers, self.base_width, self.scale, device)
    }
}
