//! # Pooled-Token Attention Blocks
//!
//! Two transformer-style blocks that let every pixel attend to a handful of pooled
//! key/value tokens instead of to every other pixel:
//!
//! - [`EsaBlock`]: keys and values are adaptive-average pooled on fixed grids
//!   (`1 + 9 + 25 = 35` tokens for the default `[1, 3, 5]` pyramid).
//! - [`PcaBlock`]: keys and values are a single token, the feature map averaged under a
//!   sigmoid guidance mask.
//!
//! Both add the attention output and a pre-norm feed-forward sub-block residually to the
//! flattened input and return a map of the input's shape.

use burn::{
    module::Ignored,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        Dropout, DropoutConfig, Gelu, LayerNorm, LayerNormConfig, Linear, LinearConfig,
    },
    prelude::*,
    tensor::{
        activation::{sigmoid, softmax},
        module::adaptive_avg_pool2d,
    },
};
use burn_extra_ops::{
    flatten_spatial, merge_heads, split_heads, split_token_heads, unflatten_spatial,
};

/// Mask-weighted average pooling.
///
/// `sum(x * sigmoid(mask)) / (sum(sigmoid(mask)) + eps)` over all spatial positions.
///
/// # Shapes
/// - `x`: `[B, C, H, W]`
/// - `mask`: `[B, 1, H, W]` (logits)
/// - output: `[B, C, 1]`
pub fn mask_average_pool<B: Backend>(x: Tensor<B, 4>, mask: Tensor<B, 4>, eps: f64) -> Tensor<B, 3> {
    let [b, c, _, _] = x.dims();
    let mask = sigmoid(mask);

    let area = mask.clone().sum_dim(3).sum_dim(2) + eps;
    let pooled = (x * mask).sum_dim(3).sum_dim(2) / area;

    pooled.reshape([b, c, 1])
}

/// Configuration shared by the ESA and PCA attention layers.
#[derive(Config, Debug)]
pub struct AttentionLayerConfig {
    /// Channels of the input feature map.
    pub dim: usize,
    #[config(default = "8")]
    pub heads: usize,
    #[config(default = "64")]
    pub dim_head: usize,
    #[config(default = "0.0")]
    pub dropout: f64,
}

impl AttentionLayerConfig {
    pub fn init<B: Backend>(&self, device: &Device<B>) -> AttentionLayer<B> {
        let inner_dim = self.heads * self.dim_head;
        let project_out = !(self.heads == 1 && self.dim_head == self.dim);

        AttentionLayer {
            to_qkv: Conv2dConfig::new([self.dim, inner_dim * 3], [1, 1])
                .with_bias(false)
                .init(device),
            to_out: project_out.then(|| LinearConfig::new(inner_dim, self.dim).init(device)),
            dropout: DropoutConfig::new(self.dropout).init(),
            heads: self.heads,
            scale: (self.dim_head as f64).powf(-0.5),
        }
    }
}

/// Multi-head attention of per-pixel queries over an externally pooled token set.
#[derive(Module, Debug)]
pub struct AttentionLayer<B: Backend> {
    to_qkv: Conv2d<B>,
    to_out: Option<Linear<B>>,
    dropout: Dropout,
    heads: usize,
    scale: f64,
}

impl<B: Backend> AttentionLayer<B> {
    /// Projects `x` and returns `(query heads, key map, value map)`.
    ///
    /// # Shapes
    /// - `x`: `[B, C, H, W]`
    /// - query heads: `[B, heads, H*W, dim_head]`
    /// - key and value maps: `[B, heads*dim_head, H, W]`
    fn project(&self, x: Tensor<B, 4>) -> (Tensor<B, 4>, Tensor<B, 4>, Tensor<B, 4>) {
        let qkv = self.to_qkv.forward(x);
        let inner = qkv.dims()[1] / 3;

        let q = qkv.clone().narrow(1, 0, inner);
        let k = qkv.clone().narrow(1, inner, inner);
        let v = qkv.narrow(1, 2 * inner, inner);

        (split_heads(q, self.heads), k, v)
    }

    /// Softmax attention weights of the queries over `keys` (`[B, heads*d, N]`).
    fn weights(&self, q: Tensor<B, 4>, keys: Tensor<B, 3>) -> Tensor<B, 4> {
        let k = split_token_heads(keys, self.heads);
        let dots = q.matmul(k.swap_dims(2, 3)) * self.scale;
        softmax(dots, 3)
    }

    /// Weighted sum of `values` (`[B, heads*d, N]`), projected back to `[B, H*W, C]`.
    fn combine(&self, attn: Tensor<B, 4>, values: Tensor<B, 3>) -> Tensor<B, 3> {
        let v = split_token_heads(values, self.heads);
        let out = merge_heads(attn.matmul(v));
        match &self.to_out {
            Some(to_out) => self.dropout.forward(to_out.forward(out)),
            None => out,
        }
    }
}

/// Configuration for the `FeedForward` module.
#[derive(Config, Debug)]
pub struct FeedForwardConfig {
    pub dim: usize,
    pub hidden_dim: usize,
    #[config(default = "0.0")]
    pub dropout: f64,
}

impl FeedForwardConfig {
    pub fn init<B: Backend>(&self, device: &Device<B>) -> FeedForward<B> {
        FeedForward {
            norm: LayerNormConfig::new(self.dim).init(device),
            fc1: LinearConfig::new(self.dim, self.hidden_dim).init(device),
            act: Gelu::new(),
            drop: DropoutConfig::new(self.dropout).init(),
            fc2: LinearConfig::new(self.hidden_dim, self.dim).init(device),
        }
    }
}

/// Pre-norm position-wise MLP.
#[derive(Module, Debug)]
pub struct FeedForward<B: Backend> {
    norm: LayerNorm<B>,
    fc1: Linear<B>,
    act: Gelu,
    drop: Dropout,
    fc2: Linear<B>,
}

impl<B: Backend> FeedForward<B> {
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let x = self.norm.forward(x);
        let x = self.fc1.forward(x);
        let x = self.act.forward(x);
        let x = self.drop.forward(x);
        let x = self.fc2.forward(x);
        self.drop.forward(x)
    }
}

/// Residual attention followed by a residual feed-forward, in token layout.
fn residual_update<B: Backend>(
    x: Tensor<B, 4>,
    attended: Tensor<B, 3>,
    ff: &FeedForward<B>,
) -> Tensor<B, 4> {
    let [_, _, h, w] = x.dims();
    let out = attended + flatten_spatial(x);
    let out = ff.forward(out.clone()) + out;
    unflatten_spatial(out, h, w)
}

/// Configuration for the `EsaBlock` module.
#[derive(Config, Debug)]
pub struct EsaBlockConfig {
    pub dim: usize,
    #[config(default = "8")]
    pub heads: usize,
    #[config(default = "64")]
    pub dim_head: usize,
    #[config(default = "512")]
    pub mlp_dim: usize,
    #[config(default = "0.0")]
    pub dropout: f64,
    /// Adaptive-pool grid sizes; the token count is the sum of their squares.
    #[config(default = "vec![1, 3, 5]")]
    pub pooling_sizes: Vec<usize>,
}

impl EsaBlockConfig {
    /// Initializes a new `EsaBlock` module.
    pub fn init<B: Backend>(&self, device: &Device<B>) -> EsaBlock<B> {
        EsaBlock {
            layer: AttentionLayerConfig::new(self.dim)
                .with_heads(self.heads)
                .with_dim_head(self.dim_head)
                .with_dropout(self.dropout)
                .init(device),
            ff: FeedForwardConfig::new(self.dim, self.mlp_dim)
                .with_dropout(self.dropout)
                .init(device),
            pooling_sizes: Ignored(self.pooling_sizes.clone()),
        }
    }
}

/// Efficient self-attention: pixels attend to a pyramid of pooled tokens.
#[derive(Module, Debug)]
pub struct EsaBlock<B: Backend> {
    layer: AttentionLayer<B>,
    ff: FeedForward<B>,
    pooling_sizes: Ignored<Vec<usize>>,
}

impl<B: Backend> EsaBlock<B> {
    /// `[B, C, H, W] -> [B, C, N]` with `N` the sum of squared grid sizes.
    fn pyramid_pool(&self, x: Tensor<B, 4>) -> Tensor<B, 3> {
        let [b, c, _, _] = x.dims();
        let tokens = self
            .pooling_sizes
            .0
            .iter()
            .map(|&size| adaptive_avg_pool2d(x.clone(), [size, size]).reshape([b, c, size * size]))
            .collect();
        Tensor::cat(tokens, 2)
    }

    /// Attention weights `[B, heads, H*W, N]` of every pixel over the pooled tokens.
    pub fn attention_weights(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let (q, k, _) = self.layer.project(x);
        self.layer.weights(q, self.pyramid_pool(k))
    }

    /// # Shapes
    /// - input: `[B, C, H, W]`
    /// - output: `[B, C, H, W]`
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let (q, k, v) = self.layer.project(x.clone());
        let attn = self.layer.weights(q, self.pyramid_pool(k));
        let attended = self.layer.combine(attn, self.pyramid_pool(v));

        residual_update(x, attended, &self.ff)
    }
}

/// Configuration for the `PcaBlock` module.
#[derive(Config, Debug)]
pub struct PcaBlockConfig {
    pub dim: usize,
    #[config(default = "8")]
    pub heads: usize,
    #[config(default = "64")]
    pub dim_head: usize,
    #[config(default = "512")]
    pub mlp_dim: usize,
    #[config(default = "0.0")]
    pub dropout: f64,
    /// Additive epsilon of the mask pooling denominator.
    #[config(default = "5e-4")]
    pub eps: f64,
}

impl PcaBlockConfig {
    /// Initializes a new `PcaBlock` module.
    pub fn init<B: Backend>(&self, device: &Device<B>) -> PcaBlock<B> {
        PcaBlock {
            layer: AttentionLayerConfig::new(self.dim)
                .with_heads(self.heads)
                .with_dim_head(self.dim_head)
                .with_dropout(self.dropout)
                .init(device),
            ff: FeedForwardConfig::new(self.dim, self.mlp_dim)
                .with_dropout(self.dropout)
                .init(device),
            eps: self.eps,
        }
    }
}

/// Mask-guided attention: pixels attend to one token pooled under a guidance mask.
#[derive(Module, Debug)]
pub struct PcaBlock<B: Backend> {
    layer: AttentionLayer<B>,
    ff: FeedForward<B>,
    eps: f64,
}

impl<B: Backend> PcaBlock<B> {
    /// Attention weights `[B, heads, H*W, 1]`.
    pub fn attention_weights(&self, x: Tensor<B, 4>, mask: Tensor<B, 4>) -> Tensor<B, 4> {
        let (q, k, _) = self.layer.project(x);
        self.layer.weights(q, mask_average_pool(k, mask, self.eps))
    }

    /// # Shapes
    /// - `x`: `[B, C, H, W]`
    /// - `mask`: `[B, 1, H, W]`
    /// - output: `[B, C, H, W]`
    pub fn forward(&self, x: Tensor<B, 4>, mask: Tensor<B, 4>) -> Tensor<B, 4> {
        let (q, k, v) = self.layer.project(x.clone());
        let attn = self
            .layer
            .weights(q, mask_average_pool(k, mask.clone(), self.eps));
        let attended = self
            .layer
            .combine(attn, mask_average_pool(v, mask, self.eps));

        residual_update(x, attended, &self.ff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::{backend::NdArray, tensor::Tolerance};

    type TestBackend = NdArray<f32>;

    fn feature(shape: [usize; 4]) -> Tensor<TestBackend, 4> {
        Tensor::random(
            shape,
            burn::tensor::Distribution::Normal(0.0, 1.0),
            &Default::default(),
        )
    }

    #[test]
    fn test_esa_block_preserves_shape() {
        let device = Default::default();
        let esa = EsaBlockConfig::new(32).init::<TestBackend>(&device);

        assert_eq!(esa.forward(feature([2, 32, 11, 11])).dims(), [2, 32, 11, 11]);
    }

    #[test]
    fn test_esa_attention_rows_sum_to_one() {
        let device = Default::default();
        let esa = EsaBlockConfig::new(32).init::<TestBackend>(&device);

        let attn = esa.attention_weights(feature([2, 32, 11, 11]));
        assert_eq!(attn.dims(), [2, 8, 121, 35]);

        attn.sum_dim(3).into_data().assert_approx_eq::<f32>(
            &Tensor::<TestBackend, 4>::ones([2, 8, 121, 1], &device).into_data(),
            Tolerance::absolute(1e-5),
        );
    }

    #[test]
    fn test_pca_attention_rows_sum_to_one() {
        let device = Default::default();
        let pca = PcaBlockConfig::new(32).init::<TestBackend>(&device);

        let attn = pca.attention_weights(feature([1, 32, 22, 22]), feature([1, 1, 22, 22]));
        assert_eq!(attn.dims(), [1, 8, 484, 1]);

        attn.sum_dim(3).into_data().assert_approx_eq::<f32>(
            &Tensor::<TestBackend, 4>::ones([1, 8, 484, 1], &device).into_data(),
            Tolerance::absolute(1e-5),
        );
    }

    #[test]
    fn test_pca_block_preserves_shape() {
        let device = Default::default();
        let pca = PcaBlockConfig::new(32).init::<TestBackend>(&device);

        let out = pca.forward(feature([2, 32, 11, 11]), feature([2, 1, 11, 11]));

        assert_eq!(out.dims(), [2, 32, 11, 11]);
    }

    #[test]
    fn test_identity_projection_when_single_head_matches_width() {
        let device = Default::default();
        let layer = AttentionLayerConfig::new(32)
            .with_heads(1)
            .with_dim_head(32)
            .init::<TestBackend>(&device);

        assert!(layer.to_out.is_none());
    }

    #[test]
    fn test_mask_pool_all_zero_mask_is_finite() {
        let device = Default::default();
        let x = feature([2, 16, 8, 8]);
        // sigmoid(-1e4) underflows to exactly zero
        let mask = Tensor::<TestBackend, 4>::full([2, 1, 8, 8], -1e4, &device);

        let pooled = mask_average_pool(x.clone(), mask, 5e-4);

        assert_eq!(pooled.dims(), [2, 16, 1]);
        assert!(!pooled.clone().is_nan().any().into_scalar());
        pooled.into_data().assert_approx_eq::<f32>(
            &Tensor::<TestBackend, 3>::zeros([2, 16, 1], &device).into_data(),
            Tolerance::absolute(1e-6),
        );

        // A PCA block guided by the same mask stays finite end to end
        let pca = PcaBlockConfig::new(16)
            .with_heads(2)
            .with_dim_head(8)
            .init::<TestBackend>(&device);
        let out = pca.forward(x, Tensor::full([2, 1, 8, 8], -1e4, &device));
        assert!(!out.is_nan().any().into_scalar());
    }

    #[test]
    fn test_mask_pool_matches_epsilon_formula() {
        let device = Default::default();
        let (h, w) = (4, 4);
        let x = feature([1, 3, h, w]);
        // logit 0 -> weight 0.5 everywhere, logit -30 -> weight ~9.4e-14
        for logit in [0.0f32, -30.0] {
            let mask = Tensor::<TestBackend, 4>::full([1, 1, h, w], logit, &device);
            let pooled = mask_average_pool(x.clone(), mask, 5e-4);

            let m = 1.0 / (1.0 + (-logit as f64).exp());
            let values = x.clone().into_data().to_vec::<f32>().unwrap();
            let expected: Vec<f32> = values
                .chunks(h * w)
                .map(|channel| {
                    let weighted: f64 = channel.iter().map(|&v| v as f64 * m).sum();
                    (weighted / (m * (h * w) as f64 + 5e-4)) as f32
                })
                .collect();

            pooled.into_data().assert_approx_eq::<f32>(
                &TensorData::new(expected, [1, 3, 1]),
                Tolerance::absolute(1e-5),
            );
        }
    }
}
