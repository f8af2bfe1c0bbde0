//! # MdfraNet-Burn
//!
//! This crate provides a Rust implementation of MdfraNet, a multi-scale reverse-attention
//! network for binary segmentation, built using the Burn deep learning framework.
//!
//! ## Modules
//!
//! - `config`: Configuration structures for the backbone and decoder, with validation.
//! - `error`: Defines the custom error types used throughout the crate.
//! - `models`: The model architecture: the Res2Net encoder wiring, the decoder with its
//!   three refinement stages, and building blocks such as MSMB, ESA, PCA and APA.
//! - `weights` (feature `pretrained`): binding PyTorch, SafeTensors and Burn checkpoints.
//!
//! ## Key Components
//!
//! - `MdfraNet`: The main model struct.
//! - `ModelConfig`: The primary configuration struct that drives the model's construction.
//! - `MdfraOutput`: The final, coarse and per-stage logits of a forward pass.
//! - `MdfraError`: The enum for all possible errors.

mod config;
mod error;
pub mod models;
#[cfg(feature = "pretrained")]
pub mod weights;


#[doc(inline)]
pub use config::{
    Backbone, BackboneConfig, DecoderConfig, InterpolationStrategy, ModelConfig, NormKind,
    MIN_IMAGE_SIZE,
};
#[doc(inline)]
pub use error::{MdfraError, MdfraResult};
#[doc(inline)]
pub use models::modules::{ConvBlock, ConvBlockConfig};
#[doc(inline)]
pub use models::{MdfraNet, MdfraNetConfig, MdfraNetRecord, MdfraOutput};
#[cfg(feature = "pretrained")]
#[doc(inline)]
pub use weights::{save_weights, BindingReport, PretrainedWeights, WeightFormat};
