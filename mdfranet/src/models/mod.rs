//! # Model Architectures
//!
//! This module aggregates the core components of the MdfraNet model architecture:
//!
//! - `mdfranet`: Defines the main `MdfraNet` model, which integrates the Res2Net backbone
//!   and the decoder.
//! - `decoder`: The projector, aggregator and the three-stage reverse-attention refinement
//!   loop.
//! - `modules`: Building blocks such as MSMB, the ESA/PCA attention blocks and APA.

pub mod decoder;
pub mod mdfranet;
pub mod modules;

pub use decoder::{MdfraDecoder, MdfraDecoderConfig, MdfraOutput, RefineHead};
pub use mdfranet::{MdfraNet, MdfraNetConfig, MdfraNetRecord};
