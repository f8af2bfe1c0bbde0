//! MdfraNet front-ends
//!
//! Command-line applications around the `mdfranet-burn` model.
//!
//! ## Available Binaries
//!
//! - `infer`: Segment a single image and write the mask and a red overlay
//! - `converter`: Convert a PyTorch checkpoint to a Burn record
//!
//! ## Usage
//!
//! ```bash
//! # Segment an image
//! cargo run --release --bin infer -- MdfraNet-best.pth polyp.jpg --output outputs/
//!
//! # Convert a PyTorch checkpoint
//! cargo run --release --bin converter -- MdfraNet-best.pth mdfranet.mpk
//! ```

pub mod common;
pub mod config;

pub use config::{ConverterConfig, InferenceConfig};
