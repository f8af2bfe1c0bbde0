//! Configuration module for MdfraNet.
//!
//! This module provides configuration structures and enums for the MdfraNet model.
//! It is organized into two main submodules:
//! - `core`: Contains the main configuration structures
//! - `enums`: Contains all enumeration types used in configurations

pub mod core;
pub mod enums;

// Re-export all configuration structures from core
pub use core::{BackboneConfig, DecoderConfig, ModelConfig, MIN_IMAGE_SIZE};

// Re-export all enums from enums
pub use enums::{Backbone, InterpolationStrategy, NormKind};
