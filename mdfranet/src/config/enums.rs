//! Enumeration types for MdfraNet configuration.

use burn::prelude::*;

use crate::error::{MdfraError, MdfraResult};

/// Interpolation strategy for every resize inside the decoder.
#[derive(Config, Debug, PartialEq, Eq, Hash)]
pub enum InterpolationStrategy {
    /// Bilinear interpolation (inference only).
    Bilinear,
    /// Nearest interpolation (also differentiable in Burn).
    Nearest,
}

impl Default for InterpolationStrategy {
    fn default() -> Self {
        Self::Bilinear
    }
}

/// Defines the backbone architecture.
#[derive(Config, Debug, PartialEq, Eq, Hash)]
pub enum Backbone {
    /// Res2Net-50 v1b, 26w×4s.
    Res2Net50,
    /// Res2Net-101 v1b, 26w×4s.
    Res2Net101,
}

impl Default for Backbone {
    fn default() -> Self {
        Self::Res2Net101
    }
}

impl Backbone {
    /// Parses a backbone name such as `res2net101`.
    ///
    /// # Errors
    ///
    /// Returns `MdfraError::UnsupportedBackbone` for unknown names.
    pub fn from_name(name: &str) -> MdfraResult<Self> {
        match name.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "res2net50" => Ok(Self::Res2Net50),
            "res2net101" => Ok(Self::Res2Net101),
            _ => Err(MdfraError::UnsupportedBackbone {
                backbone: name.to_string(),
            }),
        }
    }
}

/// Normalization applied after a convolution in a [`ConvBlock`](crate::ConvBlock).
#[derive(Config, Debug, PartialEq, Eq, Hash)]
pub enum NormKind {
    /// No normalization.
    None,
    /// 2d batch normalization.
    Batch,
    /// Group normalization with 32 groups (or one per channel below 32 channels).
    Group,
}

impl Default for NormKind {
    fn default() -> Self {
        Self::Batch
    }
}
