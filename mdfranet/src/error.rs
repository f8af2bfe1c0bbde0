use thiserror::Error;

/// The error type for `MdfraNet-Burn` operations.
///
/// Covers the failures that can surface at the boundary of the library: configuration
/// validation, input checks before a forward pass, and weight binding.
#[derive(Error, Debug)]
pub enum MdfraError {
    /// Error for when an unsupported backbone network is specified.
    #[error("Unsupported backbone: {backbone}")]
    UnsupportedBackbone {
        /// The name of the unsupported backbone.
        backbone: String,
    },

    /// Error for when an invalid model configuration is provided.
    /// This can happen if configuration parameters are logically inconsistent.
    #[error("Invalid model configuration: {reason}")]
    InvalidConfiguration {
        /// The reason why the configuration is invalid.
        reason: String,
    },

    /// Error for when an input tensor has an invalid shape.
    #[error("Invalid input tensor shape: expected {expected}, got {actual}")]
    InvalidTensorShape {
        /// The expected tensor shape.
        expected: String,
        /// The actual tensor shape.
        actual: String,
    },

    /// Error for when loading model weights fails.
    #[error("Failed to load weights: {reason}")]
    WeightLoadingFailed {
        /// The reason for the weight loading failure.
        reason: String,
    },

    /// Error for when a weight file has an extension no recorder understands.
    #[error("Unsupported weight file format: {format}")]
    UnsupportedWeightFormat {
        /// The offending extension or file name.
        format: String,
    },
}

/// A specialized `Result` type for `MdfraNet-Burn` operations.
pub type MdfraResult<T> = Result<T, MdfraError>;
