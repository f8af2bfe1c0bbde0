//! Configuration for the MdfraNet front-ends.
//!
//! Both binaries accept an optional JSON file holding one of these structures;
//! command line arguments override its fields.

use std::path::PathBuf;

use mdfranet_burn::ModelConfig;
use serde::{Deserialize, Serialize};

/// Configuration for single-image inference.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// Model configuration. Defaults to the released checkpoint layout.
    pub model: ModelConfig,
    /// Square side the image is resized to before inference.
    pub image_size: u32,
    /// Directory receiving `mask.png` and `overlay.png`.
    pub output_dir: PathBuf,
    /// Key holding the state dict inside a PyTorch checkpoint, if nested.
    pub top_level_key: Option<String>,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            model: ModelConfig::released(),
            image_size: 352,
            output_dir: PathBuf::from("outputs"),
            top_level_key: None,
        }
    }
}

/// Configuration for checkpoint conversion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConverterConfig {
    /// Model configuration. Defaults to the released checkpoint layout.
    pub model: ModelConfig,
    /// Input checkpoint (.pth, .pt or .safetensors).
    pub input_path: PathBuf,
    /// Output Burn record (.mpk or .bin).
    pub output_path: PathBuf,
    /// Key holding the state dict inside a PyTorch checkpoint, if nested.
    pub top_level_key: Option<String>,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            model: ModelConfig::released(),
            input_path: PathBuf::from("MdfraNet-best.pth"),
            output_path: PathBuf::from("mdfranet.mpk"),
            top_level_key: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: InferenceConfig =
            serde_json::from_str(r#"{ "image_size": 256, "top_level_key": "state_dict" }"#)
                .unwrap();

        assert_eq!(config.image_size, 256);
        assert_eq!(config.top_level_key.as_deref(), Some("state_dict"));
        assert_eq!(config.output_dir, PathBuf::from("outputs"));
        assert_eq!(config.model.decoder.msmb_reduce_kernel, 3);
    }

    #[test]
    fn test_config_round_trips_through_json() {
        let config = ConverterConfig::default();

        let json = serde_json::to_string(&config).unwrap();
        let parsed: ConverterConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.output_path, config.output_path);
        assert!(parsed.model.decoder.head_output_activation);
    }
}
