//! MdfraNet Checkpoint Converter
//!
//! Binds a PyTorch (or SafeTensors) MdfraNet checkpoint and writes it back as a Burn
//! record, so later runs skip the name translation.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --release --bin converter -- MdfraNet-best.pth mdfranet.mpk
//!
//! # Check the converted record with a forward pass
//! cargo run --release --bin converter -- MdfraNet-best.pth mdfranet.mpk --validate
//!
//! # Refuse checkpoints that leave any parameter unset
//! cargo run --release --bin converter -- MdfraNet-best.pth mdfranet.mpk --strict
//! ```

use std::{fs, path::PathBuf};

use anyhow::{Context, Result};
use burn::prelude::*;
use clap::Parser;
use mdfranet_burn::{save_weights, Backbone, MdfraNet, MdfraNetConfig, PretrainedWeights};
use mdfranet_demos::{
    common::{create_device, init_tracing, SelectedBackend, SelectedDevice, BACKEND_NAME},
    ConverterConfig,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Input checkpoint (.pth, .pt or .safetensors)
    input: PathBuf,

    /// Output Burn record (.mpk or .bin)
    output: PathBuf,

    /// Key holding the state dict inside a PyTorch checkpoint
    #[arg(long)]
    top_level_key: Option<String>,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Encoder variant (res2net50 or res2net101)
    #[arg(long)]
    backbone: Option<String>,

    /// Fail unless the checkpoint carries every parameter of the model
    #[arg(long)]
    strict: bool,

    /// Validate conversion by reloading the record and running a forward pass
    #[arg(long)]
    validate: bool,

    /// Force overwrite output file
    #[arg(long)]
    force: bool,
}

fn main() -> Result<()> {
    init_tracing("info");
    let args = Args::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        let config_str = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;
        serde_json::from_str::<ConverterConfig>(&config_str)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?
    } else {
        ConverterConfig::default()
    };

    // Apply command line overrides
    config.input_path = args.input;
    config.output_path = args.output;
    if args.top_level_key.is_some() {
        config.top_level_key = args.top_level_key;
    }
    if let Some(name) = &args.backbone {
        config.model.backbone.backbone = Backbone::from_name(name)?;
    }

    if config.output_path.exists() && !args.force {
        anyhow::bail!(
            "Output file already exists: {}. Use --force to overwrite.",
            config.output_path.display()
        );
    }

    let device = create_device();
    tracing::info!(
        backend = BACKEND_NAME,
        input = %config.input_path.display(),
        output = %config.output_path.display(),
        "converting checkpoint"
    );

    let model = build_model(&config, &device)?;
    let mut weights = PretrainedWeights::new(&config.input_path)?;
    if let Some(key) = &config.top_level_key {
        weights = weights.with_top_level_key(key.clone());
    }
    let model = if args.strict {
        model.load_record(weights.load_record(&device)?)
    } else {
        weights.load_into(model, &device)?
    };
    save_weights(model, &config.output_path)?;

    if args.validate {
        validate_conversion(&config, &device)?;
    }

    tracing::info!("model conversion completed");
    Ok(())
}

fn build_model(config: &ConverterConfig, device: &SelectedDevice) -> Result<MdfraNet<SelectedBackend>> {
    MdfraNetConfig::new(config.model.clone())
        .init::<SelectedBackend>(device)
        .context("Failed to initialize model")
}

/// Reload the written record and check the outputs of two identical forward passes.
fn validate_conversion(config: &ConverterConfig, device: &SelectedDevice) -> Result<()> {
    let model = PretrainedWeights::new(&config.output_path)?
        .load_into(build_model(config, device)?, device)?;

    let size = config.model.image_size;
    let input = Tensor::<SelectedBackend, 4>::random(
        [1, 3, size, size],
        burn::tensor::Distribution::Normal(0.0, 1.0),
        device,
    );

    let first = model.forward(input.clone())?.fused();
    let second = model.forward(input)?.fused();

    let dims = first.dims();
    if dims != [1, 1, size, size] {
        anyhow::bail!("Expected output shape [1, 1, {size}, {size}], got {dims:?}");
    }

    let max_diff: f32 = (first.clone() - second).abs().max().into_scalar().elem();
    if max_diff > 1e-6 {
        anyhow::bail!("Repeated forward passes differ by {max_diff:.6}");
    }

    let min_val: f32 = first.clone().min().into_scalar().elem();
    let max_val: f32 = first.clone().max().into_scalar().elem();
    let mean_val: f32 = first.mean().into_scalar().elem();
    if !(min_val.is_finite() && max_val.is_finite() && mean_val.is_finite()) {
        anyhow::bail!("Model output contains NaN or infinite values");
    }

    tracing::info!(min = min_val, max = max_val, mean = mean_val, "validation passed");
    Ok(())
}
