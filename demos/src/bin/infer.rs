//! MdfraNet Single-Image Inference
//!
//! Segments one image and writes `mask.png` (min-max scaled probabilities) and
//! `overlay.png` (foreground painted red) to the output directory, then prints a JSON
//! line with both paths on stdout.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --release --bin infer -- MdfraNet-best.pth image.jpg --output outputs/
//!
//! # Nested state dict, custom input size
//! cargo run --release --bin infer -- ckpt.pth image.jpg --top-level-key state_dict --image-size 384
//!
//! # Res2Net-50 encoder
//! cargo run --release --bin infer -- MdfraNet-r50.pth image.jpg --backbone res2net50
//! ```

use std::{
    fs,
    path::{Path, PathBuf},
    time::Instant,
};

use anyhow::{Context, Result};
use burn::tensor::activation::sigmoid;
use clap::Parser;
use mdfranet_burn::{
    models::modules::resize_to, Backbone, InterpolationStrategy, MdfraNet, MdfraNetConfig,
    PretrainedWeights,
};
use mdfranet_demos::{
    common::{create_device, init_tracing, ImageUtils, SelectedBackend, SelectedDevice, BACKEND_NAME},
    InferenceConfig,
};
use serde::Serialize;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Model weights (.pth, .pt, .safetensors, .mpk or .bin)
    weights: PathBuf,

    /// Input image
    image: PathBuf,

    /// Output directory for mask.png and overlay.png
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Square side the image is resized to before inference
    #[arg(long)]
    image_size: Option<u32>,

    /// Key holding the state dict inside a PyTorch checkpoint
    #[arg(long)]
    top_level_key: Option<String>,

    /// Encoder variant (res2net50 or res2net101)
    #[arg(long)]
    backbone: Option<String>,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,
}

/// The line printed on success.
#[derive(Serialize)]
struct InferenceReport {
    mask_path: String,
    overlay_path: String,
}

fn main() -> Result<()> {
    init_tracing("info");
    let args = Args::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        let config_str = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;
        serde_json::from_str::<InferenceConfig>(&config_str)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?
    } else {
        InferenceConfig::default()
    };

    // Apply command line overrides
    if let Some(output) = args.output {
        config.output_dir = output;
    }
    if let Some(size) = args.image_size {
        config.image_size = size;
    }
    if args.top_level_key.is_some() {
        config.top_level_key = args.top_level_key;
    }
    if let Some(name) = &args.backbone {
        config.model.backbone.backbone = Backbone::from_name(name)?;
    }
    config.model.image_size = config.image_size as usize;

    let device = create_device();
    tracing::info!(backend = BACKEND_NAME, "starting inference");

    let model = load_model(&args.weights, &config, &device)?;

    fs::create_dir_all(&config.output_dir).with_context(|| {
        format!("Failed to create output directory: {}", config.output_dir.display())
    })?;

    let report = segment(&model, &args.image, &config, &device)?;
    println!("{}", serde_json::to_string(&report)?);

    Ok(())
}

/// Build the model and bind the checkpoint.
fn load_model(
    weights: &Path,
    config: &InferenceConfig,
    device: &SelectedDevice,
) -> Result<MdfraNet<SelectedBackend>> {
    let model = MdfraNetConfig::new(config.model.clone())
        .init::<SelectedBackend>(device)
        .context("Failed to initialize model")?;

    let mut weights = PretrainedWeights::new(weights)?;
    if let Some(key) = &config.top_level_key {
        weights = weights.with_top_level_key(key.clone());
    }

    let start = Instant::now();
    let model = weights.load_into(model, device)?;
    tracing::info!(
        path = %weights.path().display(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "weights loaded"
    );

    Ok(model)
}

/// Run one image through the model and write the mask and overlay.
fn segment(
    model: &MdfraNet<SelectedBackend>,
    image_path: &Path,
    config: &InferenceConfig,
    device: &SelectedDevice,
) -> Result<InferenceReport> {
    let img = image::open(image_path)
        .with_context(|| format!("Failed to open image: {}", image_path.display()))?;
    let original = img.to_rgb8();
    let (width, height) = original.dimensions();

    let input = ImageUtils::preprocess::<SelectedBackend>(&img, config.image_size, device);

    let start = Instant::now();
    let output = model.forward(input)?;
    let logits = resize_to(
        output.fused(),
        [height as usize, width as usize],
        &InterpolationStrategy::Bilinear,
    );
    let probability = sigmoid(logits);
    tracing::info!(
        image = %image_path.display(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "forward pass finished"
    );

    let mask = ImageUtils::probability_to_mask(probability)?;
    let overlay = ImageUtils::red_overlay(&original, &mask);

    let mask_path = config.output_dir.join("mask.png");
    let overlay_path = config.output_dir.join("overlay.png");
    mask.save(&mask_path)
        .with_context(|| format!("Failed to save image: {}", mask_path.display()))?;
    overlay
        .save(&overlay_path)
        .with_context(|| format!("Failed to save image: {}", overlay_path.display()))?;

    Ok(InferenceReport {
        mask_path: display_path(&mask_path),
        overlay_path: display_path(&overlay_path),
    })
}

/// Path with forward slashes for the JSON report.
fn display_path(path: &Path) -> String {
    path.display().to_string().replace('\\', "/")
}
