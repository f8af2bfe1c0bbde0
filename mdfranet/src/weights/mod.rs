//! # Pretrained Weight Binding
//!
//! Loads published MdfraNet checkpoints into an [`MdfraNet`] built with
//! [`ModelConfig::released`](crate::ModelConfig::released).
//!
//! PyTorch (`.pt`/`.pth`) and SafeTensors checkpoints are bound by name. Their keys
//! are rewritten by [`key_remaps`] into the module paths of this crate before the
//! record is deserialized:
//!
//! - a `module.` wrapper prefix is stripped,
//! - the flat decoder attributes move under `decoder.`,
//! - `MSMB_N.mbconvB_I` becomes `decoder.msmb_N.branches.{B-1}.blocks.{I-1}`,
//! - `Sequential` indices and renamed leaves get their field names.
//!
//! Keys that match no field (BatchNorm counters, unused heads, the backbone classifier)
//! are ignored. Parameters a checkpoint does not carry keep the values the model was
//! initialised with, see [`PretrainedWeights::load_into`]. Burn's own `.mpk` and `.bin`
//! records load as they are.

mod binding;

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use burn::{
    module::Module,
    record::{
        serde::data::remap, BinFileRecorder, FullPrecisionSettings, NamedMpkFileRecorder,
        Recorder,
    },
    tensor::backend::Backend,
};
use burn_import::{
    pytorch::{LoadArgs as PyTorchLoadArgs, PyTorchFileRecorder},
    safetensors::{LoadArgs as SafetensorsLoadArgs, SafetensorsFileRecorder},
};
use candle_core::{pickle, safetensors, DType, Device as CandleDevice, Tensor as CandleTensor};
use regex::Regex;

pub use binding::{BindingReport, CheckpointTensor};

use crate::{
    error::{MdfraError, MdfraResult},
    models::{MdfraNet, MdfraNetRecord},
};

/// Supported weight file formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightFormat {
    /// PyTorch .pt or .pth files
    PyTorch,
    /// SafeTensors .safetensors files
    SafeTensors,
    /// Burn MessagePack .mpk files
    MessagePack,
    /// Burn Binary .bin files
    Binary,
}

impl WeightFormat {
    /// Detect format from file extension.
    ///
    /// # Errors
    ///
    /// Returns `MdfraError::UnsupportedWeightFormat` for unknown extensions.
    pub fn from_path(path: &Path) -> MdfraResult<Self> {
        match path.extension().and_then(|s| s.to_str()) {
            Some("pt") | Some("pth") => Ok(Self::PyTorch),
            Some("safetensors") => Ok(Self::SafeTensors),
            Some("mpk") => Ok(Self::MessagePack),
            Some("bin") => Ok(Self::Binary),
            _ => Err(MdfraError::UnsupportedWeightFormat {
                format: path.display().to_string(),
            }),
        }
    }
}

const MSMB_BLOCKS: usize = 3;

/// Key rewrites from checkpoint names to module paths, applied in order.
pub fn key_remaps() -> Vec<(String, String)> {
    let mut remaps: Vec<(String, String)> = [
        // DataParallel wrapper
        (r"^module\.(.+)", "$1"),
        // Res2Net deep stem
        (r"^resnet\.conv1\.0\.(.+)", "resnet.stem.conv1.$1"),
        (r"^resnet\.conv1\.1\.(.+)", "resnet.stem.bn1.$1"),
        (r"^resnet\.conv1\.3\.(.+)", "resnet.stem.conv2.$1"),
        (r"^resnet\.conv1\.4\.(.+)", "resnet.stem.bn2.$1"),
        (r"^resnet\.conv1\.6\.(.+)", "resnet.stem.conv3.$1"),
        (r"^resnet\.bn1\.(.+)", "resnet.stem.bn3.$1"),
        (r"^resnet\.layer([1-4])\.([0-9]+)\.(.+)", "resnet.layer$1.blocks.$2.$3"),
        (r"^(.+)\.downsample\.1\.(.+)", "$1.downsample.conv.$2"),
        (r"^(.+)\.downsample\.2\.(.+)", "$1.downsample.bn.$2"),
        // Decoder attributes
        (r"^(rfb[2-4]_1|agg1|esa|pca|apa)\.(.+)", "decoder.$1.$2"),
        (r"^MSMB_([1-3])\.(.+)", "decoder.msmb_$1.$2"),
        (r"^ra([1-3])_conv([1-3])\.(.+)", "decoder.ra$1.conv$2.$3"),
        // Attention blocks
        (r"^(.+)\.(ESAlayer|PCAlayer)\.(.+)", "$1.layer.$3"),
        (r"^(.+)\.to_out\.0\.(.+)", "$1.to_out.$2"),
        (r"^(.+)\.ff\.fn\.net\.0\.(.+)", "$1.ff.fc1.$2"),
        (r"^(.+)\.ff\.fn\.net\.3\.(.+)", "$1.ff.fc2.$2"),
        // APA
        (r"^decoder\.apa\.(skip|c[1-3])\.norm\.(.+)", "decoder.apa.$1.bn.$2"),
        (r"^decoder\.apa\.cn\.conv\.0\.(.+)", "decoder.apa.cn.conv.$1"),
        (r"^decoder\.apa\.sa\.conv2d\.(.+)", "decoder.apa.sa.conv.$1"),
        // PReLU slopes
        (r"^(.+)\.act\.weight$", "$1.act.alpha"),
    ]
    .into_iter()
    .map(|(pattern, replacement)| (pattern.to_string(), replacement.to_string()))
    .collect();

    for branch in 1..=MSMB_BLOCKS {
        for block in 1..=MSMB_BLOCKS {
            remaps.push((
                format!(r"^(decoder\.msmb_[1-3])\.mbconv{branch}_{block}\.(.+)"),
                format!("$1.branches.{}.blocks.{}.$2", branch - 1, block - 1),
            ));
        }
    }

    remaps
}

fn compiled_key_remaps() -> MdfraResult<Vec<(Regex, String)>> {
    key_remaps()
        .into_iter()
        .map(|(pattern, replacement)| {
            Regex::new(&pattern)
                .map(|regex| (regex, replacement))
                .map_err(|e| MdfraError::WeightLoadingFailed {
                    reason: format!("Invalid key remap {pattern}: {e}"),
                })
        })
        .collect()
}

/// A checkpoint on disk and how to read it.
#[derive(Debug, Clone)]
pub struct PretrainedWeights {
    path: PathBuf,
    format: WeightFormat,
    top_level_key: Option<String>,
}

impl PretrainedWeights {
    /// # Errors
    ///
    /// Returns an error if the file is missing or its format is unsupported.
    pub fn new(path: impl Into<PathBuf>) -> MdfraResult<Self> {
        let path = path.into();
        if !path.exists() {
            return Err(MdfraError::WeightLoadingFailed {
                reason: format!("Weight file not found: {}", path.display()),
            });
        }
        let format = WeightFormat::from_path(&path)?;

        Ok(Self {
            path,
            format,
            top_level_key: None,
        })
    }

    /// Read the state dict from under `key` (e.g. `state_dict`) of a PyTorch checkpoint.
    #[must_use]
    pub fn with_top_level_key(mut self, key: impl Into<String>) -> Self {
        self.top_level_key = Some(key.into());
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub const fn format(&self) -> WeightFormat {
        self.format
    }

    /// Deserialize the checkpoint into an `MdfraNet` record.
    ///
    /// Every parameter of the model must be present in the checkpoint.
    ///
    /// # Errors
    ///
    /// Returns `MdfraError::WeightLoadingFailed` if the file cannot be read or a
    /// parameter of the model is absent from it.
    pub fn load_record<B: Backend>(&self, device: &B::Device) -> MdfraResult<MdfraNetRecord<B>> {
        tracing::debug!(
            path = %self.path.display(),
            format = ?self.format,
            "binding MdfraNet weights"
        );

        let record = match self.format {
            WeightFormat::PyTorch => {
                let mut args = PyTorchLoadArgs::new(self.path.clone());
                for (pattern, replacement) in key_remaps() {
                    args = args.with_key_remap(&pattern, &replacement);
                }
                if let Some(key) = &self.top_level_key {
                    args = args.with_top_level_key(key);
                }
                PyTorchFileRecorder::<FullPrecisionSettings>::default()
                    .load(args, device)
                    .map_err(|e| load_error("PyTorch", e))?
            }
            WeightFormat::SafeTensors => {
                let mut args = SafetensorsLoadArgs::new(self.path.clone());
                for (pattern, replacement) in key_remaps() {
                    args = args.with_key_remap(&pattern, &replacement);
                }
                SafetensorsFileRecorder::<FullPrecisionSettings>::default()
                    .load(args, device)
                    .map_err(|e| load_error("Safetensors", e))?
            }
            WeightFormat::MessagePack => NamedMpkFileRecorder::<FullPrecisionSettings>::new()
                .load(self.path.clone(), device)
                .map_err(|e| load_error("MessagePack", e))?,
            WeightFormat::Binary => BinFileRecorder::<FullPrecisionSettings>::new()
                .load(self.path.clone(), device)
                .map_err(|e| load_error("Binary", e))?,
        };

        tracing::debug!(path = %self.path.display(), "weights bound");
        Ok(record)
    }

    /// Load the checkpoint into `model`.
    ///
    /// PyTorch and SafeTensors checkpoints may be partial: parameters they do not
    /// carry keep the values `model` already holds, and a warning says how many.
    /// Burn records must be complete. Use [`PretrainedWeights::load_record`] to
    /// require every parameter.
    ///
    /// # Errors
    ///
    /// Returns `MdfraError::WeightLoadingFailed` if the file cannot be read or a
    /// checkpoint tensor has a different shape than the parameter it names.
    pub fn load_into<B: Backend>(
        &self,
        model: MdfraNet<B>,
        device: &B::Device,
    ) -> MdfraResult<MdfraNet<B>> {
        match self.format {
            WeightFormat::MessagePack | WeightFormat::Binary => {
                Ok(model.load_record(self.load_record(device)?))
            }
            WeightFormat::PyTorch | WeightFormat::SafeTensors => {
                Ok(self.bind_into(model, device)?.0)
            }
        }
    }

    /// Bind whatever the checkpoint carries onto `model`, leaving the rest as it is.
    ///
    /// # Errors
    ///
    /// See [`PretrainedWeights::load_into`]. Burn records are rejected with
    /// `MdfraError::UnsupportedWeightFormat`.
    pub fn bind_into<B: Backend>(
        &self,
        model: MdfraNet<B>,
        device: &B::Device,
    ) -> MdfraResult<(MdfraNet<B>, BindingReport)> {
        let tensors = self.read_tensors()?;
        let (model, report) = binding::bind::<B, _>(model, tensors, device)?;

        if report.missing.is_empty() {
            tracing::debug!(bound = report.bound, unused = report.unused.len(), "weights bound");
        } else {
            tracing::warn!(
                path = %self.path.display(),
                bound = report.bound,
                missing = report.missing.len(),
                first_missing = %report.missing[0],
                "checkpoint is partial, missing parameters keep their initial values"
            );
        }
        Ok((model, report))
    }

    /// Read every tensor of a PyTorch or SafeTensors checkpoint, keyed by module path.
    fn read_tensors(&self) -> MdfraResult<HashMap<String, CheckpointTensor>> {
        let tensors: HashMap<String, CandleTensor> = match self.format {
            WeightFormat::PyTorch => {
                pickle::read_all_with_key(&self.path, self.top_level_key.as_deref())
                    .map_err(|e| load_error("PyTorch", e))?
                    .into_iter()
                    .collect()
            }
            WeightFormat::SafeTensors => safetensors::load(&self.path, &CandleDevice::Cpu)
                .map_err(|e| load_error("Safetensors", e))?,
            WeightFormat::MessagePack | WeightFormat::Binary => {
                return Err(MdfraError::UnsupportedWeightFormat {
                    format: format!("{} (Burn records load whole)", self.path.display()),
                })
            }
        };

        let (tensors, _) = remap(tensors, compiled_key_remaps()?);
        tensors
            .into_iter()
            .map(|(key, tensor)| {
                let converted = checkpoint_tensor(&tensor)
                    .map_err(|e| load_error(&format!("Tensor {key}"), e))?;
                Ok((key, converted))
            })
            .collect()
    }
}

fn checkpoint_tensor(tensor: &CandleTensor) -> candle_core::Result<CheckpointTensor> {
    Ok(CheckpointTensor {
        shape: tensor.dims().to_vec(),
        values: tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?,
    })
}

fn load_error(format: &str, error: impl std::fmt::Display) -> MdfraError {
    MdfraError::WeightLoadingFailed {
        reason: format!("{format} record loading failed: {error}"),
    }
}

/// Save `model` as a Burn record, choosing the recorder from the extension of `path`.
///
/// # Errors
///
/// Returns `MdfraError::UnsupportedWeightFormat` unless `path` ends in `.mpk` or `.bin`,
/// and `MdfraError::WeightLoadingFailed` if writing fails.
pub fn save_weights<B: Backend>(model: MdfraNet<B>, path: &Path) -> MdfraResult<()> {
    let result = match WeightFormat::from_path(path)? {
        WeightFormat::MessagePack => model.save_file(
            path.to_path_buf(),
            &NamedMpkFileRecorder::<FullPrecisionSettings>::new(),
        ),
        WeightFormat::Binary => {
            model.save_file(path.to_path_buf(), &BinFileRecorder::<FullPrecisionSettings>::new())
        }
        WeightFormat::PyTorch | WeightFormat::SafeTensors => {
            return Err(MdfraError::UnsupportedWeightFormat {
                format: format!("{} (only .mpk and .bin can be written)", path.display()),
            })
        }
    };

    result.map_err(|e| MdfraError::WeightLoadingFailed {
        reason: format!("Failed to save {}: {e}", path.display()),
    })?;
    tracing::info!(path = %path.display(), "weights saved");
    Ok(())
}
