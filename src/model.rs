//! Model backend selection.

use anyhow::Result;
use log::info;
use std::path::{Path, PathBuf};

use crate::archive::Archive;
use crate::config::{ExperimentConfig, ModelKind};
use crate::saliency::SegmentationModel;

/// Model file named by `test.model_file`, or the default inside the run directory
pub fn model_path(config: &ExperimentConfig, run_dir: &Path) -> PathBuf {
    if !config.test.model_file.is_empty() {
        return PathBuf::from(&config.test.model_file);
    }
    match config.model.kind {
        ModelKind::Archive => run_dir.join("archive"),
        ModelKind::Onnx => run_dir.join("best.onnx"),
    }
}

/// Load the backend named by `model.kind`
pub fn build_model(
    config: &ExperimentConfig,
    run_dir: &Path,
    device: &str,
) -> Result<Box<dyn SegmentationModel>> {
    let path = model_path(config, run_dir);
    info!("=> loading {} model from {}", config.model.name, path.display());

    match config.model.kind {
        ModelKind::Archive => Ok(Box::new(Archive::open(&path, config.model.key_prefix_len)?)),
        ModelKind::Onnx => load_onnx(config, &path, device),
    }
}

#[cfg(feature = "onnx")]
fn load_onnx(
    config: &ExperimentConfig,
    path: &Path,
    device: &str,
) -> Result<Box<dyn SegmentationModel>> {
    let logits_output = Some(config.model.logits_output.as_str()).filter(|s| !s.is_empty());
    Ok(Box::new(crate::onnx_model::OnnxModel::load(
        path,
        device,
        logits_output,
    )?))
}

#[cfg(not(feature = "onnx"))]
fn load_onnx(
    _config: &ExperimentConfig,
    path: &Path,
    _device: &str,
) -> Result<Box<dyn SegmentationModel>> {
    anyhow::bail!(
        "Cannot load ONNX model {}: segcam was built without the 'onnx' feature",
        path.display()
    )
}
