//! Tensor-archive model backend.
//!
//! An archive is a directory of tensors dumped by the training framework:
//!
//! ```text
//! archive/
//!   manifest.toml                       layers = ["layer1", ...]
//!   image-{idx}/logits.npy              (C, h, w)
//!   image-{idx}/activations/{key}.npy   (K, h', w')
//!   image-{idx}/gradients[/node-{wnid}]/{target}/{key}.npy
//! ```
//!
//! `{target}` is `whole`, `pixel_i-{r}-pixel_j-{c}` or `segment_i-{r}-segment_j-{c}`
//! in output coordinates. Tensor keys carry the fixed-length module prefix of the
//! checkpoint they were dumped from; it is stripped before matching requested
//! layer names, and keys that match nothing are skipped.

use anyhow::{ensure, Context, Result};
use log::{debug, info};
use ndarray::Array3;
use ndarray_npy::read_npy;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::dataset::Sample;
use crate::saliency::{GradientQuery, SegmentationModel};

/// Length of the `model.` prefix in dumped keys
pub const DEFAULT_KEY_PREFIX_LEN: usize = 6;

pub const MANIFEST_FILE: &str = "manifest.toml";

#[derive(Debug, Deserialize)]
struct Manifest {
    layers: Vec<String>,
}

/// Keep the entries whose key, minus its first `prefix_len` characters, is wanted.
///
/// Returns stripped key -> value. Entries that match nothing are ignored.
pub fn match_prefixed_keys<V>(
    entries: impl IntoIterator<Item = (String, V)>,
    wanted: &[String],
    prefix_len: usize,
) -> HashMap<String, V> {
    let mut matched = HashMap::new();
    for (key, value) in entries {
        match key.get(prefix_len..) {
            Some(stripped) if wanted.iter().any(|w| w == stripped) => {
                debug!("=> loading {stripped} from {key}");
                matched.insert(stripped.to_string(), value);
            }
            _ => debug!("Ignoring unmatched tensor {key}"),
        }
    }
    matched
}

/// `.npy` files of a directory as (file stem, path)
fn npy_entries(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let read = std::fs::read_dir(dir)
        .with_context(|| format!("Missing archive directory {}", dir.display()))?;

    let mut entries = Vec::new();
    for entry in read {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("npy") {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            entries.push((stem.to_string(), path.clone()));
        }
    }
    entries.sort();
    Ok(entries)
}

fn load_tensor(path: &Path) -> Result<Array3<f32>> {
    read_npy(path).with_context(|| format!("Failed to read tensor {}", path.display()))
}

pub struct Archive {
    root: PathBuf,
    layers: Vec<String>,
    key_prefix_len: usize,
    current: Option<usize>,
    activations: HashMap<String, Array3<f32>>,
}

impl Archive {
    pub fn open(root: &Path, key_prefix_len: usize) -> Result<Self> {
        let manifest_path = root.join(MANIFEST_FILE);
        let content = std::fs::read_to_string(&manifest_path)
            .with_context(|| format!("Failed to read archive manifest {}", manifest_path.display()))?;
        let manifest: Manifest = toml::from_str(&content)
            .with_context(|| format!("Invalid archive manifest {}", manifest_path.display()))?;
        ensure!(
            !manifest.layers.is_empty(),
            "Archive manifest {} lists no layers",
            manifest_path.display()
        );

        info!(
            "=> loading model archive from {} ({} layers)",
            root.display(),
            manifest.layers.len()
        );
        Ok(Self {
            root: root.to_path_buf(),
            layers: manifest.layers,
            key_prefix_len,
            current: None,
            activations: HashMap::new(),
        })
    }

    fn image_dir(&self, index: usize) -> PathBuf {
        self.root.join(format!("image-{index}"))
    }

    fn gradient_dir(&self, index: usize, query: &GradientQuery) -> PathBuf {
        let mut dir = self.image_dir(index).join("gradients");
        if let Some(wnid) = query.head.node_wnid() {
            dir = dir.join(format!("node-{wnid}"));
        }
        dir.join(query.target.key())
    }
}

impl SegmentationModel for Archive {
    fn layer_names(&self) -> Vec<String> {
        self.layers.clone()
    }

    fn forward(&mut self, sample: &Sample) -> Result<Array3<f32>> {
        let dir = self.image_dir(sample.index);
        let logits = load_tensor(&dir.join("logits.npy"))?;

        let entries = npy_entries(&dir.join("activations"))?;
        let matched = match_prefixed_keys(entries, &self.layers, self.key_prefix_len);
        self.activations.clear();
        for (layer, path) in matched {
            self.activations.insert(layer, load_tensor(&path)?);
        }
        debug!(
            "Loaded logits {:?} and {} activations for image {}",
            logits.dim(),
            self.activations.len(),
            sample.index
        );

        self.current = Some(sample.index);
        Ok(logits)
    }

    fn activation(&self, layer: &str) -> Result<Array3<f32>> {
        self.activations
            .get(layer)
            .cloned()
            .with_context(|| format!("Archive has no activation for layer {layer}"))
    }

    fn gradient(&mut self, layer: &str, query: &GradientQuery) -> Result<Array3<f32>> {
        let index = self.current.context("No forward pass has been run")?;
        let dir = self.gradient_dir(index, query);
        let entries = npy_entries(&dir)?;
        let wanted = [layer.to_string()];
        let mut matched = match_prefixed_keys(entries, &wanted, self.key_prefix_len);
        let path = matched
            .remove(layer)
            .with_context(|| format!("Missing gradient for layer {layer} in {}", dir.display()))?;
        load_tensor(&path)
    }
}
