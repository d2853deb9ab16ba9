//! Output path generation for saliency heatmaps and their companions.
//!
//! Every query writes into a directory derived from the method, the layer and the
//! optional hierarchy node / class / crop size, with a filename derived from the
//! image index, the pixel and the optional suffix:
//!
//! ```text
//! {run_dir}/{method}_{layer}[_{node}][_cls{class}][_crop{size}]/image-{idx}[-pixel_i-{i}-pixel_j-{j}][-suffix-{s}].jpg
//! ```
//!
//! Sibling `_original` and `_overlap` directories hold the raw input crops and the
//! per-class overlap statistics.

use anyhow::{Context, Result};
use log::debug;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::pixels::Pixel;

/// Keys that always lead the filename, in this order
pub const FILENAME_ORDER: [&str; 3] = ["image", "pixel_i", "pixel_j"];

/// Layer name used for the product of all per-layer heatmaps
pub const COMBINED_LAYER: &str = "combined";

pub const ORIGINAL_SUFFIX: &str = "_original";
pub const OVERLAP_SUFFIX: &str = "_overlap";

const MODEL_PREFIX: &str = "model.";

/// Build (and create) the output directory for one method/layer combination
pub fn build_dir(
    base: &Path,
    method: &str,
    layer: &str,
    node_id: Option<&str>,
    cls: Option<&str>,
    crop_size: i32,
) -> Result<PathBuf> {
    let mut name = format!(
        "{}_{}",
        method.to_lowercase(),
        layer.replace(MODEL_PREFIX, "")
    );
    if let Some(node) = node_id {
        name.push_str(&format!("_{node}"));
    }
    if let Some(cls) = cls {
        name.push_str(&format!("_cls{cls}"));
    }
    if crop_size > 0 {
        name.push_str(&format!("_crop{crop_size}"));
    }

    let dir = base.join(name);
    create_dir(&dir)?;
    Ok(dir)
}

/// Render `key-value` pairs joined by `-`.
///
/// Keys listed in `order` come first, in that order; the rest follow sorted by
/// name.
pub fn build_filename(fields: &BTreeMap<String, String>, order: &[&str]) -> String {
    let leading = order
        .iter()
        .filter_map(|key| fields.get(*key).map(|value| (*key, value)));
    let trailing = fields
        .iter()
        .filter(|(key, _)| !order.contains(&key.as_str()))
        .map(|(key, value)| (key.as_str(), value));

    leading
        .chain(trailing)
        .map(|(key, value)| format!("{key}-{value}"))
        .collect::<Vec<_>>()
        .join("-")
}

/// `<dir>_original`, `<dir>_overlap` and friends; created on demand
pub fn sibling_dir(dir: &Path, suffix: &str) -> Result<PathBuf> {
    let mut name = dir.as_os_str().to_owned();
    name.push(suffix);
    let sibling = PathBuf::from(name);
    create_dir(&sibling)?;
    Ok(sibling)
}

fn create_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        debug!("Creating output directory {}", dir.display());
    }
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create output directory {}", dir.display()))
}

/// The fields identifying one saliency query in filenames
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryKey {
    pub image: usize,
    pub pixel: Option<Pixel>,
    pub suffix: Option<String>,
}

impl QueryKey {
    pub fn whole(image: usize, suffix: Option<&str>) -> Self {
        Self {
            image,
            pixel: None,
            suffix: suffix.filter(|s| !s.is_empty()).map(str::to_string),
        }
    }

    pub fn at_pixel(image: usize, pixel: Pixel, suffix: Option<&str>) -> Self {
        Self {
            pixel: Some(pixel),
            ..Self::whole(image, suffix)
        }
    }

    pub fn fields(&self) -> BTreeMap<String, String> {
        let mut fields = BTreeMap::new();
        fields.insert("image".to_string(), self.image.to_string());
        if let Some(pixel) = self.pixel {
            fields.insert("pixel_i".to_string(), pixel.row.to_string());
            fields.insert("pixel_j".to_string(), pixel.col.to_string());
        }
        if let Some(suffix) = &self.suffix {
            fields.insert("suffix".to_string(), suffix.clone());
        }
        fields
    }

    pub fn filename(&self) -> String {
        build_filename(&self.fields(), &FILENAME_ORDER)
    }
}

/// `{dir}/{filename}.{ext}`
pub fn save_path(dir: &Path, key: &QueryKey, ext: &str) -> PathBuf {
    dir.join(format!("{}.{ext}", key.filename()))
}

/// Directory naming shared by every layer of one run
#[derive(Debug, Clone)]
pub struct OutputLayout {
    pub base: PathBuf,
    pub method: String,
    pub class: Option<String>,
    pub crop_size: i32,
}

impl OutputLayout {
    pub fn new(base: impl Into<PathBuf>, method: &str, class: Option<&str>, crop_size: i32) -> Self {
        Self {
            base: base.into(),
            method: method.to_string(),
            class: class.map(str::to_string),
            crop_size,
        }
    }

    pub fn layer_dir(&self, layer: &str, node: Option<&str>) -> Result<PathBuf> {
        build_dir(
            &self.base,
            &self.method,
            layer,
            node,
            self.class.as_deref(),
            self.crop_size,
        )
    }

    pub fn combined_dir(&self, node: Option<&str>) -> Result<PathBuf> {
        self.layer_dir(COMBINED_LAYER, node)
    }
}
