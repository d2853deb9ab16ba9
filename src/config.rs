//! Configuration layer separating CLI arguments from the internal run configuration.
//!
//! Two sources feed a run:
//! - `GlobalArgs` / `VisCommand`: command-line flags, converted and validated into
//!   `RunOptions` by `RunOptions::from_args`
//! - `ExperimentConfig`: the TOML experiment file, with trailing `KEY VALUE`
//!   overrides such as `dataset.root /data/cityscapes`
//!
//! Every experiment key has a default, so a config file only needs the keys it
//! changes. Unknown keys are rejected.

use anyhow::{bail, ensure, Context, Result};
use clap::Parser;
use clap_verbosity_flag::Verbosity;
use log::warn;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::archive::DEFAULT_KEY_PREFIX_LEN;
use crate::dataset::DatasetKind;
use crate::heatmap::{BlendMode, ColorMap, HeatmapStyle};
use crate::pixels::{AxisSpec, IndexRange, PixelSpec};
use crate::saliency::SaliencyMethod;

/// Parse a `START END STEP` triple into a range
pub fn parse_range(values: &[usize]) -> Result<IndexRange, String> {
    IndexRange::from_triple(values).map_err(|e| e.to_string())
}

/// Global CLI arguments
#[derive(Parser, Debug, Clone)]
pub struct GlobalArgs {
    /// Verbosity level (-q/--quiet, -v/-vv/-vvv/-vvvv for info/debug/trace)
    #[command(flatten)]
    pub verbosity: Verbosity,

    /// Device to use for ONNX inference (auto, cpu, cuda)
    #[arg(long, default_value = "auto")]
    pub device: String,

    /// Disable colored output (also respects NO_COLOR and SEGCAM_NO_COLOR env vars)
    #[arg(long)]
    pub no_color: bool,
}

/// Saliency visualization arguments
#[derive(Parser, Debug, Clone)]
pub struct VisCommand {
    /// Experiment configuration file
    #[arg(long)]
    pub cfg: PathBuf,

    /// Type of gradient visualization
    #[arg(long, value_enum, default_value = "GradCAM")]
    pub vis_mode: SaliencyMethod,

    /// Index of the input image
    #[arg(long, default_value_t = 0)]
    pub image_index: usize,

    /// Image indices as [START, END) and STEP
    #[arg(long, num_args = 3, value_names = ["START", "END", "STEP"])]
    pub image_index_range: Option<Vec<usize>>,

    /// Size of crop around the center pixel (disabled when <= 0)
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    pub crop_size: i32,

    /// Maximum number of pixels to randomly sample from an image when fetching all pixels of a class
    #[arg(long, default_value_t = 10)]
    pub pixel_max_num_random: usize,

    /// Row coordinates of the query pixels
    #[arg(long, num_args = 0..)]
    pub pixel_i: Vec<usize>,

    /// Column coordinates of the query pixels
    #[arg(long, num_args = 0..)]
    pub pixel_j: Vec<usize>,

    /// Row range as [START, END) and STEP
    #[arg(long, num_args = 3, value_names = ["START", "END", "STEP"])]
    pub pixel_i_range: Option<Vec<usize>>,

    /// Column range as [START, END) and STEP
    #[arg(long, num_args = 3, value_names = ["START", "END", "STEP"])]
    pub pixel_j_range: Option<Vec<usize>>,

    /// Query every combination of rows and columns instead of zipping them
    #[arg(long)]
    pub pixel_cartesian_product: bool,

    /// Appended to each image filename
    #[arg(long, default_value = "")]
    pub suffix: String,

    /// Comma-separated target layers (default: the model's last layer)
    #[arg(long, value_delimiter = ',')]
    pub target_layers: Vec<String>,

    /// Class NAME; visualizes every hierarchy node on the path to its leaf
    #[arg(long, value_name = "CLASS")]
    pub nbdt_node_wnids_for: Option<String>,

    /// Class NAME; queries pixels of this class and crops around them
    #[arg(long, value_name = "CLASS")]
    pub crop_for: Option<String>,

    /// Hierarchy node ids whose logits are explained
    #[arg(long, num_args = 0..)]
    pub nbdt_node_wnid: Vec<String>,

    /// Don't save the npy files
    #[arg(long)]
    pub skip_save_npy: bool,

    /// Alpha-blend the heatmap by saliency instead of averaging it with the image
    #[arg(long)]
    pub paper_cmap: bool,

    /// Heatmap color palette
    #[arg(long, value_enum, default_value_t = ColorMap::Hot)]
    pub colormap: ColorMap,

    /// Config overrides as KEY VALUE pairs, e.g. dataset.root /data (after `--` when they follow a list flag)
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "KEY VALUE")]
    pub opts: Vec<String>,
}

/// Internal configuration for a visualization run
#[derive(Debug, Clone, Serialize)]
pub struct RunOptions {
    pub cfg: PathBuf,
    pub method: SaliencyMethod,
    pub image_index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_index_range: Option<IndexRange>,
    pub crop_size: i32,
    pub pixel_max_num_random: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pixels: Option<PixelSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suffix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_layers: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nbdt_node_wnids_for: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crop_for: Option<String>,
    pub nbdt_node_wnids: Vec<String>,
    pub save_npy: bool,
    pub style: HeatmapStyle,
    pub device: String,
    pub overrides: Vec<String>,
}

impl RunOptions {
    /// Create the run configuration from global args and command args
    pub fn from_args(global: &GlobalArgs, cmd: VisCommand) -> Result<Self, String> {
        let image_index_range = cmd
            .image_index_range
            .as_deref()
            .map(parse_range)
            .transpose()?;
        let row_range = cmd.pixel_i_range.as_deref().map(parse_range).transpose()?;
        let col_range = cmd.pixel_j_range.as_deref().map(parse_range).transpose()?;

        let rows = AxisSpec::resolve("i", &cmd.pixel_i, row_range).map_err(|e| e.to_string())?;
        let cols = AxisSpec::resolve("j", &cmd.pixel_j, col_range).map_err(|e| e.to_string())?;

        let whole_image = cmd.vis_mode.whole_image();
        if whole_image && (rows.is_some() || cols.is_some()) {
            return Err(
                "The \"Whole\" saliency method generates one map for the whole image, not for specific pixels"
                    .to_string(),
            );
        }

        let pixels = match (rows, cols) {
            (Some(rows), Some(cols)) => {
                if cmd.crop_for.is_some() {
                    warn!("Ignoring explicit pixels because --crop-for selects them");
                }
                Some(PixelSpec {
                    rows,
                    cols,
                    cartesian: cmd.pixel_cartesian_product,
                })
            }
            (rows, cols) => {
                if !whole_image && cmd.crop_for.is_none() {
                    let missing = if rows.is_none() { "i" } else { "j" };
                    return Err(format!(
                        "Must specify --pixel-{missing} or --pixel-{missing}-range (or select pixels with --crop-for)"
                    ));
                }
                None
            }
        };

        if whole_image && cmd.crop_size > 0 && cmd.crop_for.is_none() {
            return Err(
                "Cropping a whole-image map needs --crop-for to choose the crop centers".to_string(),
            );
        }

        if cmd.opts.len() % 2 != 0 {
            return Err(format!(
                "Config overrides must be KEY VALUE pairs, got {} values",
                cmd.opts.len()
            ));
        }

        let blend = if cmd.paper_cmap {
            BlendMode::Paper
        } else {
            BlendMode::Average
        };

        Ok(Self {
            cfg: cmd.cfg,
            method: cmd.vis_mode,
            image_index: cmd.image_index,
            image_index_range,
            crop_size: cmd.crop_size,
            pixel_max_num_random: cmd.pixel_max_num_random,
            pixels,
            suffix: Some(cmd.suffix).filter(|s| !s.is_empty()),
            target_layers: Some(cmd.target_layers).filter(|layers| !layers.is_empty()),
            nbdt_node_wnids_for: cmd.nbdt_node_wnids_for,
            crop_for: cmd.crop_for,
            nbdt_node_wnids: cmd.nbdt_node_wnid,
            save_npy: !cmd.skip_save_npy,
            style: HeatmapStyle {
                colormap: cmd.colormap,
                blend,
            },
            device: global.device.clone(),
            overrides: cmd.opts,
        })
    }

    /// Class name used in directory names
    pub fn class_suffix(&self) -> Option<&str> {
        self.crop_for
            .as_deref()
            .or(self.nbdt_node_wnids_for.as_deref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    /// Directory of dumped logits, activations and gradients
    #[default]
    Archive,
    /// ONNX graph run with ONNX Runtime
    Onnx,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModelSection {
    pub kind: ModelKind,
    pub name: String,
    /// Characters stripped from tensor keys before matching layer names
    pub key_prefix_len: usize,
    /// ONNX output holding the class logits (empty: first output)
    pub logits_output: String,
}

impl Default for ModelSection {
    fn default() -> Self {
        Self {
            kind: ModelKind::Archive,
            name: "seg_hrnet".to_string(),
            key_prefix_len: DEFAULT_KEY_PREFIX_LEN,
            logits_output: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatasetSection {
    pub dataset: DatasetKind,
    pub root: String,
    pub test_set: String,
    pub num_classes: usize,
}

impl Default for DatasetSection {
    fn default() -> Self {
        Self {
            dataset: DatasetKind::Cityscapes,
            root: "data/".to_string(),
            test_set: "list/cityscapes/val.lst".to_string(),
            num_classes: 19,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TestSection {
    /// [width, height]
    pub image_size: [usize; 2],
    /// Model file or archive directory (empty: inside the run directory)
    pub model_file: String,
}

impl Default for TestSection {
    fn default() -> Self {
        Self {
            image_size: [2048, 1024],
            model_file: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NbdtSection {
    pub use_nbdt: bool,
    /// Node-link JSON graph of the induced hierarchy
    pub hierarchy: String,
    /// Leaf ids in class order, one per line (empty: leaf order of the graph)
    pub wnids: String,
}

/// The experiment file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExperimentConfig {
    pub output_dir: String,
    pub model: ModelSection,
    pub dataset: DatasetSection,
    pub test: TestSection,
    pub nbdt: NbdtSection,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            output_dir: "output".to_string(),
            model: ModelSection::default(),
            dataset: DatasetSection::default(),
            test: TestSection::default(),
            nbdt: NbdtSection::default(),
        }
    }
}

impl ExperimentConfig {
    /// Load a TOML experiment file and apply `KEY VALUE` overrides
    pub fn load(path: &Path, overrides: &[String]) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let file: toml::Table = toml::from_str(&content)
            .with_context(|| format!("Invalid TOML in {}", path.display()))?;

        let mut merged = toml::Value::try_from(Self::default())?;
        merge_table(&mut merged, toml::Value::Table(file), "")?;
        apply_overrides(&mut merged, overrides)?;

        merged
            .try_into()
            .with_context(|| format!("Invalid experiment config {}", path.display()))
    }

    /// (height, width) of test images
    pub fn test_size(&self) -> (usize, usize) {
        (self.test.image_size[1], self.test.image_size[0])
    }

    pub fn dataset_name(&self) -> &'static str {
        match self.dataset.dataset {
            DatasetKind::Cityscapes => "cityscapes",
        }
    }

    /// `{output_dir}/{dataset}/{cfg stem}`
    pub fn run_dir(&self, cfg_path: &Path) -> PathBuf {
        let stem = cfg_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("experiment");
        Path::new(&self.output_dir)
            .join(self.dataset_name())
            .join(stem)
    }
}

fn merge_table(base: &mut toml::Value, incoming: toml::Value, prefix: &str) -> Result<()> {
    match (base, incoming) {
        (toml::Value::Table(base), toml::Value::Table(incoming)) => {
            for (key, value) in incoming {
                let normalized = key.to_lowercase();
                let path = if prefix.is_empty() {
                    normalized.clone()
                } else {
                    format!("{prefix}.{normalized}")
                };
                let Some(slot) = base.get_mut(&normalized) else {
                    bail!("Unknown config key '{path}'");
                };
                merge_table(slot, value, &path)?;
            }
            Ok(())
        }
        (base, incoming) => {
            *base = incoming;
            Ok(())
        }
    }
}

/// Parse an override value with the type of the value it replaces
fn parse_override(raw: &str, current: &toml::Value) -> toml::Value {
    if current.is_str() {
        return toml::Value::String(raw.to_string());
    }
    let parsed = toml::from_str::<toml::Table>(&format!("value = {raw}"))
        .ok()
        .and_then(|mut table| table.remove("value"));
    match (parsed, current) {
        (Some(toml::Value::Integer(i)), toml::Value::Float(_)) => toml::Value::Float(i as f64),
        (Some(value), _) => value,
        (None, _) => toml::Value::String(raw.to_string()),
    }
}

/// Apply dotted `KEY VALUE` pairs, e.g. `test.image_size [1024,512]`
pub fn apply_overrides(config: &mut toml::Value, overrides: &[String]) -> Result<()> {
    ensure!(
        overrides.len() % 2 == 0,
        "Config overrides must be KEY VALUE pairs, got {} values",
        overrides.len()
    );

    for pair in overrides.chunks(2) {
        let (key, raw) = (pair[0].to_lowercase(), &pair[1]);
        let mut slot = &mut *config;
        for part in key.split('.') {
            slot = slot
                .as_table_mut()
                .and_then(|table| table.get_mut(part))
                .with_context(|| format!("Unknown config key '{key}'"))?;
        }
        ensure!(
            !slot.is_table(),
            "Config key '{key}' is a section; override one of its fields"
        );
        *slot = parse_override(raw, slot);
    }
    Ok(())
}
