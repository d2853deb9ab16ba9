//! Synthetic Cityscapes test set and tensor archive.
//!
//! Images are 6x8 with a 3x4 model output. The left half of image 0 is labelled
//! car, everything else is road. Logits predict car on the left half too.

#![allow(dead_code)]

use clap::Parser;
use clap_verbosity_flag::Verbosity;
use image::{GrayImage, Luma, Rgb, RgbImage};
use ndarray::Array3;
use ndarray_npy::write_npy;
use segcam::config::{GlobalArgs, RunOptions, VisCommand};
use segcam::dataset::CITYSCAPES_CLASSES;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub const HEIGHT: usize = 6;
pub const WIDTH: usize = 8;
pub const OUT_HEIGHT: usize = 3;
pub const OUT_WIDTH: usize = 4;
pub const LAYERS: [&str; 2] = ["layer3", "layer4"];

const CAR_LABEL_ID: u8 = 26;
const ROAD_LABEL_ID: u8 = 7;
const CAR: usize = 13;

pub struct Fixture {
    pub dir: TempDir,
    pub cfg: PathBuf,
}

impl Fixture {
    /// Two images, an archive and `exp.toml`
    pub fn new() -> Self {
        Self::with_nodes(&[])
    }

    /// Like `new`, with gradients for the given hierarchy nodes and the hierarchy enabled
    pub fn with_nodes(nodes: &[&str]) -> Self {
        Self::build(nodes, |_, _| 1.0)
    }

    /// Like `new`, with every gradient of `(image, target key)` multiplied by `scale`
    pub fn with_gradient_scale(scale: impl Fn(usize, &str) -> f32) -> Self {
        Self::build(&[], scale)
    }

    fn build(nodes: &[&str], scale: impl Fn(usize, &str) -> f32) -> Self {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        write_dataset(&root.join("data"));
        write_archive(&root.join("out/cityscapes/exp/archive"), 2, nodes, scale);

        let mut config = format!(
            "output_dir = '{}'\n\n[dataset]\nroot = '{}'\ntest_set = 'list/val.lst'\n\n[test]\nimage_size = [{WIDTH}, {HEIGHT}]\n",
            root.join("out").display(),
            root.join("data").display(),
        );
        if !nodes.is_empty() {
            let graph = root.join("graph.json");
            std::fs::write(&graph, hierarchy_json()).unwrap();
            config.push_str(&format!(
                "\n[nbdt]\nuse_nbdt = true\nhierarchy = '{}'\n",
                graph.display()
            ));
        }
        let cfg = root.join("exp.toml");
        std::fs::write(&cfg, config).unwrap();

        Self { dir, cfg }
    }

    pub fn run_dir(&self) -> PathBuf {
        self.dir.path().join("out/cityscapes/exp")
    }

    pub fn options(&self, args: &[&str]) -> RunOptions {
        let mut argv = vec!["segcam", "--cfg", self.cfg.to_str().unwrap()];
        argv.extend_from_slice(args);
        let cmd = VisCommand::try_parse_from(argv).unwrap();
        let global = GlobalArgs {
            verbosity: Verbosity::new(0, 0),
            device: "cpu".to_string(),
            no_color: true,
        };
        RunOptions::from_args(&global, cmd).unwrap()
    }
}

fn write_dataset(root: &Path) {
    let images = root.join("cityscapes/leftImg8bit/val");
    let labels = root.join("cityscapes/gtFine/val");
    std::fs::create_dir_all(&images).unwrap();
    std::fs::create_dir_all(&labels).unwrap();

    let mut list = String::new();
    for index in 0..2 {
        let image = RgbImage::from_fn(WIDTH as u32, HEIGHT as u32, |x, y| {
            Rgb([(x * 30) as u8, (y * 40) as u8, 128])
        });
        image.save(images.join(format!("img{index}_leftImg8bit.png"))).unwrap();

        let label = GrayImage::from_fn(WIDTH as u32, HEIGHT as u32, |x, _| {
            if index == 0 && (x as usize) < WIDTH / 2 {
                Luma([CAR_LABEL_ID])
            } else {
                Luma([ROAD_LABEL_ID])
            }
        });
        label.save(labels.join(format!("img{index}_gtFine_labelIds.png"))).unwrap();

        list.push_str(&format!(
            "leftImg8bit/val/img{index}_leftImg8bit.png gtFine/val/img{index}_gtFine_labelIds.png\n"
        ));
    }
    std::fs::create_dir_all(root.join("list")).unwrap();
    std::fs::write(root.join("list/val.lst"), list).unwrap();
}

fn target_keys() -> Vec<String> {
    let mut keys = vec!["whole".to_string()];
    for r in 0..OUT_HEIGHT {
        for c in 0..OUT_WIDTH {
            keys.push(format!("pixel_i-{r}-pixel_j-{c}"));
            keys.push(format!("segment_i-{r}-segment_j-{c}"));
        }
    }
    keys
}

pub fn write_archive(
    root: &Path,
    images: usize,
    nodes: &[&str],
    scale: impl Fn(usize, &str) -> f32,
) {
    std::fs::create_dir_all(root).unwrap();
    std::fs::write(
        root.join("manifest.toml"),
        "layers = [\"layer3\", \"layer4\"]\n",
    )
    .unwrap();

    for index in 0..images {
        let image = root.join(format!("image-{index}"));
        std::fs::create_dir_all(image.join("activations")).unwrap();

        let logits = Array3::from_shape_fn((CITYSCAPES_CLASSES.len(), OUT_HEIGHT, OUT_WIDTH), |(k, _, x)| {
            let predicted = if index == 0 && x < OUT_WIDTH / 2 { CAR } else { 0 };
            if k == predicted {
                5.0f32
            } else {
                0.0
            }
        });
        write_npy(image.join("logits.npy"), &logits).unwrap();

        for (n, layer) in LAYERS.iter().enumerate() {
            let activation = Array3::from_shape_fn((2, OUT_HEIGHT, OUT_WIDTH), |(k, y, x)| {
                1.0 + (n + k + y + x) as f32
            });
            write_npy(
                image.join(format!("activations/model.{layer}.npy")),
                &activation,
            )
            .unwrap();
        }

        let mut prefixes = vec![image.join("gradients")];
        for node in nodes {
            prefixes.push(image.join(format!("gradients/node-{node}")));
        }
        for prefix in prefixes {
            for key in target_keys() {
                let dir = prefix.join(&key);
                std::fs::create_dir_all(&dir).unwrap();
                let value = 0.5 * scale(index, &key);
                for layer in LAYERS {
                    write_npy(
                        dir.join(format!("model.{layer}.npy")),
                        &Array3::<f32>::from_elem((2, OUT_HEIGHT, OUT_WIDTH), value),
                    )
                    .unwrap();
                }
            }
        }
    }
}

/// root -> {vehicle, other} -> the 19 Cityscapes classes
pub fn hierarchy_json() -> String {
    let mut nodes = vec![
        r#"{"id": "root"}"#.to_string(),
        r#"{"id": "vehicle", "label": "vehicle"}"#.to_string(),
        r#"{"id": "other", "label": "other"}"#.to_string(),
    ];
    let mut links = vec![
        r#"{"source": "root", "target": "vehicle"}"#.to_string(),
        r#"{"source": "root", "target": "other"}"#.to_string(),
    ];
    for (index, name) in CITYSCAPES_CLASSES.iter().enumerate() {
        nodes.push(format!(r#"{{"id": "{name}", "label": "{name}"}}"#));
        let parent = if index >= CAR { "vehicle" } else { "other" };
        links.push(format!(r#"{{"source": "{parent}", "target": "{name}"}}"#));
    }
    format!(
        r#"{{"nodes": [{}], "links": [{}]}}"#,
        nodes.join(", "),
        links.join(", ")
    )
}

/// File names in a directory, sorted
pub fn files_in(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}
