//! Test-set access for semantic segmentation datasets.
//!
//! Datasets are picked by a config enum and built through `build_dataset`. The
//! Cityscapes loader reads a list file of `image [label]` lines, relative to
//! `{root}/cityscapes/`, and maps Cityscapes label ids to the 19 train ids.

use anyhow::{bail, ensure, Context, Result};
use image::RgbImage;
use log::debug;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::overlap::IGNORE_LABEL;

/// Cityscapes train-id class names, in class-index order
pub const CITYSCAPES_CLASSES: [&str; 19] = [
    "road",
    "sidewalk",
    "building",
    "wall",
    "fence",
    "pole",
    "traffic_light",
    "traffic_sign",
    "vegetation",
    "terrain",
    "sky",
    "person",
    "rider",
    "car",
    "truck",
    "bus",
    "train",
    "motorcycle",
    "bicycle",
];

/// Cityscapes label id -> train id; everything else is ignored
const CITYSCAPES_TRAIN_IDS: [(u8, u8); 19] = [
    (7, 0),
    (8, 1),
    (11, 2),
    (12, 3),
    (13, 4),
    (17, 5),
    (19, 6),
    (20, 7),
    (21, 8),
    (22, 9),
    (23, 10),
    (24, 11),
    (25, 12),
    (26, 13),
    (27, 14),
    (28, 15),
    (31, 16),
    (32, 17),
    (33, 18),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetKind {
    #[default]
    Cityscapes,
}

/// One test image with its ground truth
#[derive(Debug, Clone)]
pub struct Sample {
    pub index: usize,
    pub name: String,
    pub image: RgbImage,
    /// Train ids, 255 where ignored or unlabelled
    pub label: Array2<u8>,
}

impl Sample {
    /// (height, width)
    pub fn size(&self) -> (usize, usize) {
        (self.image.height() as usize, self.image.width() as usize)
    }
}

pub trait SegmentationDataset {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, index: usize) -> Result<Sample>;

    fn class_names(&self) -> &[&'static str];

    /// Class index of a class name
    fn class_index(&self, name: &str) -> Result<usize> {
        self.class_names()
            .iter()
            .position(|candidate| *candidate == name)
            .with_context(|| {
                format!(
                    "Unknown class '{name}'. Known classes: {}",
                    self.class_names().join(", ")
                )
            })
    }
}

/// Construct the dataset named by the config
pub fn build_dataset(
    kind: DatasetKind,
    root: &Path,
    list_path: &str,
    test_size: (usize, usize),
) -> Result<Box<dyn SegmentationDataset>> {
    match kind {
        DatasetKind::Cityscapes => Ok(Box::new(Cityscapes::new(root, list_path, test_size)?)),
    }
}

#[derive(Debug, Clone)]
struct ListEntry {
    image: String,
    label: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Cityscapes {
    data_dir: PathBuf,
    files: Vec<ListEntry>,
    test_size: (usize, usize),
}

impl Cityscapes {
    pub fn new(root: &Path, list_path: &str, test_size: (usize, usize)) -> Result<Self> {
        let list_file = root.join(list_path);
        let content = std::fs::read_to_string(&list_file)
            .with_context(|| format!("Failed to read list file {}", list_file.display()))?;

        let mut files = Vec::new();
        for (line_no, line) in content.lines().enumerate() {
            let mut parts = line.split_whitespace();
            let Some(image) = parts.next() else {
                continue;
            };
            let label = parts.next().map(str::to_string);
            ensure!(
                parts.next().is_none(),
                "{}:{}: expected 'image [label]'",
                list_file.display(),
                line_no + 1
            );
            files.push(ListEntry {
                image: image.to_string(),
                label,
            });
        }
        debug!("Read {} entries from {}", files.len(), list_file.display());

        Ok(Self {
            data_dir: root.join("cityscapes"),
            files,
            test_size,
        })
    }

    fn entry(&self, index: usize) -> Result<&ListEntry> {
        match self.files.get(index) {
            Some(entry) => Ok(entry),
            None => bail!(
                "Image index {index} is out of range for a test set of {} images",
                self.files.len()
            ),
        }
    }
}

/// Map Cityscapes label ids to train ids
pub fn convert_label(label_ids: &Array2<u8>) -> Array2<u8> {
    let mut lookup = [IGNORE_LABEL; 256];
    for (label_id, train_id) in CITYSCAPES_TRAIN_IDS {
        lookup[label_id as usize] = train_id;
    }
    label_ids.mapv(|id| lookup[id as usize])
}

impl SegmentationDataset for Cityscapes {
    fn len(&self) -> usize {
        self.files.len()
    }

    fn get(&self, index: usize) -> Result<Sample> {
        let entry = self.entry(index)?;
        let image_path = self.data_dir.join(&entry.image);
        let image = image::open(&image_path)
            .with_context(|| format!("Failed to open image {}", image_path.display()))?
            .to_rgb8();

        let (height, width) = (image.height() as usize, image.width() as usize);
        ensure!(
            (height, width) == self.test_size,
            "Image {} is {}x{} but the test size is {}x{}",
            image_path.display(),
            height,
            width,
            self.test_size.0,
            self.test_size.1
        );

        let label = match &entry.label {
            Some(label) => {
                let label_path = self.data_dir.join(label);
                let gray = image::open(&label_path)
                    .with_context(|| format!("Failed to open label {}", label_path.display()))?
                    .to_luma8();
                ensure!(
                    gray.dimensions() == image.dimensions(),
                    "Label {} does not match the size of its image",
                    label_path.display()
                );
                let ids = Array2::from_shape_vec((height, width), gray.into_raw())?;
                convert_label(&ids)
            }
            None => Array2::from_elem((height, width), IGNORE_LABEL),
        };

        let name = Path::new(&entry.image)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("image")
            .to_string();

        Ok(Sample {
            index,
            name,
            image,
            label,
        })
    }

    fn class_names(&self) -> &[&'static str] {
        &CITYSCAPES_CLASSES
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma, Rgb};
    use ndarray::array;
    use tempfile::TempDir;

    fn write_sample(root: &Path, with_label: bool) {
        let data = root.join("cityscapes/leftImg8bit/val");
        std::fs::create_dir_all(&data).unwrap();
        RgbImage::from_pixel(6, 4, Rgb([10, 20, 30]))
            .save(data.join("a_leftImg8bit.png"))
            .unwrap();

        let mut lines = String::new();
        if with_label {
            let gt = root.join("cityscapes/gtFine/val");
            std::fs::create_dir_all(&gt).unwrap();
            let mut label = GrayImage::from_pixel(6, 4, Luma([7]));
            label.put_pixel(0, 0, Luma([26]));
            label.put_pixel(5, 3, Luma([0]));
            label.save(gt.join("a_gtFine_labelIds.png")).unwrap();
            lines.push_str("leftImg8bit/val/a_leftImg8bit.png gtFine/val/a_gtFine_labelIds.png\n");
        } else {
            lines.push_str("leftImg8bit/val/a_leftImg8bit.png\n");
        }
        std::fs::create_dir_all(root.join("list")).unwrap();
        std::fs::write(root.join("list/val.lst"), lines).unwrap();
    }

    #[test]
    fn test_convert_label() {
        let ids = array![[7u8, 8, 26], [0, 33, 255]];
        assert_eq!(convert_label(&ids), array![[0u8, 1, 13], [255, 18, 255]]);
    }

    #[test]
    fn test_load_sample_with_label() {
        let temp = TempDir::new().unwrap();
        write_sample(temp.path(), true);

        let dataset = build_dataset(DatasetKind::Cityscapes, temp.path(), "list/val.lst", (4, 6))
            .unwrap();
        assert_eq!(dataset.len(), 1);

        let sample = dataset.get(0).unwrap();
        assert_eq!(sample.name, "a_leftImg8bit");
        assert_eq!(sample.size(), (4, 6));
        assert_eq!(sample.label[[0, 0]], 13);
        assert_eq!(sample.label[[1, 1]], 0);
        assert_eq!(sample.label[[3, 5]], 255);
    }

    #[test]
    fn test_missing_label_is_ignored() {
        let temp = TempDir::new().unwrap();
        write_sample(temp.path(), false);
        let dataset = Cityscapes::new(temp.path(), "list/val.lst", (4, 6)).unwrap();
        let sample = dataset.get(0).unwrap();
        assert!(sample.label.iter().all(|&v| v == 255));
    }

    #[test]
    fn test_size_mismatch_and_range() {
        let temp = TempDir::new().unwrap();
        write_sample(temp.path(), false);
        let dataset = Cityscapes::new(temp.path(), "list/val.lst", (8, 6)).unwrap();
        assert!(dataset.get(0).is_err());
        assert!(dataset.get(1).is_err());
    }

    #[test]
    fn test_class_index() {
        let temp = TempDir::new().unwrap();
        write_sample(temp.path(), false);
        let dataset = Cityscapes::new(temp.path(), "list/val.lst", (4, 6)).unwrap();
        assert_eq!(dataset.class_index("car").unwrap(), 13);
        assert_eq!(dataset.class_index("bicycle").unwrap(), 18);
        assert!(dataset.class_index("dragon").is_err());
    }
}
