//! The visualization run loop.
//!
//! For each hierarchy node (or once with the class head), for each image index:
//! forward pass, pick query pixels, backward per query, then write a heatmap per
//! target layer together with the raw image, the class overlap and, when more
//! than one layer is targeted, a combined heatmap. Saliency bounds are shared by
//! every map of one image.

use anyhow::{bail, ensure, Context, Result};
use image::RgbImage;
use log::{debug, info, warn};
use serde::Serialize;
use std::path::Path;
use std::time::Instant;

use crate::bounds::SaliencyBounds;
use crate::color_utils::{pixel_progress_bar, Marker};
use crate::config::{ExperimentConfig, RunOptions};
use crate::dataset::{build_dataset, Sample, SegmentationDataset};
use crate::heatmap::{
    combine_layers, crop_image, crop_map, save_jpeg, write_heatmap, ORIGINAL_JPEG_QUALITY,
};
use crate::hierarchy::Hierarchy;
use crate::model::build_model;
use crate::output_paths::{save_path, sibling_dir, OutputLayout, QueryKey, ORIGINAL_SUFFIX, OVERLAP_SUFFIX};
use crate::overlap::save_overlap;
use crate::pixels::{compute_output_coord, image_indices, select_bounded, Pixel, DEFAULT_BIN_SIZE};
use crate::run_metadata::RunMetadata;
use crate::saliency::{BackwardTarget, OutputHead, Saliency, SegmentationModel};

/// Output counters of one run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub images_processed: usize,
    pub images_skipped: usize,
    pub queries: usize,
    pub heatmaps: usize,
    pub combined_heatmaps: usize,
    pub overlaps: usize,
    /// Final saliency bounds of every processed image, in visiting order
    pub image_bounds: Vec<ImageBounds>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageBounds {
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    pub min: f32,
    pub max: f32,
}

/// State owned by one image index
struct ImageContext {
    sample: Sample,
    bounds: SaliencyBounds,
    node: Option<String>,
}

struct Visualizer<'a> {
    options: &'a RunOptions,
    dataset: Box<dyn SegmentationDataset>,
    saliency: Saliency,
    layout: OutputLayout,
    test_size: (usize, usize),
    summary: RunSummary,
}

/// Load the experiment config, run the visualization and record run metadata
pub fn run(options: &RunOptions) -> Result<RunSummary> {
    let start = Instant::now();
    let timestamp = chrono::Utc::now();

    let config = ExperimentConfig::load(&options.cfg, &options.overrides)?;
    let summary = run_visualization(options, &config)?;

    let run_dir = config.run_dir(&options.cfg);
    let metadata = RunMetadata::new(options, &config, &summary, timestamp, start.elapsed());
    metadata.save(&run_dir)?;

    info!(
        "{}Wrote {} heatmaps to {} in {:.1}s",
        Marker::Done.prefix(),
        summary.heatmaps + summary.combined_heatmaps,
        run_dir.display(),
        start.elapsed().as_secs_f64()
    );
    Ok(summary)
}

/// Node ids whose heads are visualized, in order
fn node_wnids(
    options: &RunOptions,
    hierarchy: Option<&Hierarchy>,
    dataset: &dyn SegmentationDataset,
) -> Result<Vec<String>> {
    if let Some(cls) = &options.nbdt_node_wnids_for {
        let Some(hierarchy) = hierarchy else {
            bail!("--nbdt-node-wnids-for needs a hierarchy; set nbdt.use_nbdt = true");
        };
        info!("Getting nodes leading up to class leaf {cls}...");
        return hierarchy.path_to_class(dataset.class_index(cls)?);
    }
    if !options.nbdt_node_wnids.is_empty() && hierarchy.is_none() {
        bail!("--nbdt-node-wnid needs a hierarchy; set nbdt.use_nbdt = true");
    }
    Ok(options.nbdt_node_wnids.clone())
}

fn load_hierarchy(config: &ExperimentConfig) -> Result<Option<Hierarchy>> {
    if !config.nbdt.use_nbdt {
        return Ok(None);
    }
    ensure!(
        !config.nbdt.hierarchy.is_empty(),
        "nbdt.use_nbdt is set but nbdt.hierarchy names no graph file"
    );
    let wnids = Some(Path::new(&config.nbdt.wnids)).filter(|p| !p.as_os_str().is_empty());
    let hierarchy = Hierarchy::from_files(Path::new(&config.nbdt.hierarchy), wnids)?;
    ensure!(
        hierarchy.num_classes() == config.dataset.num_classes,
        "Hierarchy has {} leaves but the dataset has {} classes",
        hierarchy.num_classes(),
        config.dataset.num_classes
    );
    info!("=> loaded hierarchy rooted at {}", hierarchy.root());
    Ok(Some(hierarchy))
}

/// Requested layers, or the one the backend picks
fn target_layers(
    requested: Option<&[String]>,
    model: &dyn SegmentationModel,
) -> Result<Vec<String>> {
    match requested {
        Some(layers) => Ok(layers.to_vec()),
        None => Ok(vec![model
            .default_target_layer()
            .context("Model reports no layers")?]),
    }
}

/// Run the visualization described by `options` against a loaded config
pub fn run_visualization(options: &RunOptions, config: &ExperimentConfig) -> Result<RunSummary> {
    let run_dir = config.run_dir(&options.cfg);
    std::fs::create_dir_all(&run_dir)
        .with_context(|| format!("Failed to create output directory {}", run_dir.display()))?;

    let test_size = config.test_size();
    let dataset = build_dataset(
        config.dataset.dataset,
        Path::new(&config.dataset.root),
        &config.dataset.test_set,
        test_size,
    )?;
    ensure!(
        dataset.class_names().len() == config.dataset.num_classes,
        "dataset.num_classes is {} but {} has {} classes",
        config.dataset.num_classes,
        config.dataset_name(),
        dataset.class_names().len()
    );

    let model = build_model(config, &run_dir, &options.device)?;
    let layers = target_layers(options.target_layers.as_deref(), model.as_ref())?;
    info!("=> Target layers: {}", layers.join(", "));

    let hierarchy = load_hierarchy(config)?;
    let wnids = node_wnids(options, hierarchy.as_ref(), &*dataset)?;

    let layout = OutputLayout::new(
        &run_dir,
        options.method.name(),
        options.class_suffix(),
        options.crop_size,
    );
    let saliency = Saliency::new(model, options.method, layers)?;
    let mut visualizer = Visualizer {
        options,
        dataset,
        saliency,
        layout,
        test_size,
        summary: RunSummary::default(),
    };

    match &hierarchy {
        Some(hierarchy) if !wnids.is_empty() => {
            for wnid in &wnids {
                info!("Using logits from node with wnid {wnid}...");
                visualizer
                    .saliency
                    .set_head(OutputHead::Node(hierarchy.node(wnid)?));
                visualizer.run_images()?;
            }
        }
        _ => visualizer.run_images()?,
    }

    Ok(visualizer.summary)
}

impl Visualizer<'_> {
    fn run_images(&mut self) -> Result<()> {
        let crop_class = match &self.options.crop_for {
            Some(name) => Some(self.dataset.class_index(name)?),
            None => None,
        };

        for index in image_indices(self.options.image_index, self.options.image_index_range) {
            let sample = self.dataset.get(index)?;
            info!("Using image {}...", sample.name);
            self.saliency.forward(&sample)?;

            let mut ctx = ImageContext {
                sample,
                bounds: SaliencyBounds::new(),
                node: self.saliency.head().node_wnid().map(str::to_string),
            };
            info!(
                "=> Starting bounds: ({}, {})",
                ctx.bounds.min, ctx.bounds.max
            );

            if let Some(cls) = crop_class {
                if !ctx.sample.label.iter().any(|&v| v as usize == cls) {
                    warn!(
                        "{}Skipping image {index} because no {} found",
                        Marker::Warning.prefix(),
                        self.dataset.class_names()[cls]
                    );
                    self.summary.images_skipped += 1;
                    continue;
                }
            }
            self.summary.images_processed += 1;
            self.run_image(&mut ctx, crop_class)?;
            info!(
                "=> Final bounds are: ({}, {})",
                ctx.bounds.min, ctx.bounds.max
            );
            self.summary.image_bounds.push(ImageBounds {
                index,
                node: ctx.node,
                min: ctx.bounds.min,
                max: ctx.bounds.max,
            });
        }
        Ok(())
    }

    fn run_image(&mut self, ctx: &mut ImageContext, crop_class: Option<usize>) -> Result<()> {
        let options = self.options;
        let whole_image = options.method.whole_image();

        if whole_image {
            let key = QueryKey::whole(ctx.sample.index, options.suffix.as_deref());
            self.saliency.backward(BackwardTarget::Whole)?;
            self.summary.queries += 1;
            self.generate_and_save(ctx, &key, None)?;
            if options.crop_size <= 0 {
                return Ok(());
            }
        }

        let pixels = match (crop_class, &options.pixels) {
            (Some(cls), _) => {
                let candidates: Vec<Pixel> = ctx
                    .sample
                    .label
                    .indexed_iter()
                    .filter(|(_, &v)| v as usize == cls)
                    .map(|((row, col), _)| Pixel::new(row, col))
                    .collect();
                select_bounded(
                    options.pixel_max_num_random,
                    &candidates,
                    DEFAULT_BIN_SIZE,
                    cls as u64,
                )?
            }
            (None, Some(spec)) => spec.pixels(),
            (None, None) => bail!("No query pixels: pass --pixel-i/--pixel-j or --crop-for"),
        };
        info!("Running on {} pixels.", pixels.len());

        let output_size = self
            .saliency
            .prediction()
            .map(|p| p.output_size())
            .context("No prediction for the current image")?;
        let bar = pixel_progress_bar(pixels.len());

        for pixel in pixels {
            ensure!(
                pixel.row < self.test_size.0 && pixel.col < self.test_size.1,
                "Pixel ({},{}) is out of bounds for image of size ({},{})",
                pixel.row,
                pixel.col,
                self.test_size.0,
                self.test_size.1
            );

            let key = QueryKey::at_pixel(ctx.sample.index, pixel, options.suffix.as_deref());
            debug!(
                "Running {} on image {} at pixel ({},{})",
                options.method, ctx.sample.index, pixel.row, pixel.col
            );
            let output_pixel = compute_output_coord(pixel, self.test_size, output_size);

            if !whole_image {
                self.saliency.backward(options.method.target_at(output_pixel))?;
            }
            self.summary.queries += 1;

            let crop = (options.crop_size > 0).then_some(pixel);
            self.generate_and_save(ctx, &key, crop)?;

            if let Some(bar) = &bar {
                bar.inc(1);
            }
        }

        if let Some(bar) = bar {
            bar.finish_and_clear();
        }
        Ok(())
    }

    /// Write every target layer's heatmap for one query; `crop` centres a crop window
    fn generate_and_save(
        &mut self,
        ctx: &mut ImageContext,
        key: &QueryKey,
        crop: Option<Pixel>,
    ) -> Result<()> {
        let options = self.options;
        let crop_size = options.crop_size.max(0) as usize;
        let raw_image: RgbImage = match crop {
            Some(center) => crop_image(&ctx.sample.image, center, crop_size)?,
            None => ctx.sample.image.clone(),
        };
        let node = ctx.node.as_deref();
        let method = options.method;

        let mut heatmaps = Vec::with_capacity(self.saliency.layers().len());
        for layer in self.saliency.layers() {
            let mut map = self.saliency.generate(layer)?;
            if let Some(center) = crop {
                map = crop_map(&map, center, crop_size)?;
            }
            let (min, max) = ctx.bounds.observe(&map);
            info!("=> Bounds: ({min}, {max})");

            let dir = self.layout.layer_dir(layer, node)?;
            let path = save_path(&dir, key, "jpg");
            info!("Saving {method} heatmap at {}...", path.display());
            write_heatmap(
                &path,
                &map,
                &raw_image,
                Some(&ctx.bounds),
                &options.style,
                options.save_npy,
            )?;
            self.summary.heatmaps += 1;

            let original_path = save_path(&sibling_dir(&dir, ORIGINAL_SUFFIX)?, key, "jpg");
            info!("Saving {method} original at {}...", original_path.display());
            save_jpeg(&original_path, &raw_image, ORIGINAL_JPEG_QUALITY)?;

            if crop.is_none() {
                let overlap_dir = sibling_dir(&dir, OVERLAP_SUFFIX)?;
                let npy_path = save_path(&overlap_dir, key, "npy");
                let plot_path = save_path(&overlap_dir, key, "jpg");
                if options.save_npy {
                    info!("Saving {method} overlap data at {}...", npy_path.display());
                }
                info!("Saving {method} overlap plot at {}...", plot_path.display());
                save_overlap(
                    &npy_path,
                    &plot_path,
                    &map,
                    &ctx.sample.label,
                    self.dataset.class_names(),
                    options.save_npy,
                )?;
                self.summary.overlaps += 1;
            }

            heatmaps.push(map);
        }

        if heatmaps.len() > 1 {
            let combined = combine_layers(&heatmaps)?;
            let path = save_path(&self.layout.combined_dir(node)?, key, "jpg");
            info!("Saving combined {method} heatmap at {}...", path.display());
            write_heatmap(
                &path,
                &combined,
                &raw_image,
                None,
                &options.style,
                options.save_npy,
            )?;
            self.summary.combined_heatmaps += 1;
        }
        Ok(())
    }
}
