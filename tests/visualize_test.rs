mod common;

use common::{files_in, Fixture, HEIGHT, WIDTH};
use ndarray::Array2;
use ndarray_npy::read_npy;
use segcam::config::ExperimentConfig;
use segcam::run_metadata::METADATA_FILE;
use segcam::visualize::{run, run_visualization};
use std::path::Path;

fn mean_intensity(path: &Path) -> f32 {
    let image = image::open(path).unwrap().to_rgb8();
    let total: u64 = image.as_raw().iter().map(|&v| v as u64).sum();
    total as f32 / image.as_raw().len() as f32
}

fn max_value(map: &Array2<f32>) -> f32 {
    map.iter().copied().fold(f32::NEG_INFINITY, f32::max)
}

fn run_with(fixture: &Fixture, args: &[&str]) -> anyhow::Result<segcam::visualize::RunSummary> {
    let options = fixture.options(args);
    let config = ExperimentConfig::load(&options.cfg, &options.overrides)?;
    run_visualization(&options, &config)
}

#[test]
fn test_pixel_queries_write_every_output() {
    let fixture = Fixture::new();
    let options = fixture.options(&[
        "--pixel-i",
        "1",
        "4",
        "--pixel-j",
        "2",
        "6",
        "--target-layers",
        "layer3,layer4",
    ]);
    let summary = run(&options).unwrap();

    assert_eq!(summary.images_processed, 1);
    assert_eq!(summary.queries, 2);
    assert_eq!(summary.heatmaps, 4);
    assert_eq!(summary.combined_heatmaps, 2);
    assert_eq!(summary.overlaps, 4);

    let run_dir = fixture.run_dir();
    assert_eq!(
        files_in(&run_dir.join("gradcam_layer3")),
        vec![
            "image-0-pixel_i-1-pixel_j-2.jpg",
            "image-0-pixel_i-1-pixel_j-2.npy",
            "image-0-pixel_i-4-pixel_j-6.jpg",
            "image-0-pixel_i-4-pixel_j-6.npy",
        ]
    );
    assert!(run_dir
        .join("gradcam_layer4_original/image-0-pixel_i-4-pixel_j-6.jpg")
        .exists());
    assert_eq!(
        files_in(&run_dir.join("gradcam_layer4_overlap")).len(),
        4,
        "npy + plot per pixel"
    );
    assert!(run_dir
        .join("gradcam_combined/image-0-pixel_i-1-pixel_j-2.jpg")
        .exists());
    assert!(run_dir.join(METADATA_FILE).exists());

    // raw saliency at input resolution
    let raw: Array2<f32> =
        read_npy(run_dir.join("gradcam_layer3/image-0-pixel_i-1-pixel_j-2.npy")).unwrap();
    assert_eq!(raw.dim(), (HEIGHT, WIDTH));
    assert!(raw.iter().all(|&v| v > 0.0));

    let heatmap = image::open(run_dir.join("gradcam_layer3/image-0-pixel_i-1-pixel_j-2.jpg"))
        .unwrap();
    assert_eq!((heatmap.width(), heatmap.height()), (WIDTH as u32, HEIGHT as u32));

    let overlap: Array2<f32> =
        read_npy(run_dir.join("gradcam_layer3_overlap/image-0-pixel_i-1-pixel_j-2.npy")).unwrap();
    // car and road rows
    assert_eq!(overlap.dim(), (2, 2));
    assert_eq!(overlap[[0, 0]], 0.0);
    assert_eq!(overlap[[1, 0]], 13.0);
}

#[test]
fn test_skip_save_npy_and_suffix() {
    let fixture = Fixture::new();
    let summary = run_with(
        &fixture,
        &["--pixel-i", "0", "--pixel-j", "0", "--skip-save-npy", "--suffix", "v2"],
    )
    .unwrap();
    assert_eq!(summary.heatmaps, 1);
    assert_eq!(summary.combined_heatmaps, 0, "single layer");

    let run_dir = fixture.run_dir();
    assert_eq!(
        files_in(&run_dir.join("gradcam_layer4")),
        vec!["image-0-pixel_i-0-pixel_j-0-suffix-v2.jpg"]
    );
    assert_eq!(
        files_in(&run_dir.join("gradcam_layer4_overlap")),
        vec!["image-0-pixel_i-0-pixel_j-0-suffix-v2.jpg"]
    );
    assert!(!run_dir.join("gradcam_combined").exists());
}

#[test]
fn test_cartesian_range_queries() {
    let fixture = Fixture::new();
    let summary = run_with(
        &fixture,
        &[
            "--vis-mode",
            "SegGradCAM",
            "--pixel-i-range",
            "0",
            "6",
            "3",
            "--pixel-j",
            "1",
            "5",
            "--pixel-cartesian-product",
        ],
    )
    .unwrap();
    assert_eq!(summary.queries, 4);
    let files = files_in(&fixture.run_dir().join("seggradcam_layer4"));
    assert!(files.contains(&"image-0-pixel_i-3-pixel_j-5.jpg".to_string()));
    assert!(files.contains(&"image-0-pixel_i-0-pixel_j-1.jpg".to_string()));
}

#[test]
fn test_whole_image_method() {
    let fixture = Fixture::new();
    let summary = run_with(
        &fixture,
        &["--vis-mode", "SegNormGradWhole", "--image-index-range", "0", "2", "1"],
    )
    .unwrap();
    assert_eq!(summary.images_processed, 2);
    assert_eq!(summary.queries, 2);

    let run_dir = fixture.run_dir();
    assert_eq!(
        files_in(&run_dir.join("segnormgradwhole_layer4")),
        vec!["image-0.jpg", "image-0.npy", "image-1.jpg", "image-1.npy"]
    );
    assert!(run_dir.join("segnormgradwhole_layer4_overlap/image-1.jpg").exists());
}

#[test]
fn test_crop_for_class_skips_images_without_it() {
    let fixture = Fixture::new();
    let summary = run_with(
        &fixture,
        &[
            "--crop-for",
            "car",
            "--crop-size",
            "4",
            "--image-index-range",
            "0",
            "2",
            "1",
        ],
    )
    .unwrap();
    assert_eq!(summary.images_processed, 1);
    assert_eq!(summary.images_skipped, 1);
    // every car pixel falls into one spatial bin
    assert_eq!(summary.queries, 1);
    assert_eq!(summary.overlaps, 0, "cropped saliency has no overlap");

    let run_dir = fixture.run_dir();
    let files = files_in(&run_dir.join("gradcam_layer4_clscar_crop4"));
    assert_eq!(files.len(), 2);
    let name = &files[0];
    assert!(name.starts_with("image-0-pixel_i-"));
    let col: usize = name
        .trim_end_matches(".jpg")
        .rsplit('-')
        .next()
        .unwrap()
        .parse()
        .unwrap();
    assert!(col < WIDTH / 2, "query pixel {name} is labelled car");

    assert!(run_dir.join("gradcam_layer4_clscar_crop4_original").exists());
    assert!(!run_dir.join("gradcam_layer4_clscar_crop4_overlap").exists());

    let cropped: Array2<f32> =
        read_npy(run_dir.join("gradcam_layer4_clscar_crop4").join(name.replace(".jpg", ".npy")))
            .unwrap();
    assert!(cropped.nrows() <= 4 && cropped.ncols() <= 4);
}

#[test]
fn test_whole_image_method_with_crops() {
    let fixture = Fixture::new();
    let summary = run_with(
        &fixture,
        &["--vis-mode", "GradPAMWhole", "--crop-for", "car", "--crop-size", "4"],
    )
    .unwrap();
    // one whole-image map plus one crop
    assert_eq!(summary.queries, 2);
    assert_eq!(summary.overlaps, 1);

    let files = files_in(&fixture.run_dir().join("gradpamwhole_layer4_clscar_crop4"));
    assert!(files.contains(&"image-0.jpg".to_string()));
    assert_eq!(files.iter().filter(|f| f.contains("pixel_i")).count(), 2);
}

#[test]
fn test_hierarchy_nodes_for_class() {
    let fixture = Fixture::with_nodes(&["root", "vehicle"]);
    let summary = run_with(
        &fixture,
        &["--pixel-i", "0", "--pixel-j", "0", "--nbdt-node-wnids-for", "car"],
    )
    .unwrap();
    assert_eq!(summary.queries, 2);

    let run_dir = fixture.run_dir();
    assert!(run_dir
        .join("gradcam_layer4_root_clscar/image-0-pixel_i-0-pixel_j-0.jpg")
        .exists());
    assert!(run_dir
        .join("gradcam_layer4_vehicle_clscar/image-0-pixel_i-0-pixel_j-0.jpg")
        .exists());
}

#[test]
fn test_explicit_hierarchy_node() {
    let fixture = Fixture::with_nodes(&["vehicle"]);
    let summary = run_with(
        &fixture,
        &["--pixel-i", "5", "--pixel-j", "7", "--nbdt-node-wnid", "vehicle"],
    )
    .unwrap();
    assert_eq!(summary.heatmaps, 1);
    assert!(fixture
        .run_dir()
        .join("gradcam_layer4_vehicle/image-0-pixel_i-5-pixel_j-7.jpg")
        .exists());
}

#[test]
fn test_node_without_hierarchy_is_error() {
    let fixture = Fixture::new();
    let err = run_with(
        &fixture,
        &["--pixel-i", "0", "--pixel-j", "0", "--nbdt-node-wnid", "vehicle"],
    )
    .unwrap_err();
    assert!(err.to_string().contains("nbdt.use_nbdt"));

    let err = run_with(
        &fixture,
        &["--pixel-i", "0", "--pixel-j", "0", "--nbdt-node-wnids-for", "car"],
    )
    .unwrap_err();
    assert!(err.to_string().contains("nbdt.use_nbdt"));
}

#[test]
fn test_out_of_bounds_pixel() {
    let fixture = Fixture::new();
    let err = run_with(&fixture, &["--pixel-i", "6", "--pixel-j", "0"]).unwrap_err();
    assert_eq!(
        err.to_string(),
        "Pixel (6,0) is out of bounds for image of size (6,8)"
    );
}

#[test]
fn test_unknown_class_and_layer() {
    let fixture = Fixture::new();
    assert!(run_with(&fixture, &["--crop-for", "dragon"]).is_err());
    assert!(run_with(
        &fixture,
        &["--pixel-i", "0", "--pixel-j", "0", "--target-layers", "layer9"]
    )
    .is_err());
}

#[test]
fn test_config_overrides_are_applied() {
    let fixture = Fixture::new();
    // Tensor keys no longer match once the prefix is kept
    let err = run_with(
        &fixture,
        &["--pixel-i", "0", "--pixel-j", "0", "--", "model.key_prefix_len", "0"],
    )
    .unwrap_err();
    assert!(format!("{err:#}").contains("Missing gradient for layer layer4"));

    let err = run_with(
        &fixture,
        &["--pixel-i", "0", "--pixel-j", "0", "--", "test.image_size", "[16, 12]"],
    )
    .unwrap_err();
    assert!(format!("{err:#}").contains("test size"));
}

#[test]
fn test_heatmaps_share_bounds_within_an_image() {
    // pixel (0,0) of image 0 has 4x the gradient, image 1 has a tenth of it
    let fixture = Fixture::with_gradient_scale(|image, key| match (image, key) {
        (1, _) => 0.1,
        (_, "pixel_i-0-pixel_j-0") => 4.0,
        _ => 1.0,
    });
    let summary = run_with(
        &fixture,
        &[
            "--pixel-i",
            "0",
            "5",
            "--pixel-j",
            "0",
            "7",
            "--image-index-range",
            "0",
            "2",
            "1",
        ],
    )
    .unwrap();
    assert_eq!(summary.images_processed, 2);

    let dir = fixture.run_dir().join("gradcam_layer4");
    let strong: Array2<f32> = read_npy(dir.join("image-0-pixel_i-0-pixel_j-0.npy")).unwrap();
    let weak: Array2<f32> = read_npy(dir.join("image-0-pixel_i-5-pixel_j-7.npy")).unwrap();
    assert!((max_value(&strong) - 4.0 * max_value(&weak)).abs() < 1e-3);

    let bounds = &summary.image_bounds;
    assert_eq!(bounds.len(), 2);
    assert_eq!((bounds[0].index, bounds[1].index), (0, 1));
    assert_eq!(bounds[0].min, 0.0);
    assert!((bounds[0].max - max_value(&strong)).abs() < 1e-4);
    // image 1 starts over instead of inheriting image 0's max
    assert_eq!(bounds[1].min, 0.0);
    assert!((bounds[1].max - 0.1 * max_value(&weak)).abs() < 1e-4);

    // the weaker query is rendered against the stronger one's max
    let strong_jpg = mean_intensity(&dir.join("image-0-pixel_i-0-pixel_j-0.jpg"));
    let weak_jpg = mean_intensity(&dir.join("image-0-pixel_i-5-pixel_j-7.jpg"));
    assert!(weak_jpg + 10.0 < strong_jpg, "{weak_jpg} vs {strong_jpg}");

    // image 1's strongest map reaches full scale again
    let next_image = mean_intensity(&dir.join("image-1-pixel_i-0-pixel_j-0.jpg"));
    assert!((next_image - strong_jpg).abs() < 3.0, "{next_image} vs {strong_jpg}");
}

