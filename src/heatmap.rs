//! Heatmap rendering: normalisation, colour mapping, blending and JPEG output.
//!
//! Also hosts the map utilities the run loop needs around rendering: bilinear
//! upsampling of feature-resolution maps, square crops around a query pixel and
//! the product of several layers' maps.

use anyhow::{ensure, Context, Result};
use clap::ValueEnum;
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, Rgb, RgbImage};
use log::debug;
use ndarray::{s, Array2};
use ndarray_npy::write_npy;
use serde::Serialize;
use std::fs::File;
use std::io::BufWriter;
use std::ops::Range;
use std::path::Path;

use crate::bounds::SaliencyBounds;
use crate::pixels::Pixel;

/// JPEG quality of rendered heatmaps
pub const HEATMAP_JPEG_QUALITY: u8 = 50;

/// JPEG quality of the raw `_original` images
pub const ORIGINAL_JPEG_QUALITY: u8 = 95;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorMap {
    #[default]
    Hot,
    Viridis,
    Turbo,
    Grayscale,
}

/// How the coloured map is mixed with the raw image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BlendMode {
    /// Fixed 50/50 average of palette colour and image
    #[default]
    Average,
    /// Alpha blend weighted by the normalised saliency
    Paper,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct HeatmapStyle {
    pub colormap: ColorMap,
    pub blend: BlendMode,
}

/// Map a value in [0, 1] to an RGB triple in [0, 255]
pub fn apply_colormap(value: f32, colormap: ColorMap) -> [f32; 3] {
    let v = value.clamp(0.0, 1.0);

    let [r, g, b] = match colormap {
        ColorMap::Hot => hot_colormap(v),
        ColorMap::Viridis => viridis_colormap(v),
        ColorMap::Turbo => turbo_colormap(v),
        ColorMap::Grayscale => [v, v, v],
    };
    [r * 255.0, g * 255.0, b * 255.0]
}

fn ramp(t: f32, start: f32, end: f32) -> f32 {
    ((t - start) / (end - start)).clamp(0.0, 1.0)
}

// Black -> red -> yellow -> white, with matplotlib's breakpoints
fn hot_colormap(t: f32) -> [f32; 3] {
    let k = ramp(t, 0.0, 0.365_079);
    let r = 0.0416 * (1.0 - k) + k;
    let g = ramp(t, 0.365_079, 0.746_032);
    let b = ramp(t, 0.746_032, 1.0);
    [r, g, b]
}

// matplotlib viridis sampled at every eighth of the range
const VIRIDIS: [[f32; 3]; 9] = [
    [0.267_004, 0.004_874, 0.329_415],
    [0.282_623, 0.140_926, 0.457_517],
    [0.229_739, 0.322_361, 0.545_706],
    [0.172_719, 0.448_791, 0.557_885],
    [0.127_568, 0.566_949, 0.550_556],
    [0.134_692, 0.658_636, 0.517_649],
    [0.369_214, 0.788_888, 0.382_914],
    [0.678_489, 0.863_742, 0.189_503],
    [0.993_248, 0.906_157, 0.143_936],
];

fn viridis_colormap(t: f32) -> [f32; 3] {
    let pos = t * (VIRIDIS.len() - 1) as f32;
    let lo = (pos.floor() as usize).min(VIRIDIS.len() - 2);
    let f = pos - lo as f32;
    let (a, b) = (VIRIDIS[lo], VIRIDIS[lo + 1]);
    [0, 1, 2].map(|c| a[c] + (b[c] - a[c]) * f)
}

// Degree-5 fit of turbo published with the colormap
const TURBO: [[f32; 6]; 3] = [
    [0.135_721_38, 4.615_392_6, -42.660_322_58, 132.131_082_34, -152.942_393_96, 59.286_379_43],
    [0.091_402_61, 2.194_188_39, 4.842_966_58, -14.185_033_33, 4.277_298_57, 2.829_566_04],
    [0.106_673_3, 12.641_946_08, -60.582_048_36, 110.362_767_71, -89.903_109_12, 27.348_249_73],
];

fn turbo_colormap(t: f32) -> [f32; 3] {
    TURBO.map(|coeffs| {
        coeffs
            .iter()
            .rev()
            .fold(0.0, |acc, &c| acc * t + c)
            .clamp(0.0, 1.0)
    })
}

/// Rescale to [0, 1] using the map's own extremes
pub fn normalize(map: &Array2<f32>) -> Array2<f32> {
    let (min, max) = map
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    normalize_with(map, min, max)
}

/// Rescale with fixed extremes. A degenerate range maps everything to zero.
pub fn normalize_with(map: &Array2<f32>, min: f32, max: f32) -> Array2<f32> {
    let range = max - min;
    if !range.is_finite() || range <= 0.0 {
        return Array2::zeros(map.raw_dim());
    }
    map.mapv(|v| (v - min) / range)
}

pub fn normalize_with_bounds(map: &Array2<f32>, bounds: &SaliencyBounds) -> Array2<f32> {
    normalize_with(map, bounds.min, bounds.max)
}

/// Colour a normalised map and mix it into `raw_image`
pub fn render_heatmap(
    normalized: &Array2<f32>,
    raw_image: &RgbImage,
    style: &HeatmapStyle,
) -> Result<RgbImage> {
    let (height, width) = normalized.dim();
    ensure!(
        raw_image.dimensions() == (width as u32, height as u32),
        "Saliency map is {}x{} but image is {}x{}",
        width,
        height,
        raw_image.width(),
        raw_image.height()
    );

    let mut output = RgbImage::new(width as u32, height as u32);
    for (x, y, pixel) in output.enumerate_pixels_mut() {
        let value = normalized[[y as usize, x as usize]];
        let color = apply_colormap(value, style.colormap);
        let base = raw_image.get_pixel(x, y);

        let mut blended = [0u8; 3];
        for c in 0..3 {
            let raw = base[c] as f32;
            let mixed = match style.blend {
                BlendMode::Average => (color[c] + raw) / 2.0,
                BlendMode::Paper => {
                    let alpha = value.clamp(0.0, 1.0);
                    alpha * color[c] + (1.0 - alpha) * raw
                }
            };
            // Truncate like a u8 cast of the float buffer
            blended[c] = mixed.clamp(0.0, 255.0) as u8;
        }
        *pixel = Rgb(blended);
    }
    Ok(output)
}

/// Write `image` as a JPEG at the given quality
pub fn save_jpeg(path: &Path, image: &RgbImage, quality: u8) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("Failed to create image file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    JpegEncoder::new_with_quality(&mut writer, quality)
        .encode(
            image.as_raw(),
            image.width(),
            image.height(),
            ExtendedColorType::Rgb8,
        )
        .with_context(|| format!("Failed to encode JPEG {}", path.display()))?;
    Ok(())
}

/// Render and save one heatmap.
///
/// The raw map is written as `.npy` next to the `.jpg` when `save_npy` is set.
/// Normalisation uses `bounds` when given and the map's own extremes otherwise.
pub fn write_heatmap(
    path: &Path,
    map: &Array2<f32>,
    raw_image: &RgbImage,
    bounds: Option<&SaliencyBounds>,
    style: &HeatmapStyle,
    save_npy: bool,
) -> Result<()> {
    if save_npy {
        let npy_path = path.with_extension("npy");
        write_npy(&npy_path, map)
            .with_context(|| format!("Failed to write {}", npy_path.display()))?;
        debug!("Saved raw saliency to {}", npy_path.display());
    }

    let normalized = match bounds {
        Some(bounds) => normalize_with_bounds(map, bounds),
        None => normalize(map),
    };
    let rendered = render_heatmap(&normalized, raw_image, style)?;
    save_jpeg(path, &rendered, HEATMAP_JPEG_QUALITY)
}

/// Square window of `size` around a pixel.
///
/// The low edges are clamped at zero; the high edges are only cut by the
/// image itself, so windows near the top-left corner come out smaller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CropWindow {
    pub rows: Range<usize>,
    pub cols: Range<usize>,
}

impl CropWindow {
    pub fn height(&self) -> usize {
        self.rows.len()
    }

    pub fn width(&self) -> usize {
        self.cols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty() || self.cols.is_empty()
    }
}

pub fn crop_window(center: Pixel, size: usize, height: usize, width: usize) -> CropWindow {
    let half = size / 2;
    let span = |c: usize, limit: usize| {
        let start = c.saturating_sub(half).min(limit);
        let end = (c + half).min(limit);
        start..end.max(start)
    };
    CropWindow {
        rows: span(center.row, height),
        cols: span(center.col, width),
    }
}

pub fn crop_map(map: &Array2<f32>, center: Pixel, size: usize) -> Result<Array2<f32>> {
    let (height, width) = map.dim();
    let window = crop_window(center, size, height, width);
    ensure!(
        !window.is_empty(),
        "Crop of size {size} around ({},{}) is empty for a {height}x{width} map",
        center.row,
        center.col
    );
    Ok(map
        .slice(s![window.rows.clone(), window.cols.clone()])
        .to_owned())
}

pub fn crop_image(image: &RgbImage, center: Pixel, size: usize) -> Result<RgbImage> {
    let (height, width) = (image.height() as usize, image.width() as usize);
    let window = crop_window(center, size, height, width);
    ensure!(
        !window.is_empty(),
        "Crop of size {size} around ({},{}) is empty for a {height}x{width} image",
        center.row,
        center.col
    );
    Ok(image::imageops::crop_imm(
        image,
        window.cols.start as u32,
        window.rows.start as u32,
        window.width() as u32,
        window.height() as u32,
    )
    .to_image())
}

/// Element-wise product of the maps, divided by its maximum when positive
pub fn combine_layers(maps: &[Array2<f32>]) -> Result<Array2<f32>> {
    let (first, rest) = maps
        .split_first()
        .context("Cannot combine an empty list of saliency maps")?;

    let mut combined = first.clone();
    for map in rest {
        ensure!(
            map.dim() == combined.dim(),
            "Cannot combine saliency maps of shapes {:?} and {:?}",
            combined.dim(),
            map.dim()
        );
        combined *= map;
    }

    let max = combined.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if max > 0.0 {
        combined /= max;
    }
    Ok(combined)
}

/// Source index pair and weight of the second one for output index `i`
fn sample_axis(i: usize, scale: f32, len: usize) -> (usize, usize, f32) {
    let pos = ((i as f32 + 0.5) * scale - 0.5).clamp(0.0, (len - 1) as f32);
    let lo = pos.floor() as usize;
    (lo, (lo + 1).min(len - 1), pos - lo as f32)
}

/// Resize a map to `(height, width)` with pixel-centre aligned sampling
pub fn upsample_bilinear(map: &Array2<f32>, height: usize, width: usize) -> Array2<f32> {
    let (rows, cols) = map.dim();
    if (rows, cols) == (height, width) || rows == 0 || cols == 0 {
        return map.clone();
    }

    let row_scale = rows as f32 / height as f32;
    let col_scale = cols as f32 / width as f32;
    Array2::from_shape_fn((height, width), |(y, x)| {
        let (r0, r1, fr) = sample_axis(y, row_scale, rows);
        let (c0, c1, fc) = sample_axis(x, col_scale, cols);
        let top = map[[r0, c0]] + (map[[r0, c1]] - map[[r0, c0]]) * fc;
        let bottom = map[[r1, c0]] + (map[[r1, c1]] - map[[r1, c0]]) * fc;
        top + (bottom - top) * fr
    })
}
