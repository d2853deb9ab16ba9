//! Per-class saliency overlap.
//!
//! For one saliency map and the ground-truth label map of the same image, the
//! overlap of a class is the average normalised saliency over that class's pixels.
//! The top classes are rendered as a horizontal bar chart.

use ab_glyph::{FontRef, PxScale};
use anyhow::{anyhow, ensure, Context, Result};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_line_segment_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use log::debug;
use ndarray::{Array2, Zip};
use ndarray_npy::write_npy;
use std::collections::BTreeMap;
use std::path::Path;

use crate::heatmap::{normalize, save_jpeg};

/// Label id excluded from overlap statistics
pub const IGNORE_LABEL: u8 = 255;

/// Number of classes shown in the chart
pub const TOP_K: usize = 5;

const CHART_TITLE: &str = "Average saliency per class";
const CHART_XLABEL: &str = "Average Pixel Normalized Saliency";
const CHART_WIDTH: u32 = 640;
const CHART_HEIGHT: u32 = 480;
const CHART_QUALITY: u8 = 90;

static FONT_BYTES: &[u8] = include_bytes!("../fonts/DejaVuSans.ttf");

/// Average normalised saliency for every class present in `label`, except 255
pub fn compute_overlap(label: &Array2<u8>, saliency: &Array2<f32>) -> Result<BTreeMap<u8, f32>> {
    ensure!(
        label.dim() == saliency.dim(),
        "Label map {:?} and saliency map {:?} differ in shape",
        label.dim(),
        saliency.dim()
    );

    let normalized = normalize(saliency);

    let mut sums: BTreeMap<u8, (f64, usize)> = BTreeMap::new();
    Zip::from(label).and(&normalized).for_each(|&cls, &value| {
        let entry = sums.entry(cls).or_insert((0.0, 0));
        entry.0 += value as f64;
        entry.1 += 1;
    });

    if sums.remove(&IGNORE_LABEL).is_none() {
        debug!("No ignore-labelled pixels in this label map");
    }

    Ok(sums
        .into_iter()
        .map(|(cls, (sum, count))| (cls, (sum / count as f64) as f32))
        .collect())
}

/// The `k` classes with the largest overlap, largest first.
///
/// Ties keep the later class id first.
pub fn top_k(overlap: &BTreeMap<u8, f32>, k: usize) -> Vec<(u8, f32)> {
    let mut entries: Vec<(u8, f32)> = overlap.iter().map(|(&c, &v)| (c, v)).collect();
    entries.sort_by(|a, b| a.1.total_cmp(&b.1));
    entries.reverse();
    entries.truncate(k);
    entries
}

fn class_label(class_names: &[&str], cls: u8) -> String {
    class_names
        .get(cls as usize)
        .map(|name| name.to_string())
        .unwrap_or_else(|| cls.to_string())
}

/// Compute overlap, optionally persist it as `(class_id, mass)` rows and draw the chart
pub fn save_overlap(
    npy_path: &Path,
    plot_path: &Path,
    saliency: &Array2<f32>,
    label: &Array2<u8>,
    class_names: &[&str],
    save_npy: bool,
) -> Result<BTreeMap<u8, f32>> {
    let overlap = compute_overlap(label, saliency)?;

    if save_npy {
        let flat: Vec<f32> = overlap
            .iter()
            .flat_map(|(&cls, &mass)| [cls as f32, mass])
            .collect();
        let rows = Array2::from_shape_vec((overlap.len(), 2), flat)?;
        write_npy(npy_path, &rows)
            .with_context(|| format!("Failed to write {}", npy_path.display()))?;
    }

    let bars: Vec<(String, f32)> = top_k(&overlap, TOP_K)
        .into_iter()
        .map(|(cls, mass)| (class_label(class_names, cls), mass))
        .collect();
    let chart = render_bar_chart(&bars)?;
    save_jpeg(plot_path, &chart, CHART_QUALITY)?;

    Ok(overlap)
}

/// Horizontal bar chart. The first bar is drawn at the bottom.
pub fn render_bar_chart(bars: &[(String, f32)]) -> Result<RgbImage> {
    let font = FontRef::try_from_slice(FONT_BYTES).map_err(|e| anyhow!("Font load failed: {e}"))?;
    let text_color = Rgb([0u8, 0, 0]);
    let axis_color = Rgb([0u8, 0, 0]);
    let bar_color = Rgb([31u8, 119, 180]);
    let label_scale = PxScale::from(14.0);
    let title_scale = PxScale::from(18.0);

    let mut img = RgbImage::from_pixel(CHART_WIDTH, CHART_HEIGHT, Rgb([255, 255, 255]));

    // Plot area
    let left = 130i32;
    let right = CHART_WIDTH as i32 - 30;
    let top = 50i32;
    let bottom = CHART_HEIGHT as i32 - 70;
    let plot_width = (right - left) as f32;

    let (title_w, _) = text_size(title_scale, &font, CHART_TITLE);
    draw_text_mut(
        &mut img,
        text_color,
        (CHART_WIDTH as i32 - title_w as i32) / 2,
        15,
        title_scale,
        &font,
        CHART_TITLE,
    );

    let max_value = bars.iter().map(|(_, v)| *v).fold(0.0f32, f32::max);
    let x_max = if max_value > 0.0 { max_value * 1.05 } else { 1.0 };
    let to_x = |value: f32| left as f32 + (value.max(0.0) / x_max) * plot_width;

    if !bars.is_empty() {
        let slot = (bottom - top) as f32 / bars.len() as f32;
        let bar_height = (slot * 0.8).max(1.0);
        for (i, (name, value)) in bars.iter().enumerate() {
            let center = bottom as f32 - slot * (i as f32 + 0.5);
            let y0 = (center - bar_height / 2.0) as i32;
            let width = (to_x(*value) - left as f32).round() as u32;
            if width > 0 {
                draw_filled_rect_mut(
                    &mut img,
                    Rect::at(left, y0).of_size(width, bar_height as u32),
                    bar_color,
                );
            }

            let (label_w, label_h) = text_size(label_scale, &font, name);
            draw_text_mut(
                &mut img,
                text_color,
                left - 8 - label_w as i32,
                center as i32 - label_h as i32 / 2,
                label_scale,
                &font,
                name,
            );
        }
    }

    // Axes
    draw_line_segment_mut(
        &mut img,
        (left as f32, top as f32),
        (left as f32, bottom as f32),
        axis_color,
    );
    draw_line_segment_mut(
        &mut img,
        (left as f32, bottom as f32),
        (right as f32, bottom as f32),
        axis_color,
    );

    for step in 0..=4 {
        let value = x_max * step as f32 / 4.0;
        let x = to_x(value);
        draw_line_segment_mut(
            &mut img,
            (x, bottom as f32),
            (x, bottom as f32 + 5.0),
            axis_color,
        );
        let tick = format!("{value:.2}");
        let (tick_w, _) = text_size(label_scale, &font, &tick);
        draw_text_mut(
            &mut img,
            text_color,
            x as i32 - tick_w as i32 / 2,
            bottom + 8,
            label_scale,
            &font,
            &tick,
        );
    }

    let (xlabel_w, _) = text_size(label_scale, &font, CHART_XLABEL);
    draw_text_mut(
        &mut img,
        text_color,
        left + (right - left - xlabel_w as i32) / 2,
        bottom + 35,
        label_scale,
        &font,
        CHART_XLABEL,
    );

    Ok(img)
}
