//! Pixel query selection.
//!
//! Saliency queries are (row, column) points in input-image space. They come from
//! explicit coordinate lists, half-open ranges, or the cartesian product of both
//! axes. When saliency is restricted to the pixels of one class, `select_bounded`
//! samples a few of them spread over coarse spatial bins so the queries do not
//! cluster in one region.

use anyhow::{bail, ensure, Result};
use rand::rngs::StdRng;
use rand::seq::index;
use rand::SeedableRng;
use serde::Serialize;
use std::collections::HashMap;

/// Edge length of the spatial bins used by `select_bounded`
pub const DEFAULT_BIN_SIZE: usize = 300;

/// A (row, column) coordinate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Pixel {
    pub row: usize,
    pub col: usize,
}

impl Pixel {
    pub fn new(row: usize, col: usize) -> Self {
        Self { row, col }
    }
}

/// Half-open integer range `[start, end)` walked with a positive step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IndexRange {
    pub start: usize,
    pub end: usize,
    pub step: usize,
}

impl IndexRange {
    pub fn new(start: usize, end: usize, step: usize) -> Result<Self> {
        ensure!(step > 0, "Range step must be positive (got [{start}, {end}) step 0)");
        Ok(Self { start, end, step })
    }

    /// Build a range from the `START END STEP` triple accepted on the command line
    pub fn from_triple(values: &[usize]) -> Result<Self> {
        match values {
            [start, end, step] => Self::new(*start, *end, *step),
            _ => bail!(
                "Expected a range as START END STEP, got {} value(s)",
                values.len()
            ),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> {
        (self.start..self.end).step_by(self.step)
    }
}

/// How one axis of the query set is given
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum AxisSpec {
    List(Vec<usize>),
    Range(IndexRange),
}

impl AxisSpec {
    /// Resolve one axis from its explicit list and its range.
    ///
    /// Supplying both is an error; supplying neither yields `None`.
    pub fn resolve(axis: &str, list: &[usize], range: Option<IndexRange>) -> Result<Option<Self>> {
        match (list.is_empty(), range) {
            (false, Some(_)) => bail!(
                "Can only specify list of numbers (--pixel-{axis}) OR a range (--pixel-{axis}-range)"
            ),
            (false, None) => Ok(Some(AxisSpec::List(list.to_vec()))),
            (true, Some(range)) => Ok(Some(AxisSpec::Range(range))),
            (true, None) => Ok(None),
        }
    }

    pub fn values(&self) -> Vec<usize> {
        match self {
            AxisSpec::List(values) => values.clone(),
            AxisSpec::Range(range) => range.iter().collect(),
        }
    }
}

/// Both axes of a pixel query set
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PixelSpec {
    pub rows: AxisSpec,
    pub cols: AxisSpec,
    pub cartesian: bool,
}

impl PixelSpec {
    pub fn pixels(&self) -> Vec<Pixel> {
        select_pixels(&self.rows, &self.cols, self.cartesian)
    }
}

/// Build the ordered query set from explicit lists and/or ranges.
///
/// Fails when an axis has both a list and a range, or neither.
pub fn select(
    explicit_rows: &[usize],
    explicit_cols: &[usize],
    row_range: Option<IndexRange>,
    col_range: Option<IndexRange>,
    cartesian: bool,
) -> Result<Vec<Pixel>> {
    let rows = AxisSpec::resolve("i", explicit_rows, row_range)?;
    let cols = AxisSpec::resolve("j", explicit_cols, col_range)?;
    match (rows, cols) {
        (Some(rows), Some(cols)) => Ok(select_pixels(&rows, &cols, cartesian)),
        _ => bail!("Must specify --pixel-i (or --pixel-i-range) and --pixel-j (or --pixel-j-range)"),
    }
}

/// Pair the two axes up.
///
/// With `cartesian` every column is visited in order and, for each, every row;
/// otherwise rows and columns are zipped and the longer axis is truncated.
pub fn select_pixels(rows: &AxisSpec, cols: &AxisSpec, cartesian: bool) -> Vec<Pixel> {
    let rows = rows.values();
    let cols = cols.values();

    if cartesian {
        cols.iter()
            .flat_map(|&col| rows.iter().map(move |&row| Pixel::new(row, col)))
            .collect()
    } else {
        rows.into_iter()
            .zip(cols)
            .map(|(row, col)| Pixel::new(row, col))
            .collect()
    }
}

/// Pick at most `n` candidates, one per spatial bin.
///
/// Candidates are bucketed by `(row / bin_size, col / bin_size)`. When there are
/// more than `n` bins, `n` of them are drawn at random; then one pixel is drawn
/// from each chosen bin. The generator is seeded with `seed`, so identical
/// inputs always give identical output.
pub fn select_bounded(
    n: usize,
    candidates: &[Pixel],
    bin_size: usize,
    seed: u64,
) -> Result<Vec<Pixel>> {
    ensure!(bin_size > 0, "Spatial bin size must be positive");

    // Bins keep first-seen order so the draw below is reproducible
    let mut bin_order: Vec<(usize, usize)> = Vec::new();
    let mut bins: HashMap<(usize, usize), Vec<Pixel>> = HashMap::new();
    for &pixel in candidates {
        let key = (pixel.row / bin_size, pixel.col / bin_size);
        bins.entry(key)
            .or_insert_with(|| {
                bin_order.push(key);
                Vec::new()
            })
            .push(pixel);
    }

    let mut rng = StdRng::seed_from_u64(seed);

    let chosen: Vec<(usize, usize)> = if n >= bin_order.len() {
        bin_order
    } else {
        index::sample(&mut rng, bin_order.len(), n)
            .into_iter()
            .map(|i| bin_order[i])
            .collect()
    };

    let pixels = chosen
        .iter()
        .map(|key| {
            let members = &bins[key];
            let pick = index::sample(&mut rng, members.len(), 1).index(0);
            members[pick]
        })
        .collect();

    Ok(pixels)
}

/// Map an input-space pixel to the model's output grid.
///
/// Each coordinate is scaled by `output / input` and floored.
pub fn compute_output_coord(
    pixel: Pixel,
    input_size: (usize, usize),
    output_size: (usize, usize),
) -> Pixel {
    let ratio_i = output_size.0 as f64 / input_size.0 as f64;
    let ratio_j = output_size.1 as f64 / input_size.1 as f64;
    Pixel::new(
        (pixel.row as f64 * ratio_i).floor() as usize,
        (pixel.col as f64 * ratio_j).floor() as usize,
    )
}

/// The image indices to visit: the range when given, otherwise the single index
pub fn image_indices(index: usize, range: Option<IndexRange>) -> Vec<usize> {
    match range {
        Some(range) => range.iter().collect(),
        None => vec![index],
    }
}
