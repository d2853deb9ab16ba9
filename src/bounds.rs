//! Running saliency bounds shared by every layer and pixel of one image.
//!
//! Heatmaps of the same image are normalised against these bounds so their
//! colours are comparable.

use ndarray::Array2;
use serde::Serialize;

const INITIAL_MIN: f32 = 0.0;
const INITIAL_MAX: f32 = -1000.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SaliencyBounds {
    pub min: f32,
    pub max: f32,
}

impl Default for SaliencyBounds {
    fn default() -> Self {
        Self {
            min: INITIAL_MIN,
            max: INITIAL_MAX,
        }
    }
}

impl SaliencyBounds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Widen the bounds to include `value` and return them
    pub fn update(&mut self, value: f32) -> (f32, f32) {
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        (self.min, self.max)
    }

    /// Feed the extremes of a saliency map
    pub fn observe(&mut self, map: &Array2<f32>) -> (f32, f32) {
        let (lo, hi) = map
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            });
        if lo.is_finite() {
            self.update(lo);
        }
        if hi.is_finite() {
            self.update(hi);
        }
        (self.min, self.max)
    }
}
