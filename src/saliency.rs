//! Gradient-based saliency over a segmentation model.
//!
//! The model is a black box behind [`SegmentationModel`]: it produces class
//! logits, exposes per-layer activations and returns the gradient of a target
//! score with respect to a layer. [`Saliency`] drives it through the
//! forward / backward / generate cycle and turns activations and gradients into
//! a map with one of the [`SaliencyMethod`] formulas.

use anyhow::{bail, ensure, Context, Result};
use clap::ValueEnum;
use log::debug;
use ndarray::{Array2, Array3, Axis};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

use crate::dataset::Sample;
use crate::heatmap::upsample_bilinear;
use crate::hierarchy::HierarchyNode;
use crate::pixels::Pixel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
pub enum SaliencyMethod {
    #[value(name = "GradPAM")]
    #[serde(rename = "GradPAM")]
    GradPam,
    #[value(name = "GradPAMWhole")]
    #[serde(rename = "GradPAMWhole")]
    GradPamWhole,
    #[value(name = "SegNormGrad")]
    #[serde(rename = "SegNormGrad")]
    SegNormGrad,
    #[value(name = "SegNormGradWhole")]
    #[serde(rename = "SegNormGradWhole")]
    SegNormGradWhole,
    #[value(name = "GradCAM")]
    #[serde(rename = "GradCAM")]
    GradCam,
    #[value(name = "SegGradCAM")]
    #[serde(rename = "SegGradCAM")]
    SegGradCam,
}

impl SaliencyMethod {
    pub fn name(&self) -> &'static str {
        match self {
            SaliencyMethod::GradPam => "GradPAM",
            SaliencyMethod::GradPamWhole => "GradPAMWhole",
            SaliencyMethod::SegNormGrad => "SegNormGrad",
            SaliencyMethod::SegNormGradWhole => "SegNormGradWhole",
            SaliencyMethod::GradCam => "GradCAM",
            SaliencyMethod::SegGradCam => "SegGradCAM",
        }
    }

    /// One map per image rather than one per query pixel
    pub fn whole_image(&self) -> bool {
        matches!(
            self,
            SaliencyMethod::GradPamWhole | SaliencyMethod::SegNormGradWhole
        )
    }

    /// Backward target for a query at `pixel` (output coordinates)
    pub fn target_at(&self, pixel: Pixel) -> BackwardTarget {
        match self {
            SaliencyMethod::SegGradCam => BackwardTarget::Segment(pixel),
            _ => BackwardTarget::Pixel(pixel),
        }
    }

    /// Saliency at feature resolution from a layer's activation and gradient
    pub fn compute(&self, activation: &Array3<f32>, gradient: &Array3<f32>) -> Result<Array2<f32>> {
        ensure!(
            activation.dim() == gradient.dim(),
            "Activation {:?} and gradient {:?} differ in shape",
            activation.dim(),
            gradient.dim()
        );
        let (_, height, width) = activation.dim();

        let map = match self {
            SaliencyMethod::GradCam | SaliencyMethod::SegGradCam => {
                let weights = gradient
                    .mean_axis(Axis(2))
                    .and_then(|m| m.mean_axis(Axis(1)))
                    .context("Gradient has no spatial extent")?;
                let mut map: Array2<f32> = Array2::zeros((height, width));
                for (k, &w) in weights.iter().enumerate() {
                    map.scaled_add(w, &activation.index_axis(Axis(0), k));
                }
                map.mapv_into(relu)
            }
            SaliencyMethod::GradPam | SaliencyMethod::GradPamWhole => {
                (activation * gradient).sum_axis(Axis(0)).mapv_into(relu)
            }
            SaliencyMethod::SegNormGrad | SaliencyMethod::SegNormGradWhole => {
                let act_norm = activation.mapv(|v| v * v).sum_axis(Axis(0)).mapv_into(f32::sqrt);
                let grad_norm = gradient.mapv(|v| v * v).sum_axis(Axis(0)).mapv_into(f32::sqrt);
                act_norm * grad_norm
            }
        };
        Ok(map)
    }
}

impl fmt::Display for SaliencyMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn relu(v: f32) -> f32 {
    v.max(0.0)
}

/// What the backward pass differentiates, in output-tensor coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackwardTarget {
    /// The predicted score at one pixel
    Pixel(Pixel),
    /// The predicted scores of every pixel sharing this pixel's prediction
    Segment(Pixel),
    /// Every pixel at its predicted label
    Whole,
}

impl BackwardTarget {
    /// Stable name used to look up stored gradients
    pub fn key(&self) -> String {
        match self {
            BackwardTarget::Pixel(p) => format!("pixel_i-{}-pixel_j-{}", p.row, p.col),
            BackwardTarget::Segment(p) => format!("segment_i-{}-segment_j-{}", p.row, p.col),
            BackwardTarget::Whole => "whole".to_string(),
        }
    }

    /// 0/1 mask of output pixels whose scores form the target
    pub fn mask(&self, predicted: &Array2<usize>) -> Result<Array2<f32>> {
        let (height, width) = predicted.dim();
        let in_bounds = |p: &Pixel| {
            ensure!(
                p.row < height && p.col < width,
                "Output pixel ({},{}) is outside the {height}x{width} prediction",
                p.row,
                p.col
            );
            Ok(())
        };
        match self {
            BackwardTarget::Pixel(p) => {
                in_bounds(p)?;
                let mut mask = Array2::zeros((height, width));
                mask[[p.row, p.col]] = 1.0;
                Ok(mask)
            }
            BackwardTarget::Segment(p) => {
                in_bounds(p)?;
                let class = predicted[[p.row, p.col]];
                Ok(predicted.mapv(|c| if c == class { 1.0 } else { 0.0 }))
            }
            BackwardTarget::Whole => Ok(Array2::ones((height, width))),
        }
    }
}

/// The output over which predictions and gradients are taken
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum OutputHead {
    #[default]
    Classes,
    Node(HierarchyNode),
}

impl OutputHead {
    pub fn node_wnid(&self) -> Option<&str> {
        match self {
            OutputHead::Classes => None,
            OutputHead::Node(node) => Some(&node.wnid),
        }
    }

    /// Head logits from class logits `(C, h, w)`
    pub fn logits(&self, class_logits: &Array3<f32>) -> Result<Array3<f32>> {
        match self {
            OutputHead::Classes => Ok(class_logits.clone()),
            OutputHead::Node(node) => node.child_logits(class_logits),
        }
    }
}

/// Everything a backend needs to differentiate one target
#[derive(Debug, Clone, Copy)]
pub struct GradientQuery<'a> {
    pub target: &'a BackwardTarget,
    pub head: &'a OutputHead,
    /// Top-1 labels of the active head
    pub predicted: &'a Array2<usize>,
}

pub trait SegmentationModel {
    /// Layers that expose activations, in module order
    fn layer_names(&self) -> Vec<String>;

    /// Layer visualized when none is requested; the last one by default
    fn default_target_layer(&self) -> Option<String> {
        self.layer_names().pop()
    }

    /// Run the network on a sample and return the class logits `(C, h, w)`
    fn forward(&mut self, sample: &Sample) -> Result<Array3<f32>>;

    /// Activation `(K, h', w')` of `layer` from the last forward pass
    fn activation(&self, layer: &str) -> Result<Array3<f32>>;

    /// Gradient of the query's target score with respect to `layer`
    fn gradient(&mut self, layer: &str, query: &GradientQuery) -> Result<Array3<f32>>;
}

#[derive(Debug, Clone)]
pub struct Prediction {
    /// Top-1 index per output pixel
    pub labels: Array2<usize>,
}

impl Prediction {
    pub fn from_logits(logits: &Array3<f32>) -> Self {
        let labels = logits.map_axis(Axis(0), |lane| {
            lane.iter()
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |best, (i, &v)| {
                    if v > best.1 {
                        (i, v)
                    } else {
                        best
                    }
                })
                .0
        });
        Self { labels }
    }

    /// (height, width) of the output grid
    pub fn output_size(&self) -> (usize, usize) {
        self.labels.dim()
    }
}

pub struct Saliency {
    model: Box<dyn SegmentationModel>,
    method: SaliencyMethod,
    layers: Vec<String>,
    head: OutputHead,
    input_size: Option<(usize, usize)>,
    prediction: Option<Prediction>,
    gradients: HashMap<String, Array3<f32>>,
}

impl Saliency {
    pub fn new(
        model: Box<dyn SegmentationModel>,
        method: SaliencyMethod,
        layers: Vec<String>,
    ) -> Result<Self> {
        ensure!(!layers.is_empty(), "No target layers given");
        let known = model.layer_names();
        for layer in &layers {
            ensure!(
                known.contains(layer),
                "Unknown target layer '{layer}'. Available layers: {}",
                known.join(", ")
            );
        }
        Ok(Self {
            model,
            method,
            layers,
            head: OutputHead::Classes,
            input_size: None,
            prediction: None,
            gradients: HashMap::new(),
        })
    }

    pub fn layers(&self) -> &[String] {
        &self.layers
    }

    pub fn head(&self) -> &OutputHead {
        &self.head
    }

    pub fn set_head(&mut self, head: OutputHead) {
        if let Some(wnid) = head.node_wnid() {
            debug!("Using logits from node {wnid}");
        }
        self.head = head;
        self.prediction = None;
        self.gradients.clear();
    }

    pub fn prediction(&self) -> Option<&Prediction> {
        self.prediction.as_ref()
    }

    pub fn forward(&mut self, sample: &Sample) -> Result<&Prediction> {
        let class_logits = self.model.forward(sample)?;
        let logits = self.head.logits(&class_logits)?;
        self.gradients.clear();
        self.input_size = Some(sample.size());
        Ok(&*self.prediction.insert(Prediction::from_logits(&logits)))
    }

    /// Differentiate `target` with respect to every target layer
    pub fn backward(&mut self, target: BackwardTarget) -> Result<()> {
        let Some(prediction) = &self.prediction else {
            bail!("backward called before forward");
        };
        let query = GradientQuery {
            target: &target,
            head: &self.head,
            predicted: &prediction.labels,
        };

        self.gradients.clear();
        for layer in &self.layers {
            let gradient = self
                .model
                .gradient(layer, &query)
                .with_context(|| format!("No gradient for layer {layer} ({})", target.key()))?;
            self.gradients.insert(layer.clone(), gradient);
        }
        Ok(())
    }

    /// Unnormalised saliency of `layer` at input resolution
    pub fn generate(&self, layer: &str) -> Result<Array2<f32>> {
        let gradient = self
            .gradients
            .get(layer)
            .with_context(|| format!("No gradient stored for layer {layer}; run backward first"))?;
        let activation = self.model.activation(layer)?;
        let map = self.method.compute(&activation, gradient)?;

        let (height, width) = self
            .input_size
            .context("generate called before forward")?;
        Ok(upsample_bilinear(&map, height, width))
    }
}
