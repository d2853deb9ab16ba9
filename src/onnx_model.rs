//! ONNX Runtime model backend.
//!
//! Every 4-D output of the graph is exposed as an activation (batch dimension
//! dropped). Gradients are only available for the logits output: the target
//! score is a sum of head logits, so its derivative with respect to the class
//! logits is a fixed 0/1 pattern, scaled by 1/|child| for hierarchy-node heads.

use anyhow::{anyhow, ensure, Context, Result};
use log::{debug, info, warn, Level};
use ndarray::{Array3, Array4, Axis, Ix4};
use ort::execution_providers::{
    CPUExecutionProvider, CUDAExecutionProvider, ExecutionProvider,
    ExecutionProviderDispatch,
};
use ort::logging::LogLevel;
use ort::session::Session;
use ort::value::Value;
use std::collections::HashMap;
use std::path::Path;

use crate::color_utils::Marker;
use crate::dataset::Sample;
use crate::saliency::{GradientQuery, OutputHead, SegmentationModel};

const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const STD: [f32; 3] = [0.229, 0.224, 0.225];

fn log_level_from_ort(level: LogLevel) -> Level {
    match level {
        LogLevel::Verbose => Level::Trace,
        LogLevel::Info => Level::Trace,
        LogLevel::Warning => Level::Debug,
        LogLevel::Error => Level::Info,
        LogLevel::Fatal => Level::Error,
    }
}

fn execution_providers(device: &str) -> Vec<ExecutionProviderDispatch> {
    let cuda_available = matches!(CUDAExecutionProvider::default().is_available(), Ok(true));
    match device {
        "auto" if cuda_available => {
            info!("Auto-selected CUDA execution provider");
            vec![
                CUDAExecutionProvider::default().build(),
                CPUExecutionProvider::default().build(),
            ]
        }
        "auto" | "cpu" => {
            debug!("Using CPU execution provider");
            vec![CPUExecutionProvider::default().build()]
        }
        "cuda" if cuda_available => vec![
            CUDAExecutionProvider::default().build(),
            CPUExecutionProvider::default().build(),
        ],
        "cuda" => {
            warn!("{}CUDA not available, falling back to CPU", Marker::Warning.prefix());
            vec![CPUExecutionProvider::default().build()]
        }
        other => {
            warn!("{}Unknown device '{other}', using CPU", Marker::Warning.prefix());
            vec![CPUExecutionProvider::default().build()]
        }
    }
}

/// NCHW tensor with ImageNet normalisation
pub fn preprocess(sample: &Sample) -> Array4<f32> {
    let (height, width) = sample.size();
    Array4::from_shape_fn((1, 3, height, width), |(_, c, y, x)| {
        let value = sample.image.get_pixel(x as u32, y as u32)[c] as f32 / 255.0;
        (value - MEAN[c]) / STD[c]
    })
}

/// Derivative of the target score with respect to the class logits `(C, h, w)`
pub fn logit_gradient(num_classes: usize, query: &GradientQuery) -> Result<Array3<f32>> {
    let mask = query.target.mask(query.predicted)?;
    let (height, width) = mask.dim();
    let mut grad = Array3::zeros((num_classes, height, width));

    for ((y, x), &weight) in mask.indexed_iter() {
        if weight == 0.0 {
            continue;
        }
        let predicted = query.predicted[[y, x]];
        match query.head {
            OutputHead::Classes => {
                ensure!(
                    predicted < num_classes,
                    "Predicted class {predicted} exceeds {num_classes} logits"
                );
                grad[[predicted, y, x]] = weight;
            }
            OutputHead::Node(node) => {
                let child = node
                    .children
                    .get(predicted)
                    .with_context(|| format!("Node {} has no child {predicted}", node.wnid))?;
                let share = weight / child.classes.len() as f32;
                for &cls in &child.classes {
                    ensure!(cls < num_classes, "Class {cls} exceeds {num_classes} logits");
                    grad[[cls, y, x]] = share;
                }
            }
        }
    }
    Ok(grad)
}

pub struct OnnxModel {
    session: Session,
    input_name: String,
    output_names: Vec<String>,
    logits_output: String,
    activations: HashMap<String, Array3<f32>>,
}

impl OnnxModel {
    /// Load the model; `logits_output` defaults to the first graph output
    pub fn load(path: &Path, device: &str, logits_output: Option<&str>) -> Result<Self> {
        let providers = execution_providers(device);
        let session = Session::builder()
            .map_err(|e| anyhow!("Failed to create session builder: {}", e))?
            .with_logger(Box::new(|level, _, _, _, msg| {
                log::log!(log_level_from_ort(level), "[onnx] {msg}")
            }))
            .map_err(|e| anyhow!("Failed to set logger: {}", e))?
            .with_execution_providers(providers)
            .map_err(|e| anyhow!("Failed to set execution providers: {}", e))?
            .commit_from_file(path)
            .map_err(|e| anyhow!("Failed to load ONNX model {}: {}", path.display(), e))?;

        let input_name = session
            .inputs
            .first()
            .map(|input| input.name.clone())
            .context("ONNX model has no inputs")?;
        let output_names: Vec<String> = session.outputs.iter().map(|o| o.name.clone()).collect();
        let logits_output = resolve_logits_output(logits_output, &output_names)?;

        info!(
            "=> loading model from {} (logits: {logits_output})",
            path.display()
        );
        Ok(Self {
            session,
            input_name,
            output_names,
            logits_output,
            activations: HashMap::new(),
        })
    }
}

/// The configured logits output, or the first graph output.
///
/// This is also the default target layer: it is the only output the backend can
/// differentiate, even when auxiliary heads follow it.
fn resolve_logits_output(requested: Option<&str>, outputs: &[String]) -> Result<String> {
    match requested {
        Some(name) => {
            ensure!(
                outputs.iter().any(|o| o == name),
                "ONNX model has no output '{name}'. Outputs: {}",
                outputs.join(", ")
            );
            Ok(name.to_string())
        }
        None => outputs.first().cloned().context("ONNX model has no outputs"),
    }
}

impl SegmentationModel for OnnxModel {
    fn layer_names(&self) -> Vec<String> {
        self.output_names.clone()
    }

    fn default_target_layer(&self) -> Option<String> {
        Some(self.logits_output.clone())
    }

    fn forward(&mut self, sample: &Sample) -> Result<Array3<f32>> {
        let input_value = Value::from_array(preprocess(sample))
            .map_err(|e| anyhow!("Failed to create input value: {}", e))?;
        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => &input_value])
            .map_err(|e| anyhow!("Failed to run inference: {}", e))?;

        self.activations.clear();
        for name in &self.output_names {
            let view = outputs[name.as_str()]
                .try_extract_array::<f32>()
                .map_err(|e| anyhow!("Failed to extract output {name}: {}", e))?;
            match view.into_dimensionality::<Ix4>() {
                Ok(view) => {
                    let tensor: Array3<f32> = view.index_axis(Axis(0), 0).to_owned();
                    self.activations.insert(name.clone(), tensor);
                }
                Err(_) => debug!("Skipping non-spatial output {name}"),
            }
        }

        self.activations
            .get(&self.logits_output)
            .cloned()
            .with_context(|| format!("Logits output {} is not (1, C, h, w)", self.logits_output))
    }

    fn activation(&self, layer: &str) -> Result<Array3<f32>> {
        self.activations
            .get(layer)
            .cloned()
            .with_context(|| format!("No activation for output {layer}; run forward first"))
    }

    fn gradient(&mut self, layer: &str, query: &GradientQuery) -> Result<Array3<f32>> {
        ensure!(
            layer == self.logits_output,
            "The ONNX backend only differentiates the logits output '{}', not '{layer}'",
            self.logits_output
        );
        let logits = self.activation(layer)?;
        logit_gradient(logits.dim().0, query)
    }
}
