pub mod archive;
pub mod bounds;
pub mod color_utils;
pub mod config;
pub mod dataset;
pub mod heatmap;
pub mod hierarchy;
pub mod model;
#[cfg(feature = "onnx")]
pub mod onnx_model;
pub mod output_paths;
pub mod overlap;
pub mod pixels;
pub mod run_metadata;
pub mod saliency;
pub mod visualize;
