//! Run record written next to the visualizations.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::{ExperimentConfig, RunOptions};
use crate::visualize::RunSummary;

pub const METADATA_FILE: &str = "vis_gradcam.toml";

/// Execution context for a tool invocation
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ExecutionContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub segcam_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_line: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_processing_time_ms: Option<f64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct RunMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionContext>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<toml::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<toml::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outputs: Option<toml::Value>,
}

impl RunMetadata {
    pub fn new(
        options: &RunOptions,
        config: &ExperimentConfig,
        summary: &RunSummary,
        timestamp: DateTime<Utc>,
        elapsed: Duration,
    ) -> Self {
        let execution = ExecutionContext {
            timestamp: Some(timestamp),
            segcam_version: Some(env!("CARGO_PKG_VERSION").to_string()),
            command_line: Some(std::env::args().collect()),
            total_processing_time_ms: Some(elapsed.as_secs_f64() * 1000.0),
        };
        Self {
            execution: Some(execution),
            options: to_value(options, "options"),
            config: to_value(config, "config"),
            outputs: to_value(summary, "outputs"),
        }
    }

    /// Write `vis_gradcam.toml` into `run_dir` and return its path
    pub fn save(&self, run_dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(run_dir)?;
        let path = run_dir.join(METADATA_FILE);
        let content = toml::to_string_pretty(self)
            .context("Failed to serialize run metadata to TOML")?;
        fs::write(&path, content)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        log::debug!("Saved run metadata to {}", path.display());
        Ok(path)
    }
}

fn to_value<T: Serialize>(value: &T, section: &str) -> Option<toml::Value> {
    match toml::Value::try_from(value) {
        Ok(value) => Some(value),
        Err(e) => {
            log::warn!("Leaving [{section}] out of the run metadata: {e}");
            None
        }
    }
}
