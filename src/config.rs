//! Configuration for the node coherence analyzer.

use crate::estimate::{validate_nfft, Limits};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration for a coherence run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Input configuration
    pub input: InputConfig,

    /// Output configuration
    pub output: OutputConfig,

    /// Analysis parameters
    #[serde(default)]
    pub analysis: AnalysisConfig,

    /// Optional admission limits checked before any I/O
    #[serde(default)]
    pub limits: Limits,

    /// Processing configuration
    #[serde(default)]
    pub processing: ProcessingConfig,
}

/// Input time series configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputConfig {
    /// Path to the input series container (Zarr v3 group with a `data` array)
    pub path: String,
}

/// Output Zarr configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Local filesystem path for the result container
    pub path: String,

    /// Compression level (0-22 for zstd)
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,

    /// Replace an existing container at `path`
    #[serde(default)]
    pub overwrite: bool,
}

/// Spectral analysis parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Data points per FFT block. Should be a power of two.
    #[serde(default = "default_nfft")]
    pub nfft: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            nfft: default_nfft(),
        }
    }
}

/// Processing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Enable metrics reporting
    #[serde(default = "default_true")]
    pub enable_metrics: bool,

    /// Optional path to save metrics JSON after run completes
    #[serde(default)]
    pub metrics_output_path: Option<String>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            enable_metrics: true,
            metrics_output_path: None,
        }
    }
}

impl Config {
    /// Minimal configuration for an input and output path.
    pub fn new(input: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            input: InputConfig { path: input.into() },
            output: OutputConfig {
                path: output.into(),
                compression_level: default_compression_level(),
                overwrite: false,
            },
            analysis: AnalysisConfig::default(),
            limits: Limits::default(),
            processing: ProcessingConfig::default(),
        }
    }

    /// Load configuration from a YAML or JSON file.
    /// Format is auto-detected from file extension (.yaml, .yml, or .json).
    pub fn from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let config: Config = match ext {
            "json" => serde_json::from_str(&contents)?,
            // YAML is a superset of JSON
            _ => serde_yaml::from_str(&contents)?,
        };
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Load configuration from a JSON string.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        Ok(config)
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.input.path.trim().is_empty() {
            anyhow::bail!("input.path must be set");
        }
        if self.output.path.trim().is_empty() {
            anyhow::bail!("output.path must be set");
        }
        if PathBuf::from(&self.input.path) == PathBuf::from(&self.output.path) {
            anyhow::bail!("output.path must differ from input.path");
        }
        validate_nfft(self.analysis.nfft)?;
        if self.output.compression_level < 0 || self.output.compression_level > 22 {
            anyhow::bail!("Compression level must be 0-22 for zstd");
        }
        if self.limits.max_memory_bytes == Some(0) || self.limits.max_disk_kilobytes == Some(0) {
            anyhow::bail!("Limits must be > 0 when set");
        }
        Ok(())
    }
}

// Default value functions for serde
fn default_nfft() -> usize { 256 }
fn default_compression_level() -> i32 { 3 }
fn default_true() -> bool { true }
