//! # Pipeline Configuration
//!
//! Paths, catalog location, experiment names, time cutoff and retry policy for
//! a retrieval run. Configuration is layered: built-in defaults, then a JSON or
//! YAML file, then `CM4FETCH_*` environment variables, then command-line flags.
//!
//! ## Example
//!
//! ```rust,no_run
//! use cm4fetch::config::PipelineConfig;
//!
//! let config = PipelineConfig::from_file("cm4fetch.yaml")?.with_env_overrides()?;
//! println!("Writing to {}", config.output_path().display());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ```yaml
//! project_root: /home/user/GPLLJ
//! scratch_dir: /scratch/user/GPLLJ-Scratch
//! output_file: GFDL-CM4.nc
//! time_cutoff: 2015-01-01
//! retry:
//!   max_attempts: 3
//!   initial_backoff_ms: 2000
//!   multiplier: 2.0
//! ```

use crate::error::PipelineError;
use crate::query::{experiment_query, FilterSpec, PERTURBED_EXPERIMENT, REFERENCE_EXPERIMENT};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Pangeo CMIP6 ESM collection on Google Cloud Storage
pub const DEFAULT_CATALOG_URL: &str = "https://storage.googleapis.com/cmip6/pangeo-cmip6.json";
pub const DEFAULT_PROJECT_ROOT: &str = "/home/valencig/GPLLJ/";
pub const DEFAULT_SCRATCH_DIR: &str = "/scratch/valencig/GPLLJ-Scratch/";
pub const DEFAULT_OUTPUT_FILE: &str = "GFDL-CM4.nc";

/// Prefix of every environment variable read by [`PipelineConfig::with_env_overrides`]
pub const ENV_PREFIX: &str = "CM4FETCH_";

fn default_project_root() -> PathBuf {
    PathBuf::from(DEFAULT_PROJECT_ROOT)
}

fn default_scratch_dir() -> PathBuf {
    PathBuf::from(DEFAULT_SCRATCH_DIR)
}

fn default_output_file() -> PathBuf {
    PathBuf::from(DEFAULT_OUTPUT_FILE)
}

fn default_catalog_url() -> String {
    DEFAULT_CATALOG_URL.to_string()
}

fn default_reference() -> String {
    REFERENCE_EXPERIMENT.to_string()
}

fn default_perturbed() -> String {
    PERTURBED_EXPERIMENT.to_string()
}

/// Excludes the single 2015 day present in the amip-p4K run.
fn default_time_cutoff() -> NaiveDate {
    NaiveDate::from_ymd_opt(2015, 1, 1).unwrap_or_default()
}

fn default_deflate_level() -> Option<i32> {
    Some(4)
}

/// Retry-with-backoff for the catalog stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff_ms: 2000,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        RetryPolicy {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before attempt `attempt + 1`, where `attempt` starts at 1.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.saturating_sub(1) as i32);
        Duration::from_millis((self.initial_backoff_ms as f64 * factor) as u64)
    }
}

/// Complete configuration of a retrieval run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Base for relative paths (replaces changing the working directory)
    #[serde(default = "default_project_root")]
    pub project_root: PathBuf,
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,
    /// Output archive; relative names resolve against `scratch_dir`
    #[serde(default = "default_output_file")]
    pub output_file: PathBuf,
    #[serde(default = "default_catalog_url")]
    pub catalog_url: String,
    #[serde(default = "default_reference")]
    pub reference_experiment: String,
    #[serde(default = "default_perturbed")]
    pub perturbed_experiment: String,
    /// First date excluded from the exported time window
    #[serde(default = "default_time_cutoff")]
    pub time_cutoff: NaiveDate,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Deflate level for data variables; `None` writes uncompressed
    #[serde(default = "default_deflate_level")]
    pub deflate_level: Option<i32>,
    /// Default log level when neither `--verbose` nor `--quiet` is given
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default)]
    pub show_progress: Option<bool>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            project_root: default_project_root(),
            scratch_dir: default_scratch_dir(),
            output_file: default_output_file(),
            catalog_url: default_catalog_url(),
            reference_experiment: default_reference(),
            perturbed_experiment: default_perturbed(),
            time_cutoff: default_time_cutoff(),
            retry: RetryPolicy::default(),
            deflate_level: default_deflate_level(),
            log_level: None,
            show_progress: None,
        }
    }
}

impl PipelineConfig {
    /// Loads a configuration from a JSON or YAML file, chosen by extension.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, PipelineError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml(&content),
            _ => Self::from_json(&content),
        }
    }

    pub fn from_json(json_str: &str) -> Result<Self, PipelineError> {
        serde_json::from_str(json_str)
            .map_err(|e| PipelineError::Config(format!("invalid JSON configuration: {}", e)))
    }

    pub fn from_yaml(yaml_str: &str) -> Result<Self, PipelineError> {
        serde_yaml::from_str(yaml_str)
            .map_err(|e| PipelineError::Config(format!("invalid YAML configuration: {}", e)))
    }

    pub fn to_json(&self) -> Result<String, PipelineError> {
        serde_json::to_string_pretty(self).map_err(|e| PipelineError::Config(e.to_string()))
    }

    pub fn to_yaml(&self) -> Result<String, PipelineError> {
        serde_yaml::to_string(self).map_err(|e| PipelineError::Config(e.to_string()))
    }

    /// Applies `CM4FETCH_*` environment variables from the process environment.
    pub fn with_env_overrides(self) -> Result<Self, PipelineError> {
        self.with_overrides_from(|key| env::var(format!("{}{}", ENV_PREFIX, key)).ok())
    }

    /// Applies overrides from a lookup keyed by the variable name without prefix.
    pub fn with_overrides_from<F>(mut self, lookup: F) -> Result<Self, PipelineError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("PROJECT_ROOT") {
            self.project_root = PathBuf::from(v);
        }
        if let Some(v) = get("SCRATCH_DIR") {
            self.scratch_dir = PathBuf::from(v);
        }
        if let Some(v) = get("OUTPUT") {
            self.output_file = PathBuf::from(v);
        }
        if let Some(v) = get("CATALOG_URL") {
            self.catalog_url = v;
        }
        if let Some(v) = get("TIME_CUTOFF") {
            self.time_cutoff = NaiveDate::parse_from_str(v.trim(), "%Y-%m-%d").map_err(|e| {
                PipelineError::Config(format!("invalid {}TIME_CUTOFF '{}': {}", ENV_PREFIX, v, e))
            })?;
        }
        if let Some(v) = get("MAX_ATTEMPTS") {
            self.retry.max_attempts = v.trim().parse().map_err(|e| {
                PipelineError::Config(format!("invalid {}MAX_ATTEMPTS '{}': {}", ENV_PREFIX, v, e))
            })?;
        }
        if let Some(v) = get("LOG_LEVEL") {
            self.log_level = Some(v);
        }
        Ok(self)
    }

    /// Catalog query for the configured reference and perturbed experiments.
    pub fn query(&self) -> FilterSpec {
        experiment_query(&self.reference_experiment, &self.perturbed_experiment)
    }

    /// Checks values that serde cannot.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.retry.max_attempts == 0 {
            return Err(PipelineError::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.reference_experiment == self.perturbed_experiment {
            return Err(PipelineError::Config(format!(
                "reference and perturbed experiments are both '{}'",
                self.reference_experiment
            )));
        }
        if let Some(level) = self.deflate_level {
            if !(0..=9).contains(&level) {
                return Err(PipelineError::Config(format!(
                    "deflate_level {} outside 0..=9",
                    level
                )));
            }
        }
        if self.output_file.as_os_str().is_empty() {
            return Err(PipelineError::Config("output_file is empty".to_string()));
        }
        Ok(())
    }

    /// Resolves a path against `project_root` unless it is absolute.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_root.join(path)
        }
    }

    pub fn scratch_path(&self) -> PathBuf {
        self.resolve(&self.scratch_dir)
    }

    /// Destination archive: absolute `output_file`, or `output_file` inside the scratch directory.
    pub fn output_path(&self) -> PathBuf {
        if self.output_file.is_absolute() {
            self.output_file.clone()
        } else {
            self.scratch_path().join(&self.output_file)
        }
    }

    pub fn data_dir(&self) -> PathBuf {
        self.project_root.join("data")
    }

    pub fn figure_dir(&self) -> PathBuf {
        self.project_root.join("figures")
    }
}
