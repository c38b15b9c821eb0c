//! # Error Types
//!
//! Error taxonomy for the retrieval pipeline. Each stage has its own enum and
//! [`PipelineError`] wraps them for the top-level orchestration.

use crate::storage::StorageError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while searching the catalog or materializing its entries
#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Invalid catalog document: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Catalog table error: {0}")]
    Polars(#[from] polars::prelude::PolarsError),

    #[error("Catalog table has no column '{0}'")]
    MissingColumn(String),

    #[error("Catalog search returned no datasets for {0}")]
    NoMatches(String),

    #[error("Failed to download '{zstore}': {reason}")]
    Download { zstore: String, reason: String },

    #[error("Unsupported zarr dtype '{dtype}' for array '{array}'")]
    UnsupportedDtype { array: String, dtype: String },

    #[error("Invalid zarr metadata in '{zstore}': {reason}")]
    InvalidMetadata { zstore: String, reason: String },
}

/// Errors raised by in-memory dataset operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DatasetError {
    #[error("Cannot merge run '{run}': {detail}")]
    MergeConflict { run: String, detail: String },

    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Dimension '{0}' not found")]
    MissingDimension(String),

    #[error("Variable '{0}' not found")]
    MissingVariable(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),
}

/// Top-level error for a pipeline run
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Dataset(#[from] DatasetError),

    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("netCDF error: {0}")]
    NetCdf(#[from] netcdf::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Experiment '{0}' not found in dataset collection")]
    MissingExperiment(String),

    #[error("Experiment '{experiment}' matches several runs: {keys:?}")]
    AmbiguousExperiment {
        experiment: String,
        keys: Vec<String>,
    },
}

impl PipelineError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PipelineError::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether rerunning the catalog stage unchanged may succeed.
    ///
    /// Remote fetches of the CMIP6 stores are known to fail intermittently.
    /// Merge conflicts, empty searches and local failures are deterministic.
    pub fn is_transient(&self) -> bool {
        match self {
            PipelineError::Catalog(CatalogError::Download { .. }) => true,
            PipelineError::Catalog(CatalogError::Storage(e)) => e.is_transient(),
            _ => false,
        }
    }
}

/// Result type for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;
