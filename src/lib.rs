//! # cm4fetch
//!
//! A Rust library for retrieving the GFDL-CM4 `amip` and `amip-p4K` daily
//! fields from the Pangeo CMIP6 cloud catalog and archiving them as a single
//! regionally masked netCDF file.
//!
//! ## Pipeline
//!
//! - **Query**: facet constraints for the catalog search ([`query`])
//! - **Resolve**: catalog search, zarr materialization and per-run merge, retried on transient failures ([`resolver`])
//! - **Mask**: North America and the adjacent oceans, lon -170..-20, lat 10..70 ([`region`])
//! - **Export**: time cut, `forcing` concatenation (+0K, +4K), masking and netCDF output ([`export`])
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use cm4fetch::{config::PipelineConfig, run_pipeline};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let config = PipelineConfig::from_file("cm4fetch.yaml")?;
//! let report = run_pipeline(&config, None).await?;
//! println!("{} ({:.3} GB)", report.path.display(), report.size_gb);
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration Example
//!
//! ```yaml
//! project_root: /home/me/GPLLJ/
//! scratch_dir: /scratch/me/GPLLJ-Scratch/
//! output_file: GFDL-CM4.nc
//! catalog_url: https://storage.googleapis.com/cmip6/pangeo-cmip6.json
//! time_cutoff: 2015-01-01
//! retry:
//!   max_attempts: 3
//!   initial_backoff_ms: 2000
//!   multiplier: 2.0
//! ```

pub mod catalog;
pub mod cftime;
pub mod cli;
pub mod combine;
pub mod config;
pub mod dataset;
pub mod error;
pub mod export;
pub mod info;
pub mod log;
pub mod output;
pub mod query;
pub mod region;
pub mod resolver;
pub mod storage;
pub mod zarr;

#[cfg(test)]
mod cli_tests;

use crate::config::PipelineConfig;
use crate::error::PipelineResult;
use crate::export::{export, ExportOptions, ExportReport};
use crate::region::cm4_region_mask;
use crate::resolver::CatalogResolver;
use crate::zarr::{DatasetSource, ZarrStoreSource};
use std::path::PathBuf;

/// Runs the full retrieval against the configured catalog.
///
/// This function orchestrates the entire pipeline:
/// 1. Builds the GFDL-CM4 catalog query for the configured experiments
/// 2. Resolves it into one merged dataset per simulation run
/// 3. Builds the regional mask
/// 4. Exports the reference and perturbed runs to one netCDF file
///
/// # Arguments
///
/// * `config` - Locations, experiments, time cutoff and retry settings
/// * `destination` - Output path overriding the configured one, relative paths
///   resolved against the project root
///
/// # Returns
///
/// The written file's path and size, or the first non-retryable error.
pub async fn run_pipeline(
    config: &PipelineConfig,
    destination: Option<PathBuf>,
) -> PipelineResult<ExportReport> {
    run_pipeline_with(config, ZarrStoreSource::new(), destination).await
}

/// As [`run_pipeline`], materializing catalog entries through `source`.
pub async fn run_pipeline_with<S: DatasetSource>(
    config: &PipelineConfig,
    source: S,
    destination: Option<PathBuf>,
) -> PipelineResult<ExportReport> {
    let query = config.query();
    let resolver = CatalogResolver::new(&config.catalog_url, source)
        .with_retry(config.retry.clone())
        .with_progress(config.show_progress.unwrap_or(true));
    let collection = resolver.resolve(&query).await?;

    let regions = cm4_region_mask();
    let options = ExportOptions::from_config(config, destination);
    export(&regions, collection, &options)
}
