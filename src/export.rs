//! # Export Pipeline
//!
//! Takes the reference and perturbed runs out of a [`DatasetCollection`],
//! trims them to the export time window, concatenates them along a new
//! `forcing` dimension, restricts them to a region and writes the result.
//!
//! ## Steps
//!
//! 1. [`select_runs`]: locate both runs by `experiment_id`
//! 2. [`prepare_run`]: squeeze, keep times before the cutoff, drop
//!    `member_id` and `dcpp_init_year`
//! 3. [`combine_forcings`]: concatenate as `+0K` and `+4K`
//! 4. [`apply_region_mask`]: crop to the region footprint and blank outside cells
//! 5. [`crate::output::write_dataset_to_netcdf`]

use crate::cftime::{indices_before, CfDateTime, TimeEncoding};
use crate::combine::concat_new_dim;
use crate::config::PipelineConfig;
use crate::dataset::{Dataset, Values};
use crate::error::{DatasetError, PipelineError, PipelineResult};
use crate::output::{bytes_to_gb, write_dataset_to_netcdf, WriteOptions};
use crate::region::Regions;
use crate::resolver::{DatasetCollection, Run};
use chrono::NaiveDate;
use log::{debug, info};
use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const FORCING_DIM: &str = "forcing";
/// Labels of the reference and perturbed runs along [`FORCING_DIM`]
pub const FORCING_LABELS: [&str; 2] = ["+0K", "+4K"];
/// Coordinates attached per catalog entry that do not survive the export
pub const DROPPED_COORDS: [&str; 2] = ["member_id", "dcpp_init_year"];
pub const TIME_DIM: &str = "time";
pub const LAT_DIM: &str = "lat";
pub const LON_DIM: &str = "lon";

/// What to export and where
#[derive(Debug, Clone, PartialEq)]
pub struct ExportOptions {
    pub reference_experiment: String,
    pub perturbed_experiment: String,
    pub time_cutoff: NaiveDate,
    pub destination: PathBuf,
    pub write: WriteOptions,
}

impl ExportOptions {
    /// Options from a configuration; `destination` overrides the configured output.
    pub fn from_config(config: &PipelineConfig, destination: Option<PathBuf>) -> Self {
        ExportOptions {
            reference_experiment: config.reference_experiment.clone(),
            perturbed_experiment: config.perturbed_experiment.clone(),
            time_cutoff: config.time_cutoff,
            destination: destination
                .map(|d| config.resolve(&d))
                .unwrap_or_else(|| config.output_path()),
            write: WriteOptions {
                deflate_level: config.deflate_level,
                ..WriteOptions::default()
            },
        }
    }
}

/// Outcome of a successful export
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportReport {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub size_gb: f64,
    pub forcing: Vec<String>,
    pub reference_key: String,
    pub perturbed_key: String,
    pub dims: Vec<(String, usize)>,
}

/// Reference and perturbed runs, matched on their `experiment_id` facet.
pub fn select_runs<'a>(
    collection: &'a DatasetCollection,
    reference: &str,
    perturbed: &str,
) -> PipelineResult<(&'a Run, &'a Run)> {
    let reference = collection.get_by_experiment(reference)?;
    let perturbed = collection.get_by_experiment(perturbed)?;
    crate::log::show_selected_runs(&reference.key, &perturbed.key);
    Ok((reference, perturbed))
}

/// Squeezes `ds`, keeps time steps strictly before `cutoff` and drops the
/// per-entry coordinates.
pub fn prepare_run(ds: Dataset, cutoff: CfDateTime) -> Result<Dataset, DatasetError> {
    let ds = ds.squeeze();
    let time = ds
        .coords
        .get(TIME_DIM)
        .ok_or_else(|| DatasetError::MissingVariable(TIME_DIM.to_string()))?;
    if time.dims.len() != 1 || time.dims[0] != TIME_DIM {
        return Err(DatasetError::MissingDimension(TIME_DIM.to_string()));
    }
    let units = time.attr_str("units").ok_or_else(|| {
        DatasetError::InvalidData("time coordinate has no 'units' attribute".to_string())
    })?;
    let encoding = TimeEncoding::parse(units, time.attr_str("calendar"))?;
    let values = ds.coord_values(TIME_DIM)?;
    let kept = indices_before(&values, &encoding, cutoff)?;
    debug!(
        "Keeping {} of {} time steps before {}",
        kept.len(),
        values.len(),
        cutoff
    );

    ds.isel(TIME_DIM, &kept)?.drop_vars(&DROPPED_COORDS)
}

/// Concatenates the prepared runs along `forcing` as `+0K` and `+4K`.
pub fn combine_forcings(reference: Dataset, perturbed: Dataset) -> Result<Dataset, DatasetError> {
    concat_new_dim(&[reference, perturbed], FORCING_DIM, &FORCING_LABELS)
}

/// Crops `ds` to the lat rows and lon columns holding at least one cell inside
/// `regions`; outside cells of variables on both axes become NaN.
pub fn apply_region_mask(ds: Dataset, regions: &Regions) -> Result<Dataset, DatasetError> {
    let lon = ds.coord_values(LON_DIM)?;
    let lat = ds.coord_values(LAT_DIM)?;
    let mask = regions.mask(&lon, &lat);

    let keep_lat: Vec<usize> = (0..lat.len())
        .filter(|&i| mask.row(i).iter().any(Option::is_some))
        .collect();
    let keep_lon: Vec<usize> = (0..lon.len())
        .filter(|&j| mask.column(j).iter().any(Option::is_some))
        .collect();
    if keep_lat.is_empty() || keep_lon.is_empty() {
        return Err(DatasetError::InvalidData(format!(
            "no grid cell lies inside region set '{}'",
            regions.name
        )));
    }
    info!(
        "Region {} keeps {} of {} latitudes and {} of {} longitudes",
        regions.name,
        keep_lat.len(),
        lat.len(),
        keep_lon.len(),
        lon.len()
    );

    let inside: Array2<bool> = mask
        .select(Axis(0), &keep_lat)
        .select(Axis(1), &keep_lon)
        .mapv(|cell| cell.is_some());
    let mut ds = ds.isel(LAT_DIM, &keep_lat)?.isel(LON_DIM, &keep_lon)?;

    for var in ds.data_vars.values_mut() {
        let (Some(lat_axis), Some(lon_axis)) = (var.axis_of(LAT_DIM), var.axis_of(LON_DIM)) else {
            continue;
        };
        match &mut var.values {
            Values::Float(a) => {
                for (idx, v) in a.indexed_iter_mut() {
                    if !inside[[idx[lat_axis], idx[lon_axis]]] {
                        *v = f32::NAN;
                    }
                }
            }
            Values::Double(a) => {
                for (idx, v) in a.indexed_iter_mut() {
                    if !inside[[idx[lat_axis], idx[lon_axis]]] {
                        *v = f64::NAN;
                    }
                }
            }
            Values::Text(_) => {}
        }
    }
    Ok(ds)
}

/// Runs the export steps on `collection` and writes the combined dataset.
pub fn export(
    regions: &Regions,
    mut collection: DatasetCollection,
    options: &ExportOptions,
) -> PipelineResult<ExportReport> {
    let (reference_key, perturbed_key) = {
        let (reference, perturbed) = select_runs(
            &collection,
            &options.reference_experiment,
            &options.perturbed_experiment,
        )?;
        (reference.key.clone(), perturbed.key.clone())
    };
    let take = |collection: &mut DatasetCollection, key: &str, experiment: &str| {
        collection
            .remove(key)
            .ok_or_else(|| PipelineError::MissingExperiment(experiment.to_string()))
    };
    let reference = take(&mut collection, &reference_key, &options.reference_experiment)?;
    let perturbed = take(&mut collection, &perturbed_key, &options.perturbed_experiment)?;

    let cutoff = CfDateTime::from(options.time_cutoff);
    let reference = prepare_run(reference.dataset, cutoff)?;
    let perturbed = prepare_run(perturbed.dataset, cutoff)?;
    let combined = combine_forcings(reference, perturbed)?;
    let masked = apply_region_mask(combined, regions)?;

    crate::log::show_dataset_summary(&masked);
    crate::log::show_destination(&options.destination);
    let size_bytes = write_dataset_to_netcdf(&masked, &options.destination, &options.write)?;
    let size_gb = bytes_to_gb(size_bytes);
    crate::log::show_file_size(size_gb);

    Ok(ExportReport {
        path: options.destination.clone(),
        size_bytes,
        size_gb,
        forcing: FORCING_LABELS.iter().map(|l| l.to_string()).collect(),
        reference_key,
        perturbed_key,
        dims: masked.dims(),
    })
}
