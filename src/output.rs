//! # NetCDF Output Module
//!
//! Serializes an in-memory [`Dataset`] to a netCDF-4 file.
//!
//! ## Features
//!
//! - **Atomic replacement**: the file is written to a temporary sibling and
//!   renamed over the destination, which is overwritten unconditionally
//! - **Compression**: numeric variables are deflated and chunked one time step
//!   at a time
//! - **CF fill values**: float variables carry a NaN `_FillValue`
//! - **Text coordinates**: written as netCDF string variables

use crate::dataset::{AttrValue, Attrs, Dataset, Values, Variable};
use crate::error::{DatasetError, PipelineError, PipelineResult};
use log::debug;
use ndarray::{ArrayD, Dimension};
use std::fs;
use std::path::Path;

pub const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Attributes the writer sets itself
const RESERVED_ATTRIBUTES: [&str; 2] = ["_FillValue", "missing_value"];

/// Encoding options for [`write_dataset_to_netcdf`]
#[derive(Debug, Clone, PartialEq)]
pub struct WriteOptions {
    /// Deflate level 0-9 for numeric variables; `None` disables compression.
    pub deflate_level: Option<i32>,
    /// Dimension chunked with length one
    pub record_dim: String,
}

impl Default for WriteOptions {
    fn default() -> Self {
        WriteOptions {
            deflate_level: Some(4),
            record_dim: "time".to_string(),
        }
    }
}

/// Writes `ds` to `path` and returns the size of the written file in bytes.
///
/// Parent directories are created as needed.
pub fn write_dataset_to_netcdf(
    ds: &Dataset,
    path: &Path,
    options: &WriteOptions,
) -> PipelineResult<u64> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => std::env::current_dir().map_err(|e| PipelineError::io(path, e))?,
    };
    fs::create_dir_all(&parent).map_err(|e| PipelineError::io(&parent, e))?;

    let temp = tempfile::Builder::new()
        .prefix(".cm4fetch-")
        .suffix(".nc")
        .tempfile_in(&parent)
        .map_err(|e| PipelineError::io(&parent, e))?;
    debug!("Writing dataset to temporary file {:?}", temp.path());

    {
        let mut file = netcdf::create(temp.path())?;
        for (dim, len) in ds.dims() {
            file.add_dimension(&dim, len)?;
        }
        for (name, var) in ds.variables() {
            write_variable(&mut file, name, var, options)?;
        }
        for (name, value) in &ds.attrs {
            match value {
                AttrValue::Text(s) => file.add_attribute(name, s.as_str())?,
                AttrValue::Number(v) => file.add_attribute(name, *v)?,
                AttrValue::Numbers(v) => file.add_attribute(name, v.clone())?,
            };
        }
    }

    temp.persist(path)
        .map_err(|e| PipelineError::io(path, e.error))?;
    let size = fs::metadata(path)
        .map_err(|e| PipelineError::io(path, e))?
        .len();
    debug!("Wrote {} bytes to {}", size, path.display());
    Ok(size)
}

fn write_variable(
    file: &mut netcdf::FileMut,
    name: &str,
    var: &Variable,
    options: &WriteOptions,
) -> PipelineResult<()> {
    let dims: Vec<&str> = var.dims.iter().map(String::as_str).collect();
    match &var.values {
        Values::Float(a) => {
            let mut nc_var = file.add_variable::<f32>(name, &dims)?;
            encode_numeric(&mut nc_var, var, options)?;
            nc_var.put_attribute("_FillValue", f32::NAN)?;
            put_attributes(&mut nc_var, &var.attrs)?;
            nc_var.put_values(contiguous(name, a)?.as_slice(), ..)?;
        }
        Values::Double(a) => {
            let mut nc_var = file.add_variable::<f64>(name, &dims)?;
            encode_numeric(&mut nc_var, var, options)?;
            nc_var.put_attribute("_FillValue", f64::NAN)?;
            put_attributes(&mut nc_var, &var.attrs)?;
            nc_var.put_values(contiguous(name, a)?.as_slice(), ..)?;
        }
        Values::Text(a) => {
            let mut nc_var = file.add_string_variable(name, &dims)?;
            put_attributes(&mut nc_var, &var.attrs)?;
            for (idx, label) in a.indexed_iter() {
                nc_var.put_string(label, idx.slice())?;
            }
        }
    }
    Ok(())
}

/// Compression and chunking; scalar and coordinate-sized variables are left as is.
fn encode_numeric(
    nc_var: &mut netcdf::VariableMut<'_>,
    var: &Variable,
    options: &WriteOptions,
) -> PipelineResult<()> {
    if var.dims.len() < 2 {
        return Ok(());
    }
    if let Some(level) = options.deflate_level {
        nc_var.set_compression(level, true)?;
    }
    let chunks: Vec<usize> = var
        .dims
        .iter()
        .zip(var.shape())
        .map(|(dim, &len)| if *dim == options.record_dim { 1 } else { len.max(1) })
        .collect();
    nc_var.set_chunking(&chunks)?;
    Ok(())
}

fn put_attributes(nc_var: &mut netcdf::VariableMut<'_>, attrs: &Attrs) -> PipelineResult<()> {
    for (name, value) in attrs {
        if RESERVED_ATTRIBUTES.contains(&name.as_str()) {
            continue;
        }
        match value {
            AttrValue::Text(s) => nc_var.put_attribute(name, s.as_str())?,
            AttrValue::Number(v) => nc_var.put_attribute(name, *v)?,
            AttrValue::Numbers(v) => nc_var.put_attribute(name, v.clone())?,
        };
    }
    Ok(())
}

/// Row-major element buffer of an array.
fn contiguous<T: Clone>(name: &str, a: &ArrayD<T>) -> Result<Vec<T>, DatasetError> {
    let standard = a.as_standard_layout();
    standard
        .as_slice()
        .map(<[T]>::to_vec)
        .ok_or_else(|| DatasetError::InvalidData(format!("variable '{}' is not contiguous", name)))
}

/// Converts a byte count to gigabytes (1024^3 bytes).
pub fn bytes_to_gb(bytes: u64) -> f64 {
    bytes as f64 / BYTES_PER_GB
}
