//! # Archive Information Module
//!
//! Reads an exported netCDF archive back and describes its dimensions,
//! variables, attributes, `forcing` labels and size.

use crate::output::bytes_to_gb;
use anyhow::{Context, Result};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Information about a netCDF dimension
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DimensionInfo {
    pub name: String,
    pub length: usize,
    pub is_unlimited: bool,
}

/// Information about a netCDF variable
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableInfo {
    pub name: String,
    pub data_type: String,
    pub dimensions: Vec<String>,
    pub attributes: BTreeMap<String, String>,
    pub shape: Vec<usize>,
}

/// Complete description of an exported archive
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveInfo {
    pub path: String,
    pub dimensions: Vec<DimensionInfo>,
    pub variables: Vec<VariableInfo>,
    pub global_attributes: BTreeMap<String, String>,
    /// Labels of the `forcing` coordinate, empty when absent
    pub forcing: Vec<String>,
    pub file_size: u64,
    pub size_gb: f64,
}

/// Opens `path` and collects its structure.
pub fn archive_info(path: &Path) -> Result<ArchiveInfo> {
    debug!("Opening netCDF archive: {}", path.display());
    let file_size = std::fs::metadata(path)
        .with_context(|| format!("Failed to stat {}", path.display()))?
        .len();
    let file = netcdf::open(path)
        .with_context(|| format!("Failed to open netCDF file: {}", path.display()))?;

    let dimensions = file
        .dimensions()
        .map(|dim| DimensionInfo {
            name: dim.name().to_string(),
            length: dim.len(),
            is_unlimited: dim.is_unlimited(),
        })
        .collect();

    let mut variables = Vec::new();
    for var in file.variables() {
        let attributes = var
            .attributes()
            .filter_map(|attr| {
                attr.value()
                    .ok()
                    .map(|value| (attr.name().to_string(), format_attribute_value(&value)))
            })
            .collect();
        variables.push(VariableInfo {
            name: var.name().to_string(),
            data_type: format!("{:?}", var.vartype()),
            dimensions: var
                .dimensions()
                .iter()
                .map(|d| d.name().to_string())
                .collect(),
            attributes,
            shape: var.dimensions().iter().map(|d| d.len()).collect(),
        });
    }

    let global_attributes = file
        .attributes()
        .filter_map(|attr| {
            attr.value()
                .ok()
                .map(|value| (attr.name().to_string(), format_attribute_value(&value)))
        })
        .collect();

    let mut forcing = Vec::new();
    if let Some(var) = file.variable("forcing") {
        let len = var.dimensions().first().map(|d| d.len()).unwrap_or(0);
        for i in 0..len {
            forcing.push(
                var.get_string([i])
                    .with_context(|| format!("Failed to read forcing label {}", i))?,
            );
        }
    }

    Ok(ArchiveInfo {
        path: path.display().to_string(),
        dimensions,
        variables,
        global_attributes,
        forcing,
        file_size,
        size_gb: bytes_to_gb(file_size),
    })
}

fn format_attribute_value(value: &netcdf::AttributeValue) -> String {
    match value {
        netcdf::AttributeValue::Str(s) => s.clone(),
        netcdf::AttributeValue::Double(v) => v.to_string(),
        netcdf::AttributeValue::Float(v) => v.to_string(),
        other => format!("{:?}", other),
    }
}

/// Print archive info in human-readable format
pub fn print_archive_info_human(info: &ArchiveInfo) {
    println!("Archive: {}", info.path);
    println!("  File Size: {:.3} GB ({} bytes)", info.size_gb, info.file_size);
    if !info.forcing.is_empty() {
        println!("  Forcing: [{}]", info.forcing.join(", "));
    }
    println!("  Dimensions: {} total", info.dimensions.len());
    for dim in &info.dimensions {
        println!(
            "    {} ({}{})",
            dim.name,
            dim.length,
            if dim.is_unlimited { ", unlimited" } else { "" }
        );
    }
    println!("  Variables: {} total", info.variables.len());
    for var in &info.variables {
        println!(
            "    {} ({}) - dimensions: [{}]",
            var.name,
            var.data_type,
            var.dimensions.join(", ")
        );
        for (name, value) in &var.attributes {
            println!("      @{}: {}", name, value);
        }
    }
    if !info.global_attributes.is_empty() {
        println!("  Global Attributes:");
        for (name, value) in &info.global_attributes {
            println!("    @{}: {}", name, value);
        }
    }
}

/// Print archive info in JSON format
pub fn print_archive_info_json(info: &ArchiveInfo) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(info)?);
    Ok(())
}

/// Print archive info in YAML format
pub fn print_archive_info_yaml(info: &ArchiveInfo) -> Result<()> {
    let yaml = serde_yaml::to_string(info).context("Failed to serialize archive info to YAML")?;
    println!("{}", yaml);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{Dataset, Variable};
    use crate::output::{write_dataset_to_netcdf, WriteOptions};
    use tempfile::TempDir;

    #[test]
    fn test_archive_info() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("archive.nc");
        let ds = Dataset::new()
            .with_coord("forcing", Variable::coord_text("forcing", vec!["+0K", "+4K"]))?
            .with_coord(
                "lat",
                Variable::coord_f64("lat", vec![10.0, 20.0]).with_attr("units", "degrees_north"),
            )?
            .with_attr("title", "test archive");
        write_dataset_to_netcdf(&ds, &path, &WriteOptions::default())?;

        let info = archive_info(&path)?;
        assert_eq!(info.forcing, vec!["+0K", "+4K"]);
        assert_eq!(info.dimensions.len(), 2);
        let lat = info.variables.iter().find(|v| v.name == "lat").unwrap();
        assert_eq!(lat.shape, vec![2]);
        assert_eq!(lat.attributes.get("units").map(String::as_str), Some("degrees_north"));
        assert_eq!(
            info.global_attributes.get("title").map(String::as_str),
            Some("test archive")
        );
        assert!(info.file_size > 0);
        assert!(info.size_gb < 1.0);
        Ok(())
    }

    #[test]
    fn test_missing_archive() {
        assert!(archive_info(Path::new("/nonexistent/archive.nc")).is_err());
    }
}
