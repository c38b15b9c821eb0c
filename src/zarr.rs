//! # Zarr Store Reader
//!
//! Opens a catalog entry's zarr v2 store as an in-memory [`Dataset`].
//!
//! Store layout comes from the consolidated `.zmetadata` document, fetched
//! through the storage layer. Array data is decoded by `zarrs`, reading an
//! HTTP store for `gs://` and `https://` locations and a filesystem store
//! otherwise. Chunk retrieval is blocking and runs on the blocking thread pool.
//!
//! CF decoding applied on open:
//!
//! - elements equal to the `.zarray` `fill_value` of a float array become NaN;
//!   a `_FillValue` attribute overrides it and `missing_value` is masked too
//! - variables named after a dimension, or listed in a `coordinates`
//!   attribute, become coordinates
//! - integer arrays are widened to `f64`
//!
//! Every opened dataset also gains a length-one `member_id` dimension on its
//! data variables, a `member_id` text coordinate and a scalar `dcpp_init_year`
//! coordinate taken from the catalog entry.

use crate::catalog::CatalogEntry;
use crate::dataset::{AttrValue, Attrs, Dataset, Values, Variable};
use crate::error::CatalogError;
use crate::query::Facet;
use crate::storage::{join_location, to_http_url, StorageBackend, StorageFactory};
use async_trait::async_trait;
use log::{debug, warn};
use ndarray::{ArrayD, IxDyn};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use zarrs::array::Array;
use zarrs::filesystem::FilesystemStore;
use zarrs::storage::ReadableStorage;
use zarrs_http::HTTPStore;

/// Consolidated metadata document of a zarr v2 group
pub const CONSOLIDATED_METADATA: &str = ".zmetadata";
/// Attribute naming an array's dimensions (xarray convention)
pub const ARRAY_DIMENSIONS: &str = "_ARRAY_DIMENSIONS";
/// CF attributes marking missing elements, decoded to NaN
pub const FILL_ATTRIBUTES: [&str; 2] = ["_FillValue", "missing_value"];

/// Turns a catalog entry into a dataset.
#[async_trait]
pub trait DatasetSource: Send + Sync {
    async fn open(&self, entry: &CatalogEntry) -> Result<Dataset, CatalogError>;
}

/// Element type of a stored array
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayDtype {
    Float32,
    Float64,
    Int16,
    Int32,
    Int64,
}

impl ArrayDtype {
    pub fn is_float(&self) -> bool {
        matches!(self, ArrayDtype::Float32 | ArrayDtype::Float64)
    }

    /// Parses a little-endian (or byte-order-free) numpy dtype string.
    pub fn parse(array: &str, dtype: &str) -> Result<Self, CatalogError> {
        match dtype {
            "<f4" => Ok(ArrayDtype::Float32),
            "<f8" => Ok(ArrayDtype::Float64),
            "<i2" => Ok(ArrayDtype::Int16),
            "<i4" => Ok(ArrayDtype::Int32),
            "<i8" => Ok(ArrayDtype::Int64),
            _ => Err(CatalogError::UnsupportedDtype {
                array: array.to_string(),
                dtype: dtype.to_string(),
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ConsolidatedDocument {
    metadata: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ZArray {
    shape: Vec<usize>,
    dtype: serde_json::Value,
    #[serde(default)]
    fill_value: serde_json::Value,
}

/// Numeric `fill_value` of a `.zarray` document; `null` and byte-encoded
/// values give `None`.
fn parse_fill_value(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => match s.as_str() {
            "NaN" => Some(f64::NAN),
            "Infinity" => Some(f64::INFINITY),
            "-Infinity" => Some(f64::NEG_INFINITY),
            _ => None,
        },
        _ => None,
    }
}

/// One array of a store as described by its metadata
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayLayout {
    pub name: String,
    pub dims: Vec<String>,
    pub shape: Vec<usize>,
    pub dtype: ArrayDtype,
    /// Store-level fill value from `.zarray`
    pub fill_value: Option<f64>,
    pub attrs: Attrs,
}

/// Arrays and global attributes of a consolidated store
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StoreLayout {
    pub arrays: Vec<ArrayLayout>,
    pub attrs: Attrs,
}

impl StoreLayout {
    /// Parses a consolidated `.zmetadata` document. Arrays with a dtype that
    /// cannot be decoded numerically are skipped with a warning.
    pub fn parse(zstore: &str, bytes: &[u8]) -> Result<Self, CatalogError> {
        let invalid = |reason: String| CatalogError::InvalidMetadata {
            zstore: zstore.to_string(),
            reason,
        };
        let document: ConsolidatedDocument = serde_json::from_slice(bytes)
            .map_err(|e| invalid(format!("{}: {}", CONSOLIDATED_METADATA, e)))?;

        let mut layout = StoreLayout {
            attrs: document
                .metadata
                .get(".zattrs")
                .map(json_attrs)
                .unwrap_or_default(),
            ..StoreLayout::default()
        };

        for (key, value) in &document.metadata {
            let Some(name) = key.strip_suffix("/.zarray") else {
                continue;
            };
            if name.contains('/') {
                debug!("Skipping nested array '{}' in {}", name, zstore);
                continue;
            }
            let zarray: ZArray = serde_json::from_value(value.clone())
                .map_err(|e| invalid(format!("{}/.zarray: {}", name, e)))?;

            let dtype = match zarray.dtype.as_str() {
                Some(dtype) => ArrayDtype::parse(name, dtype),
                None => Err(CatalogError::UnsupportedDtype {
                    array: name.to_string(),
                    dtype: zarray.dtype.to_string(),
                }),
            };
            let dtype = match dtype {
                Ok(dtype) => dtype,
                Err(e) => {
                    warn!("Skipping array in {}: {}", zstore, e);
                    continue;
                }
            };

            let zattrs = document.metadata.get(&format!("{}/.zattrs", name));
            let dims: Vec<String> = zattrs
                .and_then(|attrs| attrs.get(ARRAY_DIMENSIONS))
                .and_then(|dims| serde_json::from_value(dims.clone()).ok())
                .ok_or_else(|| invalid(format!("array '{}' has no {}", name, ARRAY_DIMENSIONS)))?;
            if dims.len() != zarray.shape.len() {
                return Err(invalid(format!(
                    "array '{}' has {} dimension names for shape {:?}",
                    name,
                    dims.len(),
                    zarray.shape
                )));
            }

            let mut attrs = zattrs.map(json_attrs).unwrap_or_default();
            attrs.remove(ARRAY_DIMENSIONS);
            layout.arrays.push(ArrayLayout {
                name: name.to_string(),
                dims,
                shape: zarray.shape,
                dtype,
                fill_value: parse_fill_value(&zarray.fill_value),
                attrs,
            });
        }

        if layout.arrays.is_empty() {
            return Err(invalid("no readable arrays".to_string()));
        }
        Ok(layout)
    }

    /// Names of arrays that are coordinates rather than data variables.
    pub fn coordinate_names(&self) -> BTreeSet<String> {
        let dims: BTreeSet<&str> = self
            .arrays
            .iter()
            .flat_map(|a| a.dims.iter().map(String::as_str))
            .collect();
        let mut names: BTreeSet<String> = self
            .arrays
            .iter()
            .filter(|a| dims.contains(a.name.as_str()))
            .map(|a| a.name.clone())
            .collect();
        for array in &self.arrays {
            if let Some(listed) = array.attrs.get("coordinates").and_then(AttrValue::as_str) {
                names.extend(
                    listed
                        .split_whitespace()
                        .filter(|n| self.arrays.iter().any(|a| a.name == *n))
                        .map(str::to_string),
                );
            }
        }
        names
    }
}

fn json_attrs(value: &serde_json::Value) -> Attrs {
    value
        .as_object()
        .map(|object| {
            object
                .iter()
                .filter_map(|(k, v)| AttrValue::from_json(v).map(|v| (k.clone(), v)))
                .collect()
        })
        .unwrap_or_default()
}

/// Opens catalog entries as zarr v2 stores
#[derive(Debug, Clone, Default)]
pub struct ZarrStoreSource;

impl ZarrStoreSource {
    pub fn new() -> Self {
        ZarrStoreSource
    }

    fn open_store(zstore: &str) -> Result<ReadableStorage, CatalogError> {
        let download = |reason: String| CatalogError::Download {
            zstore: zstore.to_string(),
            reason,
        };
        if StorageFactory::is_remote_path(zstore) {
            let url = to_http_url(zstore)?;
            let store = HTTPStore::new(url.trim_end_matches('/'))
                .map_err(|e| download(e.to_string()))?;
            Ok(Arc::new(store))
        } else {
            let store = FilesystemStore::new(zstore).map_err(|e| download(e.to_string()))?;
            Ok(Arc::new(store))
        }
    }
}

#[async_trait]
impl DatasetSource for ZarrStoreSource {
    async fn open(&self, entry: &CatalogEntry) -> Result<Dataset, CatalogError> {
        let zstore = entry.zstore.clone();
        let metadata_location = join_location(&zstore, CONSOLIDATED_METADATA);
        debug!("Reading {}", metadata_location);
        let storage = StorageFactory::from_path(&zstore)?;
        let bytes = storage.read(&metadata_location).await?;
        let layout = StoreLayout::parse(&zstore, &bytes)?;

        let store = Self::open_store(&zstore)?;
        let arrays = layout.arrays.clone();
        let task_zstore = zstore.clone();
        let values = tokio::task::spawn_blocking(move || read_arrays(&task_zstore, store, &arrays))
            .await
            .map_err(|e| CatalogError::Download {
                zstore: zstore.clone(),
                reason: e.to_string(),
            })??;

        build_dataset(entry, &layout, values)
    }
}

fn read_arrays(
    zstore: &str,
    store: ReadableStorage,
    arrays: &[ArrayLayout],
) -> Result<Vec<Values>, CatalogError> {
    let download = |name: &str, reason: String| CatalogError::Download {
        zstore: zstore.to_string(),
        reason: format!("array '{}': {}", name, reason),
    };

    macro_rules! retrieve {
        ($array:expr, $name:expr, $t:ty) => {
            $array
                .retrieve_array_subset_ndarray::<$t>(&$array.subset_all())
                .map_err(|e| download($name, e.to_string()))?
        };
    }

    let mut out = Vec::with_capacity(arrays.len());
    for layout in arrays {
        let name = layout.name.as_str();
        let array = Array::open(store.clone(), &format!("/{}", name))
            .map_err(|e| download(name, e.to_string()))?;
        let values = match layout.dtype {
            ArrayDtype::Float32 => Values::Float(retrieve!(array, name, f32)),
            ArrayDtype::Float64 => Values::Double(retrieve!(array, name, f64)),
            ArrayDtype::Int16 => Values::Double(retrieve!(array, name, i16).mapv(f64::from)),
            ArrayDtype::Int32 => Values::Double(retrieve!(array, name, i32).mapv(f64::from)),
            ArrayDtype::Int64 => Values::Double(retrieve!(array, name, i64).mapv(|v| v as f64)),
        };
        if values.shape() != layout.shape.as_slice() {
            return Err(download(
                name,
                format!("expected shape {:?}, read {:?}", layout.shape, values.shape()),
            ));
        }
        debug!("Read {} {:?} from {}", name, layout.shape, zstore);
        out.push(values);
    }
    Ok(out)
}

/// Assembles a dataset from decoded arrays and attaches the entry's
/// `member_id` and `dcpp_init_year`.
fn build_dataset(
    entry: &CatalogEntry,
    layout: &StoreLayout,
    values: Vec<Values>,
) -> Result<Dataset, CatalogError> {
    let invalid = |reason: String| CatalogError::InvalidMetadata {
        zstore: entry.zstore.clone(),
        reason,
    };
    let coordinates = layout.coordinate_names();
    let mut coords = Vec::new();
    let mut data_vars = Vec::new();

    for (array, mut values) in layout.arrays.iter().zip(values) {
        let mut attrs = array.attrs.clone();
        let [fill_attr, missing_attr] = FILL_ATTRIBUTES;
        let fill = attrs
            .remove(fill_attr)
            .and_then(|v| v.as_f64())
            .or(array.fill_value.filter(|_| array.dtype.is_float()));
        let missing = attrs.remove(missing_attr).and_then(|v| v.as_f64());
        for value in [fill, missing].into_iter().flatten() {
            values.mask_fill_value(value);
        }
        let var = Variable::from_parts(array.dims.clone(), values, attrs)
            .map_err(|e| invalid(e.to_string()))?;
        if coordinates.contains(&array.name) {
            coords.push((array.name.clone(), var));
        } else {
            data_vars.push((array.name.clone(), var));
        }
    }

    let mut ds = Dataset {
        attrs: layout.attrs.clone(),
        ..Dataset::default()
    };
    for (name, var) in coords {
        ds.insert_coord(&name, var).map_err(|e| invalid(e.to_string()))?;
    }
    for (name, mut var) in data_vars {
        var.values = var.values.insert_axis(0);
        var.dims.insert(0, "member_id".to_string());
        ds.insert_data_var(&name, var)
            .map_err(|e| invalid(e.to_string()))?;
    }

    let member = entry.facet_or_empty(Facet::MemberId).to_string();
    ds.insert_coord("member_id", Variable::coord_text("member_id", vec![member]))
        .map_err(|e| invalid(e.to_string()))?;
    let init_year = entry.dcpp_init_year.unwrap_or(f64::NAN);
    ds.insert_coord(
        "dcpp_init_year",
        Variable {
            dims: vec![],
            values: Values::Double(ArrayD::from_elem(IxDyn(&[]), init_year)),
            attrs: Attrs::new(),
        },
    )
    .map_err(|e| invalid(e.to_string()))?;
    Ok(ds)
}

#[cfg(test)]
pub(crate) mod testing {
    //! Hand-written uncompressed zarr v2 stores for tests.

    use serde_json::json;
    use std::collections::BTreeMap;
    use std::path::Path;

    pub struct TestArray {
        pub name: &'static str,
        pub dims: Vec<&'static str>,
        pub shape: Vec<usize>,
        pub dtype: &'static str,
        pub bytes: Vec<u8>,
        /// `.zarray` fill value
        pub fill_value: serde_json::Value,
        pub attrs: serde_json::Value,
    }

    pub fn f32_array(name: &'static str, dims: Vec<&'static str>, shape: Vec<usize>, values: &[f32]) -> TestArray {
        TestArray {
            name,
            dims,
            shape,
            dtype: "<f4",
            bytes: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
            fill_value: json!("NaN"),
            attrs: json!({}),
        }
    }

    pub fn f64_array(name: &'static str, values: &[f64]) -> TestArray {
        TestArray {
            name,
            dims: vec![name],
            shape: vec![values.len()],
            dtype: "<f8",
            bytes: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
            fill_value: json!("NaN"),
            attrs: json!({}),
        }
    }

    pub fn i64_array(name: &'static str, values: &[i64]) -> TestArray {
        TestArray {
            name,
            dims: vec![name],
            shape: vec![values.len()],
            dtype: "<i8",
            bytes: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
            fill_value: json!(0),
            attrs: json!({}),
        }
    }

    /// Writes a single-chunk store with `.zmetadata` and per-array metadata.
    pub fn write_store(dir: &Path, arrays: &[TestArray], global_attrs: serde_json::Value) {
        std::fs::create_dir_all(dir).unwrap();
        let mut metadata = BTreeMap::new();
        let group = json!({ "zarr_format": 2 });
        std::fs::write(dir.join(".zgroup"), group.to_string()).unwrap();
        std::fs::write(dir.join(".zattrs"), global_attrs.to_string()).unwrap();
        metadata.insert(".zgroup".to_string(), group);
        metadata.insert(".zattrs".to_string(), global_attrs);

        for array in arrays {
            let zarray = json!({
                "chunks": array.shape,
                "compressor": null,
                "dtype": array.dtype,
                "fill_value": array.fill_value,
                "filters": null,
                "order": "C",
                "shape": array.shape,
                "zarr_format": 2
            });
            let mut zattrs = array.attrs.clone();
            zattrs[super::ARRAY_DIMENSIONS] = json!(array.dims);

            let array_dir = dir.join(array.name);
            std::fs::create_dir_all(&array_dir).unwrap();
            std::fs::write(array_dir.join(".zarray"), zarray.to_string()).unwrap();
            std::fs::write(array_dir.join(".zattrs"), zattrs.to_string()).unwrap();
            let chunk_key = vec!["0"; array.shape.len()].join(".");
            std::fs::write(array_dir.join(chunk_key), &array.bytes).unwrap();

            metadata.insert(format!("{}/.zarray", array.name), zarray);
            metadata.insert(format!("{}/.zattrs", array.name), zattrs);
        }

        let document = json!({ "metadata": metadata, "zarr_consolidated_format": 1 });
        std::fs::write(dir.join(super::CONSOLIDATED_METADATA), document.to_string()).unwrap();
    }
}
