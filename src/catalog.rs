//! # ESM Catalog
//!
//! Loading of an ESM collection (the JSON document plus its CSV table) and
//! facet search over the table. The table is held as a polars [`DataFrame`]
//! with every column read as text.
//!
//! ## Example
//!
//! ```rust,no_run
//! use cm4fetch::catalog::EsmCatalog;
//! use cm4fetch::query::cm4_query;
//!
//! # async fn example() -> Result<(), cm4fetch::error::CatalogError> {
//! let catalog = EsmCatalog::open("https://storage.googleapis.com/cmip6/pangeo-cmip6.json").await?;
//! let result = catalog.search(&cm4_query())?;
//! println!("{} datasets", result.len());
//! # Ok(())
//! # }
//! ```

use crate::error::CatalogError;
use crate::query::{Facet, FilterSpec};
use crate::storage::{join_location, parent_location, StorageBackend, StorageFactory};
use flate2::read::GzDecoder;
use log::{debug, info, warn};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io::{Cursor, Read};
use std::path::Path;

/// Column holding each dataset's `dcpp_init_year`, empty for non-DCPP runs
pub const DCPP_INIT_YEAR_COLUMN: &str = "dcpp_init_year";
pub const VERSION_COLUMN: &str = "version";
const DEFAULT_ASSET_COLUMN: &str = "zstore";

/// Asset description of an ESM collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetSpec {
    pub column_name: String,
    #[serde(default)]
    pub format: Option<String>,
}

impl Default for AssetSpec {
    fn default() -> Self {
        AssetSpec {
            column_name: DEFAULT_ASSET_COLUMN.to_string(),
            format: Some("zarr".to_string()),
        }
    }
}

/// ESM collection document (`esmcat` JSON)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EsmCollection {
    #[serde(default)]
    pub esmcat_version: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Location of the CSV table, absolute or relative to the document
    pub catalog_file: String,
    #[serde(default)]
    pub assets: AssetSpec,
}

/// One row of the catalog table
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogEntry {
    /// Every text column of the row except the asset column, keyed by column name
    pub facets: BTreeMap<String, String>,
    pub zstore: String,
    pub dcpp_init_year: Option<f64>,
    pub version: Option<String>,
}

impl CatalogEntry {
    pub fn facet(&self, facet: Facet) -> Option<&str> {
        self.facets.get(facet.column()).map(String::as_str)
    }

    /// Facet value, or an empty string when the column is absent.
    pub fn facet_or_empty(&self, facet: Facet) -> &str {
        self.facet(facet).unwrap_or("")
    }
}

/// A loaded ESM collection
#[derive(Debug, Clone)]
pub struct EsmCatalog {
    pub location: String,
    pub collection: EsmCollection,
    df: DataFrame,
}

impl EsmCatalog {
    /// Fetches the collection document and its table from a local path, an
    /// HTTP(S) URL or a `gs://` location.
    pub async fn open(location: &str) -> Result<Self, CatalogError> {
        info!("Opening ESM collection {}", location);
        let storage = StorageFactory::from_path(location)?;
        let document = storage.read(location).await?;
        let collection: EsmCollection = serde_json::from_slice(&document)?;

        let table_location = resolve_catalog_file(location, &collection.catalog_file);
        debug!("Reading catalog table {}", table_location);
        let table_storage = StorageFactory::from_path(&table_location)?;
        let bytes = table_storage.read(&table_location).await?;
        let bytes = maybe_gunzip(&table_location, bytes)?;
        let df = read_table(bytes)?;
        info!(
            "Catalog '{}' has {} datasets",
            collection.id.as_deref().unwrap_or(location),
            df.height()
        );
        Self::from_parts(location, collection, df)
    }

    /// Builds a catalog from an already loaded table.
    pub fn from_parts(
        location: &str,
        collection: EsmCollection,
        df: DataFrame,
    ) -> Result<Self, CatalogError> {
        let names: Vec<String> = df
            .get_column_names()
            .iter()
            .map(|name| name.to_string())
            .collect();
        if !names.contains(&collection.assets.column_name) {
            return Err(CatalogError::MissingColumn(
                collection.assets.column_name.clone(),
            ));
        }
        Ok(EsmCatalog {
            location: location.to_string(),
            collection,
            df,
        })
    }

    pub fn len(&self) -> usize {
        self.df.height()
    }

    pub fn is_empty(&self) -> bool {
        self.df.height() == 0
    }

    /// Rows whose facet columns all hold an accepted value.
    pub fn search(&self, filter: &FilterSpec) -> Result<SearchResult, CatalogError> {
        let mut predicate = lit(true);
        for (facet, accepted) in filter.facets() {
            let column = facet.column();
            if self.df.column(column).is_err() {
                return Err(CatalogError::MissingColumn(column.to_string()));
            }
            let values = Series::new(column.into(), accepted.iter().cloned().collect::<Vec<_>>());
            predicate = predicate.and(col(column).is_in(lit(values).implode(), false));
        }
        let df = self.df.clone().lazy().filter(predicate).collect()?;
        debug!("Search {} matched {} rows", filter, df.height());

        if df.height() == 0 {
            return Err(CatalogError::NoMatches(filter.to_string()));
        }

        let result = SearchResult {
            asset_column: self.collection.assets.column_name.clone(),
            df,
        };
        for (facet, accepted) in filter.facets() {
            let found = result.unique(facet.column())?;
            for value in accepted.iter().filter(|v| !found.contains(*v)) {
                warn!("No datasets found for {} = {}", facet, value);
            }
        }
        Ok(result)
    }
}

/// Rows selected by [`EsmCatalog::search`]
#[derive(Debug, Clone)]
pub struct SearchResult {
    asset_column: String,
    df: DataFrame,
}

impl SearchResult {
    pub fn len(&self) -> usize {
        self.df.height()
    }

    pub fn is_empty(&self) -> bool {
        self.df.height() == 0
    }

    pub fn dataframe(&self) -> &DataFrame {
        &self.df
    }

    /// Distinct non-empty values of a column, sorted.
    pub fn unique(&self, column: &str) -> Result<BTreeSet<String>, CatalogError> {
        Ok(text_column(&self.df, column)?
            .into_iter()
            .flatten()
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .collect())
    }

    pub fn entries(&self) -> Result<Vec<CatalogEntry>, CatalogError> {
        let names: Vec<String> = self
            .df
            .get_column_names()
            .iter()
            .map(|name| name.to_string())
            .collect();
        let columns: Vec<(String, Vec<Option<&str>>)> = names
            .iter()
            .map(|name| Ok((name.clone(), text_column(&self.df, name)?)))
            .collect::<Result<_, CatalogError>>()?;

        let mut entries = Vec::with_capacity(self.df.height());
        for row in 0..self.df.height() {
            let mut facets = BTreeMap::new();
            let mut zstore = None;
            let mut dcpp_init_year = None;
            let mut version = None;
            for (name, values) in &columns {
                let Some(value) = values[row].filter(|v| !v.is_empty()) else {
                    continue;
                };
                if *name == self.asset_column {
                    zstore = Some(value.to_string());
                } else {
                    if name == DCPP_INIT_YEAR_COLUMN {
                        dcpp_init_year = value.trim().parse::<f64>().ok();
                    } else if name == VERSION_COLUMN {
                        version = Some(value.to_string());
                    }
                    facets.insert(name.clone(), value.to_string());
                }
            }
            let zstore = zstore.ok_or_else(|| {
                CatalogError::MissingColumn(format!("{} (row {})", self.asset_column, row))
            })?;
            entries.push(CatalogEntry {
                facets,
                zstore,
                dcpp_init_year,
                version,
            });
        }
        Ok(entries)
    }
}

fn text_column<'a>(df: &'a DataFrame, name: &str) -> Result<Vec<Option<&'a str>>, CatalogError> {
    let column = df
        .column(name)
        .map_err(|_| CatalogError::MissingColumn(name.to_string()))?;
    Ok(column.str()?.into_iter().collect())
}

fn resolve_catalog_file(document: &str, catalog_file: &str) -> String {
    if StorageFactory::is_remote_path(catalog_file) || Path::new(catalog_file).is_absolute() {
        catalog_file.to_string()
    } else {
        join_location(&parent_location(document), catalog_file)
    }
}

/// Decompresses gzip content, detected by extension or magic bytes.
fn maybe_gunzip(location: &str, bytes: Vec<u8>) -> Result<Vec<u8>, CatalogError> {
    let gzipped = location.ends_with(".gz") || bytes.starts_with(&[0x1f, 0x8b]);
    if !gzipped {
        return Ok(bytes);
    }
    let mut decoded = Vec::new();
    GzDecoder::new(bytes.as_slice())
        .read_to_end(&mut decoded)
        .map_err(|e| CatalogError::Storage(e.into()))?;
    Ok(decoded)
}

/// Parses the catalog CSV with every column kept as text.
fn read_table(bytes: Vec<u8>) -> Result<DataFrame, CatalogError> {
    let df = CsvReadOptions::default()
        .with_has_header(true)
        .with_infer_schema_length(Some(0))
        .into_reader_with_file_handle(Cursor::new(bytes))
        .finish()?;
    Ok(df)
}


#[cfg(test)]
mod tests {
    use super::testing::{row, write_catalog};
    use super::*;
    use crate::query::cm4_query;
    use tempfile::TempDir;

    fn sample_rows() -> Vec<String> {
        vec![
            row("amip", "tas", "gs://cmip6/amip/tas/"),
            row("amip", "pr", "gs://cmip6/amip/pr/"),
            row("amip-p4K", "tas", "gs://cmip6/amip-p4K/tas/"),
            row("amip-p4K", "pr", "gs://cmip6/amip-p4K/pr/"),
            row("historical", "tas", "gs://cmip6/historical/tas/"),
        ]
    }

    #[tokio::test]
    async fn test_open_and_search() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let path = write_catalog(dir.path(), "catalog.csv", &sample_rows());
        let catalog = EsmCatalog::open(path.to_str().unwrap()).await?;
        assert_eq!(catalog.len(), 5);
        assert_eq!(catalog.collection.id.as_deref(), Some("test-cmip6"));

        let result = catalog.search(&cm4_query())?;
        assert_eq!(result.len(), 4);
        assert_eq!(
            result.unique("experiment_id")?.into_iter().collect::<Vec<_>>(),
            vec!["amip", "amip-p4K"]
        );
        assert_eq!(
            result.unique("variable_id")?.into_iter().collect::<Vec<_>>(),
            vec!["pr", "tas"]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_gzip_catalog() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let path = write_catalog(dir.path(), "catalog.csv.gz", &sample_rows());
        let catalog = EsmCatalog::open(path.to_str().unwrap()).await?;
        assert_eq!(catalog.len(), 5);
        Ok(())
    }

    #[tokio::test]
    async fn test_entries() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let path = write_catalog(dir.path(), "catalog.csv", &sample_rows());
        let catalog = EsmCatalog::open(path.to_str().unwrap()).await?;
        let filter = FilterSpec::new()
            .with_facet(Facet::ExperimentId, ["amip-p4K"])
            .with_facet(Facet::VariableId, ["tas"]);
        let entries = catalog.search(&filter)?.entries()?;
        assert_eq!(entries.len(), 1);

        let entry = &entries[0];
        assert_eq!(entry.zstore, "gs://cmip6/amip-p4K/tas/");
        assert_eq!(entry.facet(Facet::SourceId), Some("GFDL-CM4"));
        assert_eq!(entry.facet(Facet::GridLabel), Some("gr2"));
        assert_eq!(entry.facets.get("activity_id").map(String::as_str), Some("CFMIP"));
        assert_eq!(entry.dcpp_init_year, None);
        assert_eq!(entry.version.as_deref(), Some("20180701"));
        assert!(!entry.facets.contains_key("zstore"));
        Ok(())
    }

    #[tokio::test]
    async fn test_search_skips_blank_facets() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let mut rows = sample_rows();
        rows.push(row("", "tas", "gs://cmip6/unlabelled/tas/"));
        let path = write_catalog(dir.path(), "catalog.csv", &rows);
        let catalog = EsmCatalog::open(path.to_str().unwrap()).await?;

        let filter = FilterSpec::new()
            .with_facet(Facet::ExperimentId, ["amip", "amip-p4K", "historical"])
            .with_facet(Facet::VariableId, ["tas"]);
        let result = catalog.search(&filter)?;
        assert_eq!(result.len(), 3);
        assert!(!result.unique("zstore")?.contains("gs://cmip6/unlabelled/tas/"));
        // the catalog table itself is left untouched
        assert_eq!(catalog.len(), 6);
        Ok(())
    }

    #[tokio::test]
    async fn test_search_without_matches() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let path = write_catalog(dir.path(), "catalog.csv", &sample_rows());
        let catalog = EsmCatalog::open(path.to_str().unwrap()).await?;
        let filter = FilterSpec::new().with_facet(Facet::SourceId, ["CESM2"]);
        assert!(matches!(
            catalog.search(&filter),
            Err(CatalogError::NoMatches(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_facet_column() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let table = dir.path().join("table.csv");
        std::fs::write(&table, "source_id,zstore\nGFDL-CM4,gs://a/\n")?;
        let document = serde_json::json!({ "catalog_file": table.to_str().unwrap() });
        let path = dir.path().join("catalog.json");
        std::fs::write(&path, document.to_string())?;

        let catalog = EsmCatalog::open(path.to_str().unwrap()).await?;
        let err = catalog.search(&cm4_query()).unwrap_err();
        assert!(matches!(err, CatalogError::MissingColumn(_)));
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_document() {
        let err = EsmCatalog::open("/nonexistent/catalog.json").await.unwrap_err();
        assert!(matches!(err, CatalogError::Storage(_)));
    }

    #[test]
    fn test_resolve_catalog_file() {
        assert_eq!(
            resolve_catalog_file(
                "https://storage.googleapis.com/cmip6/pangeo-cmip6.json",
                "pangeo-cmip6.csv.gz"
            ),
            "https://storage.googleapis.com/cmip6/pangeo-cmip6.csv.gz"
        );
        assert_eq!(
            resolve_catalog_file("/data/catalog.json", "gs://cmip6/table.csv"),
            "gs://cmip6/table.csv"
        );
        assert_eq!(
            resolve_catalog_file("/data/catalog.json", "table.csv"),
            "/data/table.csv"
        );
    }

    #[test]
    #[ignore = "requires network access"]
    fn test_open_pangeo_collection() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let catalog = rt
            .block_on(EsmCatalog::open(crate::config::DEFAULT_CATALOG_URL))
            .unwrap();
        let result = catalog.search(&cm4_query()).unwrap();
        assert!(result.len() >= 2);
    }
}
