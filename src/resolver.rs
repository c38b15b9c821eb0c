//! # Catalog Resolver
//!
//! Turns a [`FilterSpec`] into a [`DatasetCollection`]: opens the ESM catalog,
//! searches it, materializes every matching zarr store and merges the
//! per-variable datasets of each simulation run into one dataset.
//!
//! The whole stage runs under a [`RetryPolicy`]; only failures classified as
//! transient by [`PipelineError::is_transient`] are retried.

use crate::catalog::{CatalogEntry, EsmCatalog};
use crate::combine;
use crate::config::RetryPolicy;
use crate::dataset::Dataset;
use crate::error::{DatasetError, PipelineError, PipelineResult};
use crate::query::{Facet, FilterSpec};
use crate::zarr::DatasetSource;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::future::Future;

/// Facets whose run-key components identify one simulation run
pub const RUN_KEY_FACETS: [Facet; 5] = [
    Facet::SourceId,
    Facet::ExperimentId,
    Facet::MemberId,
    Facet::TableId,
    Facet::GridLabel,
];

/// Facets printed after a search, before materialization
pub const REPORTED_FACETS: [Facet; 4] = [
    Facet::SourceId,
    Facet::MemberId,
    Facet::TableId,
    Facet::VariableId,
];

/// Composite key `source_id.experiment_id.member_id.table_id.grid_label`.
pub fn run_key(entry: &CatalogEntry) -> String {
    RUN_KEY_FACETS
        .iter()
        .map(|facet| entry.facet_or_empty(*facet))
        .collect::<Vec<_>>()
        .join(".")
}

/// A merged simulation run
#[derive(Debug, Clone, PartialEq)]
pub struct Run {
    pub key: String,
    /// Facets shared by every variable of the run
    pub facets: BTreeMap<String, String>,
    pub dataset: Dataset,
}

impl Run {
    pub fn experiment(&self) -> Option<&str> {
        self.facets
            .get(Facet::ExperimentId.column())
            .map(String::as_str)
    }
}

/// Runs keyed by their composite run key
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DatasetCollection {
    runs: BTreeMap<String, Run>,
}

impl DatasetCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a collection from runs; a repeated key replaces the earlier run.
    pub fn from_runs(runs: impl IntoIterator<Item = Run>) -> Self {
        DatasetCollection {
            runs: runs.into_iter().map(|run| (run.key.clone(), run)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.runs.keys().map(String::as_str)
    }

    pub fn get(&self, key: &str) -> Option<&Run> {
        self.runs.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Run> {
        self.runs.values()
    }

    /// The single run whose `experiment_id` facet equals `experiment`.
    pub fn get_by_experiment(&self, experiment: &str) -> PipelineResult<&Run> {
        let matches: Vec<&Run> = self
            .runs
            .values()
            .filter(|run| run.experiment() == Some(experiment))
            .collect();
        match matches.as_slice() {
            [run] => Ok(run),
            [] => Err(PipelineError::MissingExperiment(experiment.to_string())),
            many => Err(PipelineError::AmbiguousExperiment {
                experiment: experiment.to_string(),
                keys: many.iter().map(|run| run.key.clone()).collect(),
            }),
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<Run> {
        self.runs.remove(key)
    }

    pub fn into_runs(self) -> impl Iterator<Item = Run> {
        self.runs.into_values()
    }
}

/// Groups opened datasets by run key and merges each group.
pub fn merge_variables(
    opened: Vec<(CatalogEntry, Dataset)>,
) -> Result<DatasetCollection, DatasetError> {
    let mut groups: BTreeMap<String, (BTreeMap<String, String>, Vec<Dataset>)> = BTreeMap::new();
    for (entry, dataset) in opened {
        let key = run_key(&entry);
        let facets: BTreeMap<String, String> = RUN_KEY_FACETS
            .iter()
            .filter_map(|facet| {
                entry
                    .facet(*facet)
                    .map(|value| (facet.column().to_string(), value.to_string()))
            })
            .collect();
        groups
            .entry(key)
            .or_insert_with(|| (facets, Vec::new()))
            .1
            .push(dataset);
    }

    let mut runs = Vec::with_capacity(groups.len());
    for (key, (facets, datasets)) in groups {
        debug!("Merging {} datasets for {}", datasets.len(), key);
        let dataset = combine::merge(&key, datasets)?;
        runs.push(Run {
            key,
            facets,
            dataset,
        });
    }
    Ok(DatasetCollection::from_runs(runs))
}

/// Runs `op` until it succeeds, fails with a non-transient error or the
/// policy's attempts are used up.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> PipelineResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = PipelineResult<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < max_attempts => {
                let delay = policy.backoff(attempt);
                warn!(
                    "{} failed (attempt {}/{}): {}. Retrying in {:.1}s",
                    what,
                    attempt,
                    max_attempts,
                    e,
                    delay.as_secs_f64()
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Searches a catalog and materializes the hits through a [`DatasetSource`]
pub struct CatalogResolver<S: DatasetSource> {
    catalog_url: String,
    source: S,
    retry: RetryPolicy,
    show_progress: bool,
}

impl<S: DatasetSource> CatalogResolver<S> {
    pub fn new(catalog_url: &str, source: S) -> Self {
        CatalogResolver {
            catalog_url: catalog_url.to_string(),
            source,
            retry: RetryPolicy::default(),
            show_progress: true,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    /// Catalog search, materialization and merge, retried as a whole.
    pub async fn resolve(&self, filter: &FilterSpec) -> PipelineResult<DatasetCollection> {
        with_retry(&self.retry, "Catalog resolution", |attempt| async move {
            debug!("Catalog resolution attempt {}", attempt);
            self.resolve_once(filter).await
        })
        .await
    }

    async fn resolve_once(&self, filter: &FilterSpec) -> PipelineResult<DatasetCollection> {
        let catalog = EsmCatalog::open(&self.catalog_url).await?;
        let result = catalog.search(filter)?;
        for facet in REPORTED_FACETS {
            crate::log::show_facet_values(facet, &result.unique(facet.column())?);
        }

        let entries = result.entries()?;
        info!("Materializing {} datasets", entries.len());
        let progress = self.progress_bar(entries.len() as u64);
        let mut opened = Vec::with_capacity(entries.len());
        for entry in entries {
            progress.set_message(entry.facet_or_empty(Facet::VariableId).to_string());
            let dataset = self.source.open(&entry).await?;
            opened.push((entry, dataset));
            progress.inc(1);
        }
        progress.finish_and_clear();

        let collection = merge_variables(opened)?;
        info!("Resolved {} runs", collection.len());
        Ok(collection)
    }

    fn progress_bar(&self, len: u64) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let style = ProgressStyle::with_template(
            "{spinner} [{elapsed_precise}] {bar:40} {pos}/{len} {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar());
        ProgressBar::new(len).with_style(style)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory dataset sources for tests.

    use super::*;
    use crate::error::CatalogError;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Serves prepared datasets by zarr store location.
    pub struct StaticSource {
        pub datasets: HashMap<String, Dataset>,
        /// Number of initial `open` calls that fail with a download error
        pub failures: usize,
        pub calls: AtomicUsize,
    }

    impl StaticSource {
        pub fn new(datasets: HashMap<String, Dataset>) -> Self {
            StaticSource {
                datasets,
                failures: 0,
                calls: AtomicUsize::new(0),
            }
        }

        pub fn failing(mut self, failures: usize) -> Self {
            self.failures = failures;
            self
        }
    }

    #[async_trait]
    impl DatasetSource for StaticSource {
        async fn open(&self, entry: &CatalogEntry) -> Result<Dataset, CatalogError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(CatalogError::Download {
                    zstore: entry.zstore.clone(),
                    reason: "connection reset".to_string(),
                });
            }
            self.datasets
                .get(&entry.zstore)
                .cloned()
                .ok_or_else(|| CatalogError::InvalidMetadata {
                    zstore: entry.zstore.clone(),
                    reason: "unknown store".to_string(),
                })
        }
    }

    /// Renames the synthetic `tas` variable.
    pub fn with_variable(mut ds: Dataset, name: &str) -> Dataset {
        if let Some(var) = ds.data_vars.remove("tas") {
            ds.data_vars.insert(name.to_string(), var);
        }
        ds
    }
}
