use crate::config::PipelineConfig;
use crate::dataset::Dataset;
use crate::query::{Facet, FilterSpec};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

static QUIET: AtomicBool = AtomicBool::new(false);

/// Silences the console summaries below. Log records are unaffected.
pub fn set_quiet(quiet: bool) {
    QUIET.store(quiet, Ordering::Relaxed);
}

pub fn is_quiet() -> bool {
    QUIET.load(Ordering::Relaxed)
}

macro_rules! say {
    ($($arg:tt)*) => {
        if !is_quiet() {
            println!($($arg)*);
        }
    };
}

pub fn show_greeting(config_path: Option<&str>) {
    say!("=== GFDL-CM4 CMIP6 Retrieval ===");
    match config_path {
        Some(path) => say!("Loading configuration from: {}", path),
        None => say!("Using built-in configuration"),
    }
}

pub fn config_echo(config: &PipelineConfig) {
    say!("\nConfiguration:");
    say!("  Catalog: {}", config.catalog_url);
    say!("  Project root: {}", config.project_root.display());
    say!("  Output: {}", config.output_path().display());
    say!(
        "  Experiments: {} (+0K), {} (+4K)",
        config.reference_experiment, config.perturbed_experiment
    );
    say!("  Time cutoff: {}", config.time_cutoff);
    say!("  Retry attempts: {}", config.retry.max_attempts);
}

pub fn show_query(filter: &FilterSpec) {
    say!("\nQuery:");
    for (facet, values) in filter.facets() {
        let values: Vec<&str> = values.iter().map(String::as_str).collect();
        say!("  {}: {}", facet, values.join(", "));
    }
}

pub fn show_facet_values(facet: Facet, values: &BTreeSet<String>) {
    let values: Vec<&str> = values.iter().map(String::as_str).collect();
    say!("{}: [{}]", facet, values.join(", "));
}

pub fn show_selected_runs(reference: &str, perturbed: &str) {
    say!("\nSelected runs:");
    say!("  +0K: {}", reference);
    say!("  +4K: {}", perturbed);
}

pub fn show_dataset_summary(ds: &Dataset) {
    say!("\n{}", ds);
}

pub fn show_destination(path: &Path) {
    say!("Saving to: {}", path.display());
}

pub fn show_file_size(size_gb: f64) {
    say!("File size: {:.3} GB", size_gb);
}

pub fn show_farewell_with_timing(elapsed: Duration) {
    say!(
        "\n=== Retrieval completed successfully in {:.1}s! ===",
        elapsed.as_secs_f64()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quiet_toggle() {
        assert!(!is_quiet());
        set_quiet(true);
        assert!(is_quiet());
        show_destination(Path::new("/tmp/unused.nc"));
        set_quiet(false);
        assert!(!is_quiet());
    }
}
