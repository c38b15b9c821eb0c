//! # CLI Module
//!
//! Command-line interface for cm4fetch:
//! - Argument parsing with clap
//! - Configuration file loading (JSON/YAML)
//! - Environment variable support with the CM4FETCH_ prefix
//! - Configuration merging: defaults < file < environment < flags
//! - Subcommands for running, inspecting and templating

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::query::FilterSpec;
use clap::{Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Fetch GFDL-CM4 amip and amip-p4K fields from the Pangeo CMIP6 catalog
#[derive(Parser, Debug)]
#[command(name = "cm4fetch")]
#[command(about = "Retrieve, mask and archive GFDL-CM4 amip/amip-p4K daily data")]
#[command(version)]
#[command(long_about = "
cm4fetch searches the Pangeo CMIP6 catalog for the GFDL-CM4 amip and amip-p4K
daily (Eday) fields, merges the variables of each run, keeps the days before
2015, concatenates both runs along a new 'forcing' dimension (+0K, +4K), masks
them to North America and the adjacent oceans and writes one netCDF file.

Running without a subcommand executes the full pipeline.

EXAMPLES:
  # Full pipeline with the built-in configuration
  cm4fetch

  # Custom configuration and output
  cm4fetch --config cm4fetch.yaml --output /scratch/me/GFDL-CM4.nc

  # Show what would be fetched
  cm4fetch run --dry-run

  # Describe the written archive
  cm4fetch inspect /scratch/me/GFDL-CM4.nc --format json

  # Generate a configuration template
  cm4fetch template --format yaml -o cm4fetch.yaml
")]
pub struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Quiet mode - suppress all output except errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Configuration file path (JSON or YAML)
    #[arg(short, long, global = true, env = "CM4FETCH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Output netCDF path, overriding the configured destination
    #[arg(long, global = true)]
    pub output: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Commands {
    /// Run the full retrieval pipeline (default)
    Run {
        /// Print the query and resolved configuration without fetching
        #[arg(long, env = "CM4FETCH_DRY_RUN")]
        dry_run: bool,
    },

    /// Print the catalog query
    Query {
        #[arg(long, value_enum, default_value_t = ConfigFormat::Json)]
        format: ConfigFormat,
    },

    /// Generate a configuration template
    #[command(long_about = "
Generate a configuration file with every setting at its default value.

EXAMPLES:
  cm4fetch template
  cm4fetch template --format yaml -o cm4fetch.yaml
")]
    Template {
        /// Configuration format
        #[arg(long, value_enum, default_value_t = ConfigFormat::Json)]
        format: ConfigFormat,

        /// Output file path (default: stdout)
        #[arg(short = 'o', long = "file")]
        file: Option<PathBuf>,
    },

    /// Show information about an exported archive
    Inspect {
        /// netCDF file path
        file: PathBuf,

        /// Output format for file information
        #[arg(long, value_enum, default_value_t = OutputFormat::Human)]
        format: OutputFormat,
    },

    /// Generate shell completions
    #[command(long_about = "
Generate shell completion scripts for bash, zsh, fish, elvish and PowerShell.

EXAMPLES:
  cm4fetch completions bash > ~/.bash_completion.d/cm4fetch
  cm4fetch completions zsh -o _cm4fetch
")]
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,

        /// Output file path (default: stdout)
        #[arg(short = 'o', long = "file")]
        file: Option<PathBuf>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Human-readable output
    Human,
    /// JSON structured output
    Json,
    /// YAML structured output
    Yaml,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigFormat {
    /// JSON configuration format
    Json,
    /// YAML configuration format
    Yaml,
}

impl Cli {
    /// The requested command; no subcommand means a full run.
    pub fn command(&self) -> Commands {
        self.command
            .clone()
            .unwrap_or(Commands::Run { dry_run: false })
    }

    /// Log level from the flags, falling back to the configured level, then `info`.
    pub fn log_level(&self, configured: Option<&str>) -> LevelFilter {
        if self.verbose {
            LevelFilter::Debug
        } else if self.quiet {
            LevelFilter::Error
        } else {
            configured
                .and_then(|level| level.parse().ok())
                .unwrap_or(LevelFilter::Info)
        }
    }

    /// Configuration from the file given with `--config` (or defaults), with
    /// environment overrides applied and validated.
    pub fn load_config(&self) -> Result<PipelineConfig, PipelineError> {
        self.load_config_with(|key| std::env::var(format!("{}{}", crate::config::ENV_PREFIX, key)).ok())
    }

    /// As [`Cli::load_config`], reading overrides from `lookup`.
    pub fn load_config_with<F>(&self, lookup: F) -> Result<PipelineConfig, PipelineError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config = match &self.config {
            Some(path) => PipelineConfig::from_file(path)?,
            None => PipelineConfig::default(),
        };
        let config = config.with_overrides_from(lookup)?;
        config.validate()?;
        Ok(config)
    }
}

/// Serializes the catalog query.
pub fn render_query(filter: &FilterSpec, format: ConfigFormat) -> Result<String, PipelineError> {
    match format {
        ConfigFormat::Json => {
            serde_json::to_string_pretty(filter).map_err(|e| PipelineError::Config(e.to_string()))
        }
        ConfigFormat::Yaml => {
            serde_yaml::to_string(filter).map_err(|e| PipelineError::Config(e.to_string()))
        }
    }
}

/// Serializes a configuration as a template.
pub fn render_config(config: &PipelineConfig, format: ConfigFormat) -> Result<String, PipelineError> {
    match format {
        ConfigFormat::Json => config.to_json(),
        ConfigFormat::Yaml => config.to_yaml(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::cm4_query;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_default_command_is_run() {
        let cli = Cli::parse_from(["cm4fetch"]);
        assert_eq!(cli.command(), Commands::Run { dry_run: false });
    }

    #[test]
    fn test_log_level() {
        let cli = Cli::parse_from(["cm4fetch", "--verbose"]);
        assert_eq!(cli.log_level(Some("warn")), LevelFilter::Debug);
        let cli = Cli::parse_from(["cm4fetch", "-q"]);
        assert_eq!(cli.log_level(None), LevelFilter::Error);
        let cli = Cli::parse_from(["cm4fetch"]);
        assert_eq!(cli.log_level(Some("warn")), LevelFilter::Warn);
        assert_eq!(cli.log_level(Some("loud")), LevelFilter::Info);
        assert_eq!(cli.log_level(None), LevelFilter::Info);
    }

    #[test]
    fn test_load_config_layers() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let path = dir.path().join("cm4fetch.yaml");
        std::fs::write(&path, "output_file: from-file.nc\nretry:\n  max_attempts: 4\n")?;

        let cli = Cli::parse_from(["cm4fetch", "--config", path.to_str().unwrap()]);
        let config = cli.load_config_with(no_env)?;
        assert_eq!(config.output_file, PathBuf::from("from-file.nc"));
        assert_eq!(config.retry.max_attempts, 4);

        let env: HashMap<&str, &str> = [("OUTPUT", "/env/out.nc")].into_iter().collect();
        let config = cli.load_config_with(|k| env.get(k).map(|v| v.to_string()))?;
        assert_eq!(config.output_file, PathBuf::from("/env/out.nc"));
        assert_eq!(config.retry.max_attempts, 4);
        Ok(())
    }

    #[test]
    fn test_load_config_rejects_invalid() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let path = dir.path().join("cm4fetch.json");
        std::fs::write(&path, r#"{ "retry": { "max_attempts": 0 } }"#)?;
        let cli = Cli::parse_from(["cm4fetch", "-c", path.to_str().unwrap()]);
        assert!(matches!(
            cli.load_config_with(no_env),
            Err(PipelineError::Config(_))
        ));
        Ok(())
    }

    #[test]
    fn test_render_query() {
        let json = render_query(&cm4_query(), ConfigFormat::Json).unwrap();
        let parsed: FilterSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, cm4_query());
        assert!(json.contains("\"experiment_id\""));

        let yaml = render_query(&cm4_query(), ConfigFormat::Yaml).unwrap();
        assert!(yaml.contains("amip-p4K"));
    }

    #[test]
    fn test_render_config_template() {
        let config = PipelineConfig::default();
        let yaml = render_config(&config, ConfigFormat::Yaml).unwrap();
        assert_eq!(PipelineConfig::from_yaml(&yaml).unwrap(), config);
        let json = render_config(&config, ConfigFormat::Json).unwrap();
        assert_eq!(PipelineConfig::from_json(&json).unwrap(), config);
    }
}
