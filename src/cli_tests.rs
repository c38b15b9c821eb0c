//! # CLI Integration Tests
//!
//! Argument parsing tests for the command-line interface.

#[cfg(test)]
mod tests {
    use clap::{CommandFactory, Parser};
    use clap_complete::Shell;
    use std::path::PathBuf;

    use crate::cli::{Cli, Commands, ConfigFormat, OutputFormat};

    #[test]
    fn test_cli_help() {
        let result = Cli::try_parse_from(["cm4fetch", "--help"]);
        assert!(result.is_err()); // --help causes early exit with "error"

        let error = result.unwrap_err();
        assert!(error.to_string().contains("Retrieve, mask and archive"));
    }

    #[test]
    fn test_cli_version() {
        let result = Cli::try_parse_from(["cm4fetch", "--version"]);
        assert!(result.is_err()); // --version causes early exit
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        <Cli as CommandFactory>::command().debug_assert();
    }

    #[test]
    fn test_cli_global_flags() {
        let cli = Cli::parse_from([
            "cm4fetch",
            "--verbose",
            "--config",
            "/path/to/config.yaml",
            "--output",
            "/scratch/out.nc",
            "run",
        ]);

        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/path/to/config.yaml")));
        assert_eq!(cli.output, Some(PathBuf::from("/scratch/out.nc")));
        assert_eq!(cli.command(), Commands::Run { dry_run: false });
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::parse_from(["cm4fetch", "run", "--dry-run", "--output", "out.nc", "-q"]);
        assert!(cli.quiet);
        assert_eq!(cli.output, Some(PathBuf::from("out.nc")));
        assert_eq!(cli.command(), Commands::Run { dry_run: true });
    }

    #[test]
    fn test_query_command() {
        let cli = Cli::parse_from(["cm4fetch", "query", "--format", "yaml"]);
        assert_eq!(
            cli.command(),
            Commands::Query {
                format: ConfigFormat::Yaml
            }
        );

        let cli = Cli::parse_from(["cm4fetch", "query"]);
        assert_eq!(
            cli.command(),
            Commands::Query {
                format: ConfigFormat::Json
            }
        );
    }

    #[test]
    fn test_template_command() {
        let cli = Cli::parse_from(["cm4fetch", "template", "--format", "yaml", "-o", "cm4fetch.yaml"]);

        if let Some(Commands::Template { format, file }) = &cli.command {
            assert_eq!(format, &ConfigFormat::Yaml);
            assert_eq!(file, &Some(PathBuf::from("cm4fetch.yaml")));
        } else {
            panic!("Expected Template command");
        }
    }

    #[test]
    fn test_inspect_command() {
        let cli = Cli::parse_from(["cm4fetch", "inspect", "GFDL-CM4.nc", "--format", "json"]);

        if let Some(Commands::Inspect { file, format }) = &cli.command {
            assert_eq!(file, &PathBuf::from("GFDL-CM4.nc"));
            assert_eq!(format, &OutputFormat::Json);
        } else {
            panic!("Expected Inspect command");
        }

        // The archive path is required
        assert!(Cli::try_parse_from(["cm4fetch", "inspect"]).is_err());
    }

    #[test]
    fn test_output_format_values() {
        for (value, expected) in [
            ("human", OutputFormat::Human),
            ("json", OutputFormat::Json),
            ("yaml", OutputFormat::Yaml),
        ] {
            let cli = Cli::parse_from(["cm4fetch", "inspect", "a.nc", "--format", value]);
            match cli.command {
                Some(Commands::Inspect { format, .. }) => assert_eq!(format, expected),
                other => panic!("Expected Inspect command, got {:?}", other),
            }
        }

        assert!(Cli::try_parse_from(["cm4fetch", "inspect", "a.nc", "--format", "csv"]).is_err());
    }

    #[test]
    fn test_completions_command() {
        let cli = Cli::parse_from(["cm4fetch", "completions", "zsh", "-o", "_cm4fetch"]);

        if let Some(Commands::Completions { shell, file }) = &cli.command {
            assert_eq!(shell, &Shell::Zsh);
            assert_eq!(file, &Some(PathBuf::from("_cm4fetch")));
        } else {
            panic!("Expected Completions command");
        }

        assert!(Cli::try_parse_from(["cm4fetch", "completions", "tcsh"]).is_err());
    }

    #[test]
    fn test_unknown_subcommand() {
        assert!(Cli::try_parse_from(["cm4fetch", "convert"]).is_err());
    }

    #[test]
    fn test_verbose_quiet_conflict() {
        // Both verbose and quiet should conflict - this should fail
        let result = Cli::try_parse_from(["cm4fetch", "--verbose", "--quiet", "run"]);
        assert!(result.is_err());

        let cli_verbose = Cli::parse_from(["cm4fetch", "--verbose"]);
        assert!(cli_verbose.verbose);
        assert!(!cli_verbose.quiet);

        let cli_quiet = Cli::parse_from(["cm4fetch", "--quiet"]);
        assert!(!cli_quiet.verbose);
        assert!(cli_quiet.quiet);
    }
}
