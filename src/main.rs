use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use cm4fetch::cli::{render_config, render_query, Cli, Commands, OutputFormat};
use cm4fetch::config::PipelineConfig;
use cm4fetch::info::{archive_info, print_archive_info_human, print_archive_info_json, print_archive_info_yaml};
use cm4fetch::log::{config_echo, show_farewell_with_timing, show_greeting, show_query};
use cm4fetch::run_pipeline;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.load_config().context("Failed to load configuration")?;

    env_logger::Builder::new()
        .filter_level(cli.log_level(config.log_level.as_deref()))
        .parse_default_env()
        .init();
    cm4fetch::log::set_quiet(cli.quiet);

    match cli.command() {
        Commands::Run { dry_run } => run(&cli, &config, dry_run).await,
        Commands::Query { format } => {
            println!("{}", render_query(&config.query(), format)?);
            Ok(())
        }
        Commands::Template { format, file } => {
            let rendered = render_config(&PipelineConfig::default(), format)?;
            emit(&rendered, file.as_deref())
        }
        Commands::Inspect { file, format } => {
            let info = archive_info(&file)?;
            match format {
                OutputFormat::Human => {
                    print_archive_info_human(&info);
                    Ok(())
                }
                OutputFormat::Json => print_archive_info_json(&info),
                OutputFormat::Yaml => print_archive_info_yaml(&info),
            }
        }
        Commands::Completions { shell, file } => {
            let mut command = <Cli as CommandFactory>::command();
            let mut buffer = Vec::new();
            clap_complete::generate(shell, &mut command, "cm4fetch", &mut buffer);
            match file {
                Some(path) => write_file(&path, &buffer),
                None => {
                    std::io::stdout().write_all(&buffer)?;
                    Ok(())
                }
            }
        }
    }
}

async fn run(cli: &Cli, config: &PipelineConfig, dry_run: bool) -> Result<()> {
    let start_time = Instant::now();
    let config_path = cli.config.as_ref().map(|p| p.display().to_string());

    show_greeting(config_path.as_deref());
    config_echo(config);
    show_query(&config.query());
    if dry_run {
        log::info!("Dry run, nothing fetched");
        return Ok(());
    }

    let destination: Option<PathBuf> = cli.output.clone();
    let report = run_pipeline(config, destination).await?;
    log::info!("Wrote {} ({} bytes)", report.path.display(), report.size_bytes);

    show_farewell_with_timing(start_time.elapsed());
    Ok(())
}

fn emit(contents: &str, file: Option<&Path>) -> Result<()> {
    match file {
        Some(path) => write_file(path, contents.as_bytes()),
        None => {
            println!("{}", contents);
            Ok(())
        }
    }
}

fn write_file(path: &Path, contents: &[u8]) -> Result<()> {
    std::fs::write(path, contents).with_context(|| format!("Failed to write {}", path.display()))?;
    eprintln!("Written to {}", path.display());
    Ok(())
}
