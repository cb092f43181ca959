use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use scenario_validator::cli::Cli;
use scenario_validator::config::{Config, ConfigManager};
use scenario_validator::daemon;
use scenario_validator::file_discovery::FileDiscovery;
use scenario_validator::libxml2::LibXml2Engine;
use scenario_validator::output::Output;
use scenario_validator::pipeline::Check;
use scenario_validator::scenario_repository::ScenarioRepository;
use scenario_validator::tasks::{PrintMemoryStats, PrintReportAction, SerializeReportAction};

const EXIT_ACCEPTED: u8 = 0;
const EXIT_REJECTED: u8 = 1;
const EXIT_SETUP_FAILURE: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse_args();
    init_logging(&cli);

    match run(cli).await {
        Ok(true) => ExitCode::from(EXIT_ACCEPTED),
        Ok(false) => ExitCode::from(EXIT_REJECTED),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(EXIT_SETUP_FAILURE)
        }
    }
}

fn init_logging(cli: &Cli) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.verbosity().filter_directive()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// `Ok(true)` when every input was acceptable
async fn run(cli: Cli) -> Result<bool> {
    let config = ConfigManager::load_config(&cli)
        .await
        .context("Invalid configuration")?;

    LibXml2Engine::require_transforms().context("Can not check documents with this build")?;
    let check_configuration = config.check_configuration()?;
    let engine = Arc::new(LibXml2Engine::new());
    let repository = tokio::task::spawn_blocking(move || {
        ScenarioRepository::load(engine, &check_configuration)
    })
    .await?
    .context("Can not load scenarios")?;
    let repository = Arc::new(repository);

    if cli.daemon {
        let ignored = cli.daemon_ignored_options();
        if !ignored.is_empty() {
            warn!(
                "The following options have no effect in daemon mode: {}",
                ignored.join(", ")
            );
        }
        let check = Arc::new(Check::new(repository)?);
        daemon::serve(check, config.daemon_config()).await?;
        return Ok(true);
    }

    let check = build_check(Check::new(repository)?, &config)?;
    let files = FileDiscovery::from_config(&config.files)?.discover(&cli.targets)?;
    let threads = ConfigManager::get_thread_count(&config);
    info!("Checking {} documents with {} threads", files.len(), threads);

    let started = Instant::now();
    let results = tokio::task::spawn_blocking(move || check.check_all(&files, threads)).await??;
    let elapsed = started.elapsed();

    let output = Output::new(config.output.format.into(), cli.verbosity());
    print!("{}", output.format_results(&results, elapsed));

    Ok(results.iter().all(|result| result.is_acceptable()))
}

fn build_check(mut check: Check<LibXml2Engine>, config: &Config) -> Result<Check<LibXml2Engine>> {
    let directory = config.output.report_directory();
    std::fs::create_dir_all(&directory)
        .with_context(|| format!("Can not create output directory {}", directory.display()))?;
    check = check.with_post_action(SerializeReportAction::new(directory));
    if config.output.print {
        check = check.with_post_action(PrintReportAction);
    }
    if config.output.memory_stats {
        check = check.with_post_action(PrintMemoryStats);
    }
    Ok(check)
}
