use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Verbosity levels for output
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum VerbosityLevel {
    /// Only show critical errors
    Quiet,
    /// Show standard information
    #[default]
    Normal,
    /// Show detailed information
    Verbose,
    /// Show all available debugging information
    Debug,
}

impl VerbosityLevel {
    /// Default `tracing` filter directive for this level
    pub fn filter_directive(&self) -> &'static str {
        match self {
            VerbosityLevel::Quiet => "error",
            VerbosityLevel::Normal => "warn",
            VerbosityLevel::Verbose => "info",
            VerbosityLevel::Debug => "debug",
        }
    }
}

/// Output format of a command line run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Human,
    Json,
    Summary,
}

/// Scenario-based XML validator
#[derive(Parser, Debug, Clone)]
#[command(name = "scenario-validator")]
#[command(about = "Check XML documents against the scenarios of a validator configuration")]
#[command(version)]
pub struct Cli {
    /// Files or directories to check
    #[arg(value_name = "TARGET")]
    pub targets: Vec<PathBuf>,

    /// Scenario configuration (file or `archive.zip!/path/scenarios.xml`)
    #[arg(short = 's', long = "scenarios", value_name = "LOCATION")]
    pub scenarios: Option<String>,

    /// Repository holding the artifacts; defaults to the scenario configuration's directory
    #[arg(short = 'r', long = "repository", value_name = "LOCATION")]
    pub repository: Option<String>,

    /// Print each report to stdout
    #[arg(short = 'p', long = "print")]
    pub print: bool,

    /// Write each report to `<DIR>/<input>-report.xml` (default: working directory)
    #[arg(short = 'o', long = "output-directory", value_name = "DIR")]
    pub output_directory: Option<PathBuf>,

    /// Run as HTTP daemon instead of checking targets
    #[arg(short = 'D', long = "daemon")]
    pub daemon: bool,

    /// Daemon host to bind
    #[arg(short = 'H', long = "host")]
    pub host: Option<String>,

    /// Daemon port
    #[arg(short = 'P', long = "port")]
    pub port: Option<u16>,

    /// Worker threads (checks run concurrently)
    #[arg(short = 'T', long = "threads")]
    pub threads: Option<usize>,

    /// Log peak memory after each input
    #[arg(short = 'm', long = "memory-stats")]
    pub memory_stats: bool,

    /// Debug logging
    #[arg(short = 'd', long = "debug")]
    pub debug: bool,

    /// Enable verbose output
    #[arg(short = 'v', long = "verbose", help = "Enable verbose output")]
    pub verbose: bool,

    /// Enable quiet mode (errors only)
    #[arg(
        short = 'q',
        long = "quiet",
        help = "Quiet mode",
        conflicts_with = "verbose"
    )]
    pub quiet: bool,

    /// Summary output format
    #[arg(long = "format", value_enum)]
    pub format: Option<OutputFormat>,

    /// Configuration file (TOML or JSON)
    #[arg(long = "config", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Compile scenario artifacts on first use instead of at startup
    #[arg(long = "lazy")]
    pub lazy: bool,

    /// Descend into subdirectories of directory targets
    #[arg(long = "recursive")]
    pub recursive: bool,

    /// File extensions to pick up from directory targets
    #[arg(long = "extensions", value_delimiter = ',', value_name = "EXT")]
    pub extensions: Vec<String>,

    /// Include pattern (glob, repeatable)
    #[arg(long = "include", value_name = "GLOB")]
    pub include_patterns: Vec<String>,

    /// Exclude pattern (glob, repeatable)
    #[arg(long = "exclude", value_name = "GLOB")]
    pub exclude_patterns: Vec<String>,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    pub fn verbosity(&self) -> VerbosityLevel {
        if self.debug {
            VerbosityLevel::Debug
        } else if self.quiet {
            VerbosityLevel::Quiet
        } else if self.verbose {
            VerbosityLevel::Verbose
        } else {
            VerbosityLevel::Normal
        }
    }

    /// Options given on the command line that have no effect in daemon mode
    pub fn daemon_ignored_options(&self) -> Vec<&'static str> {
        let mut ignored = Vec::new();
        if !self.targets.is_empty() {
            ignored.push("TARGET");
        }
        if self.print {
            ignored.push("--print");
        }
        if self.output_directory.is_some() {
            ignored.push("--output-directory");
        }
        if self.memory_stats {
            ignored.push("--memory-stats");
        }
        if self.format.is_some() {
            ignored.push("--format");
        }
        if self.recursive {
            ignored.push("--recursive");
        }
        ignored
    }
}
