use crate::cli::{Cli, OutputFormat};
use crate::daemon::DaemonConfig;
use crate::error::ConfigurationError;
use crate::filesystem::ArtifactUri;
use crate::scenario_repository::{CheckConfiguration, CompileMode};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Prefix of all environment overrides
pub const ENV_PREFIX: &str = "SCENARIO_VALIDATOR_";

/// Trait for abstracting environment variable access
pub trait EnvProvider {
    fn get(&self, key: &str) -> Option<String>;
}

/// System environment variable provider for production use
pub struct SystemEnvProvider;

impl EnvProvider for SystemEnvProvider {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParsing(#[from] toml::de::Error),

    #[error("JSON parsing error: {0}")]
    JsonParsing(#[from] serde_json::Error),

    #[error("Configuration validation error: {0}")]
    Validation(String),

    #[error("Environment variable error: {0}")]
    Environment(String),

    #[error("Unsupported configuration file format: {0}")]
    UnsupportedFormat(String),

    #[error(transparent)]
    Location(#[from] ConfigurationError),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub repository: RepositoryConfig,
    pub daemon: DaemonSettings,
    pub output: OutputConfig,
    pub files: FileConfig,
}

/// Where scenarios and their artifacts come from
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Scenario definition location (`file` or `archive.zip!/entry`)
    pub scenarios: Option<String>,
    /// Repository root; the definition's directory when unset
    pub repository: Option<String>,
    /// Eager or lazy artifact compilation
    pub compile: CompileMode,
    /// Maximum number of compiled artifacts kept in memory
    pub artifact_cache_entries: u64,
}

/// Daemon listener and worker pool
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonSettings {
    pub host: String,
    pub port: u16,
    /// Concurrent checks; the number of CPUs when unset
    pub threads: Option<usize>,
    pub request_timeout_seconds: u64,
    pub max_request_mb: usize,
}

/// Output configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct OutputConfig {
    /// Directory receiving `<input>-report.xml` files; the working directory when unset
    pub directory: Option<PathBuf>,
    /// Print reports to stdout
    pub print: bool,
    /// Summary format
    pub format: OutputFormatConfig,
    /// Verbose output
    pub verbose: bool,
    /// Quiet mode (errors only)
    pub quiet: bool,
    /// Log peak memory after each input
    pub memory_stats: bool,
}

/// File discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FileConfig {
    /// File extensions to process
    pub extensions: Vec<String>,
    /// Include patterns (glob syntax)
    pub include_patterns: Vec<String>,
    /// Exclude patterns (glob syntax)
    pub exclude_patterns: Vec<String>,
    /// Descend into subdirectories
    pub recursive: bool,
}

/// Output format configuration (serializable version of CLI OutputFormat)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormatConfig {
    #[default]
    Human,
    Json,
    Summary,
}

impl From<OutputFormat> for OutputFormatConfig {
    fn from(format: OutputFormat) -> Self {
        match format {
            OutputFormat::Human => OutputFormatConfig::Human,
            OutputFormat::Json => OutputFormatConfig::Json,
            OutputFormat::Summary => OutputFormatConfig::Summary,
        }
    }
}

impl From<OutputFormatConfig> for OutputFormat {
    fn from(format: OutputFormatConfig) -> Self {
        match format {
            OutputFormatConfig::Human => OutputFormat::Human,
            OutputFormatConfig::Json => OutputFormat::Json,
            OutputFormatConfig::Summary => OutputFormat::Summary,
        }
    }
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            scenarios: None,
            repository: None,
            compile: CompileMode::Eager,
            artifact_cache_entries: crate::content_repository::DEFAULT_ARTIFACT_CACHE_ENTRIES,
        }
    }
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8080,
            threads: None,
            request_timeout_seconds: 30,
            max_request_mb: 16,
        }
    }
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            extensions: vec!["xml".to_string()],
            include_patterns: vec![],
            exclude_patterns: vec![],
            recursive: false,
        }
    }
}

impl Config {
    /// What the scenario repository should load
    pub fn check_configuration(&self) -> Result<CheckConfiguration> {
        let scenarios = self.repository.scenarios.as_deref().ok_or_else(|| {
            ConfigError::Validation(
                "No scenario configuration given (use --scenarios or SCENARIO_VALIDATOR_SCENARIOS)"
                    .to_string(),
            )
        })?;

        let mut configuration = CheckConfiguration::new(ArtifactUri::parse(scenarios)?)
            .with_compile_mode(self.repository.compile);
        if let Some(repository) = &self.repository.repository {
            configuration = configuration.with_repository(ArtifactUri::parse(repository)?);
        }
        configuration.artifact_cache_entries = self.repository.artifact_cache_entries;
        Ok(configuration)
    }

    pub fn daemon_config(&self) -> DaemonConfig {
        DaemonConfig {
            host: self.daemon.host.clone(),
            port: self.daemon.port,
            workers: ConfigManager::get_thread_count(self),
            request_timeout: ConfigManager::get_request_timeout(self),
            max_request_bytes: self.daemon.max_request_mb * 1024 * 1024,
        }
    }
}

impl RepositoryConfig {
    fn merge_from(&mut self, other: RepositoryConfig) {
        self.scenarios = other.scenarios.or(self.scenarios.take());
        self.repository = other.repository.or(self.repository.take());
        self.compile = other.compile;
        self.artifact_cache_entries = other.artifact_cache_entries;
    }
}

impl DaemonSettings {
    fn merge_from(&mut self, other: DaemonSettings) {
        self.threads = other.threads.or(self.threads);
        self.host = other.host;
        self.port = other.port;
        self.request_timeout_seconds = other.request_timeout_seconds;
        self.max_request_mb = other.max_request_mb;
    }
}

impl OutputConfig {
    /// Where report files go
    pub fn report_directory(&self) -> PathBuf {
        self.directory
            .clone()
            .unwrap_or_else(|| PathBuf::from("."))
    }

    fn merge_from(&mut self, other: OutputConfig) {
        self.directory = other.directory.or(self.directory.take());
        self.print = other.print;
        self.format = other.format;
        self.verbose = other.verbose;
        self.quiet = other.quiet;
        self.memory_stats = other.memory_stats;
    }
}

impl FileConfig {
    /// Empty lists in `other` keep the current value
    fn merge_from(&mut self, other: FileConfig) {
        for (current, incoming) in [
            (&mut self.extensions, other.extensions),
            (&mut self.include_patterns, other.include_patterns),
            (&mut self.exclude_patterns, other.exclude_patterns),
        ] {
            if !incoming.is_empty() {
                *current = incoming;
            }
        }
        self.recursive = other.recursive;
    }
}

/// Builds the effective [`Config`] from defaults, a config file, the environment and the CLI
pub struct ConfigManager;

impl ConfigManager {
    /// Defaults, then the config file, then `SCENARIO_VALIDATOR_*`, then command-line flags
    pub async fn load_config(cli: &Cli) -> Result<Config> {
        let file_config = match &cli.config {
            Some(path) => Some(Self::load_from_file(path).await?),
            None => Self::find_config_file().await?,
        };
        let config = match file_config {
            Some(file_config) => Self::merge_configs(Config::default(), file_config),
            None => Config::default(),
        };

        let config = Self::merge_with_cli(Self::apply_environment_overrides(config)?, cli);
        Self::validate_config(&config)?;
        Ok(config)
    }

    /// Read a TOML or JSON config file; without an extension TOML is tried first
    pub async fn load_from_file(path: &Path) -> Result<Config> {
        let content = tokio::fs::read_to_string(path).await?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Ok(toml::from_str(&content)?),
            Some("json") => Ok(serde_json::from_str(&content)?),
            Some(ext) => Err(ConfigError::UnsupportedFormat(ext.to_string())),
            None => match toml::from_str::<Config>(&content) {
                Ok(config) => Ok(config),
                Err(_) => Ok(serde_json::from_str(&content)?),
            },
        }
    }

    /// Look in the working directory, then in `<config dir>/scenario-validator`
    pub async fn find_config_file() -> Result<Option<Config>> {
        const NAMES: [&str; 4] = [
            "scenario-validator.toml",
            "scenario-validator.json",
            ".scenario-validator.toml",
            ".scenario-validator.json",
        ];

        let mut directories = vec![PathBuf::from(".")];
        if let Some(config_dir) = dirs::config_dir() {
            directories.push(config_dir.join("scenario-validator"));
        }

        for directory in directories {
            if let Some(path) = NAMES
                .iter()
                .map(|name| directory.join(name))
                .find(|path| path.is_file())
            {
                debug!("Using configuration file {}", path.display());
                return Ok(Some(Self::load_from_file(&path).await?));
            }
        }
        Ok(None)
    }

    pub fn apply_environment_overrides(config: Config) -> Result<Config> {
        Self::apply_environment_overrides_with(&SystemEnvProvider, config)
    }

    /// Apply `SCENARIO_VALIDATOR_*` variables read through `env`
    pub fn apply_environment_overrides_with(
        env: &impl EnvProvider,
        mut config: Config,
    ) -> Result<Config> {
        let var = |name: &str| env.get(&format!("{}{}", ENV_PREFIX, name));

        if let Some(scenarios) = var("SCENARIOS") {
            config.repository.scenarios = Some(scenarios);
        }
        if let Some(repository) = var("REPOSITORY") {
            config.repository.repository = Some(repository);
        }
        if let Some(compile) = var("COMPILE") {
            config.repository.compile = match compile.to_lowercase().as_str() {
                "eager" => CompileMode::Eager,
                "lazy" => CompileMode::Lazy,
                _ => return Err(invalid_env("COMPILE", &compile)),
            };
        }
        if let Some(entries) = parsed_env(env, "CACHE_ENTRIES")? {
            config.repository.artifact_cache_entries = entries;
        }

        if let Some(host) = var("HOST") {
            config.daemon.host = host;
        }
        if let Some(port) = parsed_env(env, "PORT")? {
            config.daemon.port = port;
        }
        if let Some(threads) = parsed_env(env, "THREADS")? {
            config.daemon.threads = Some(threads);
        }
        if let Some(seconds) = parsed_env(env, "REQUEST_TIMEOUT")? {
            config.daemon.request_timeout_seconds = seconds;
        }
        if let Some(megabytes) = parsed_env(env, "MAX_REQUEST_MB")? {
            config.daemon.max_request_mb = megabytes;
        }

        if let Some(directory) = var("OUTPUT_DIRECTORY") {
            config.output.directory = Some(PathBuf::from(directory));
        }
        if let Some(format) = var("FORMAT") {
            config.output.format = match format.to_lowercase().as_str() {
                "human" => OutputFormatConfig::Human,
                "json" => OutputFormatConfig::Json,
                "summary" => OutputFormatConfig::Summary,
                _ => return Err(invalid_env("FORMAT", &format)),
            };
        }
        if let Some(verbose) = parsed_env(env, "VERBOSE")? {
            config.output.verbose = verbose;
        }
        if let Some(quiet) = parsed_env(env, "QUIET")? {
            config.output.quiet = quiet;
        }

        if let Some(extensions) = var("EXTENSIONS") {
            config.files.extensions = extensions
                .split(',')
                .map(str::trim)
                .filter(|ext| !ext.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(recursive) = parsed_env(env, "RECURSIVE")? {
            config.files.recursive = recursive;
        }

        Ok(config)
    }

    /// Command-line flags override everything; switches only ever turn features on
    pub fn merge_with_cli(mut config: Config, cli: &Cli) -> Config {
        if let Some(scenarios) = &cli.scenarios {
            config.repository.scenarios = Some(scenarios.clone());
        }
        if let Some(repository) = &cli.repository {
            config.repository.repository = Some(repository.clone());
        }
        if cli.lazy {
            config.repository.compile = CompileMode::Lazy;
        }

        if let Some(host) = &cli.host {
            config.daemon.host = host.clone();
        }
        config.daemon.port = cli.port.unwrap_or(config.daemon.port);
        config.daemon.threads = cli.threads.or(config.daemon.threads);

        if let Some(directory) = &cli.output_directory {
            config.output.directory = Some(directory.clone());
        }
        config.output.print |= cli.print;
        config.output.memory_stats |= cli.memory_stats;
        if let Some(format) = cli.format {
            config.output.format = format.into();
        }
        if cli.verbose || cli.debug {
            (config.output.verbose, config.output.quiet) = (true, false);
        } else if cli.quiet {
            (config.output.verbose, config.output.quiet) = (false, true);
        }

        let recursive = config.files.recursive || cli.recursive;
        config.files.merge_from(FileConfig {
            extensions: cli.extensions.clone(),
            include_patterns: cli.include_patterns.clone(),
            exclude_patterns: cli.exclude_patterns.clone(),
            recursive,
        });

        config
    }

    /// Layer `override_config` over `base`. Unset options and empty lists keep the base value.
    pub fn merge_configs(mut base: Config, override_config: Config) -> Config {
        base.repository.merge_from(override_config.repository);
        base.daemon.merge_from(override_config.daemon);
        base.output.merge_from(override_config.output);
        base.files.merge_from(override_config.files);
        base
    }

    /// Reject settings the validator can not run with, listing every problem found
    pub fn validate_config(config: &Config) -> Result<()> {
        let mut problems = Vec::new();

        match config.daemon.threads {
            Some(0) => problems.push("at least one worker thread is required".to_string()),
            Some(threads) if threads > MAX_THREADS => problems.push(format!(
                "{} worker threads requested, the maximum is {}",
                threads, MAX_THREADS
            )),
            _ => {}
        }
        if config.daemon.request_timeout_seconds == 0 {
            problems.push("the request timeout must be at least one second".to_string());
        }
        if config.daemon.max_request_mb == 0 {
            problems.push("the request size limit must be at least 1 MB".to_string());
        }
        if config.repository.artifact_cache_entries == 0 {
            problems.push("the artifact cache must hold at least one entry".to_string());
        }
        if config.output.verbose && config.output.quiet {
            problems.push("verbose and quiet output exclude each other".to_string());
        }
        if config.files.extensions.is_empty() {
            problems.push("no document extensions configured".to_string());
        }
        problems.extend(
            config
                .files
                .extensions
                .iter()
                .filter(|ext| ext.contains(['/', '\\', '.']))
                .map(|ext| format!("'{}' is not a bare file extension", ext)),
        );

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(problems.join("; ")))
        }
    }

    /// Worker count for the daemon and the CLI pool
    pub fn get_thread_count(config: &Config) -> usize {
        config.daemon.threads.unwrap_or_else(num_cpus::get)
    }

    pub fn get_request_timeout(config: &Config) -> Duration {
        Duration::from_secs(config.daemon.request_timeout_seconds)
    }
}

const MAX_THREADS: usize = 1000;

fn parsed_env<T: FromStr>(env: &impl EnvProvider, name: &str) -> Result<Option<T>> {
    env.get(&format!("{}{}", ENV_PREFIX, name))
        .map(|value| value.trim().parse().map_err(|_| invalid_env(name, &value)))
        .transpose()
}

fn invalid_env(name: &str, value: &str) -> ConfigError {
    ConfigError::Environment(format!("{}{} has an invalid value '{}'", ENV_PREFIX, name, value))
}
