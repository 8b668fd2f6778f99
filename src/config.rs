//! Configuration module for the ackd server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// How accepted connections are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// Submit each connection to the bounded worker pool.
    #[default]
    Pool,
    /// Run each connection to completion on the accept task.
    Inline,
}

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "ackd")]
#[command(author = "ackd authors")]
#[command(version = "0.1.0")]
#[command(about = "A concurrent TCP liveness server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Address to bind to (defaults to any local address)
    #[arg(short, long)]
    pub address: Option<IpAddr>,

    /// Number of pool workers (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Connection dispatch strategy
    #[arg(short, long, value_enum)]
    pub dispatch: Option<DispatchMode>,

    /// Seconds a connection may stay silent before it is closed
    #[arg(long)]
    pub idle_timeout: Option<u64>,

    /// Emit diagnostic output (the server is quiet by default)
    #[arg(short, long)]
    pub verbose: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub connection: ConnectionSection,
    #[serde(default)]
    pub shutdown: ShutdownSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_address")]
    pub address: IpAddr,
    /// Number of pool workers, 0 for hardware parallelism
    #[serde(default)]
    pub workers: usize,
    #[serde(default)]
    pub dispatch: DispatchMode,
    #[serde(default = "default_quiet")]
    pub quiet: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            address: default_address(),
            workers: 0,
            dispatch: DispatchMode::default(),
            quiet: default_quiet(),
        }
    }
}

/// Per-connection configuration
#[derive(Debug, Deserialize)]
pub struct ConnectionSection {
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// Sent once on connect; empty disables it
    #[serde(default = "default_greeting")]
    pub greeting: String,
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout(),
            greeting: default_greeting(),
        }
    }
}

/// Graceful shutdown intervals
#[derive(Debug, Deserialize)]
pub struct ShutdownSection {
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
    #[serde(default = "default_drain_timeout")]
    pub force_timeout_secs: u64,
}

impl Default for ShutdownSection {
    fn default() -> Self {
        Self {
            drain_timeout_secs: default_drain_timeout(),
            force_timeout_secs: default_drain_timeout(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_port() -> u16 {
    6161
}

fn default_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_quiet() -> bool {
    true
}

fn default_idle_timeout() -> u64 {
    5
}

fn default_greeting() -> String {
    "HTTP/1.1 200 OK\n\n Hello client!".to_string()
}

fn default_drain_timeout() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub workers: usize,
    pub dispatch: DispatchMode,
    pub quiet: bool,
    pub idle_timeout: Duration,
    pub greeting: String,
    pub drain_timeout: Duration,
    pub force_timeout: Duration,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Config::from_toml(TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Config::merge(cli, toml_config))
    }

    fn from_toml(toml_config: TomlConfig) -> Self {
        Config {
            listen: SocketAddr::new(toml_config.server.address, toml_config.server.port),
            workers: toml_config.server.workers,
            dispatch: toml_config.server.dispatch,
            quiet: toml_config.server.quiet,
            idle_timeout: Duration::from_secs(toml_config.connection.idle_timeout_secs),
            greeting: toml_config.connection.greeting,
            drain_timeout: Duration::from_secs(toml_config.shutdown.drain_timeout_secs),
            force_timeout: Duration::from_secs(toml_config.shutdown.force_timeout_secs),
            log_level: toml_config.logging.level,
        }
    }

    /// Merge CLI args with TOML config (CLI takes precedence)
    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let log_level = if cli.log_level != "info" {
            cli.log_level.clone()
        } else {
            toml_config.logging.level.clone()
        };

        let mut config = Config::from_toml(toml_config);
        if let Some(port) = cli.port {
            config.listen.set_port(port);
        }
        if let Some(address) = cli.address {
            config.listen.set_ip(address);
        }
        if let Some(workers) = cli.workers {
            config.workers = workers;
        }
        if let Some(dispatch) = cli.dispatch {
            config.dispatch = dispatch;
        }
        if let Some(secs) = cli.idle_timeout {
            config.idle_timeout = Duration::from_secs(secs);
        }
        if cli.verbose {
            config.quiet = false;
        }
        config.log_level = log_level;
        config
    }

    /// Filter directive used when `RUST_LOG` is not set.
    ///
    /// Quiet mode suppresses everything below errors.
    pub fn log_filter(&self) -> &str {
        if self.quiet {
            "error"
        } else {
            &self.log_level
        }
    }

    /// Resolved worker count; 0 in the config means one per CPU core.
    pub fn pool_size(&self) -> usize {
        if self.workers == 0 {
            num_cpus()
        } else {
            self.workers
        }
    }
}

pub(crate) fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.listen, "0.0.0.0:6161".parse().unwrap());
        assert!(config.quiet);
        assert_eq!(config.dispatch, DispatchMode::Pool);
        assert_eq!(config.idle_timeout, Duration::from_secs(5));
        assert_eq!(config.drain_timeout, Duration::from_secs(60));
        assert_eq!(config.force_timeout, Duration::from_secs(60));
        assert!(config.greeting.starts_with("HTTP/1.1 200 OK"));
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            port = 7000
            address = "127.0.0.1"
            workers = 4
            dispatch = "inline"
            quiet = false

            [connection]
            idle_timeout_secs = 2
            greeting = ""

            [shutdown]
            drain_timeout_secs = 10
            force_timeout_secs = 3

            [logging]
            level = "debug"
        "#;

        let parsed: TomlConfig = toml::from_str(toml_str).unwrap();
        let config = Config::from_toml(parsed);
        assert_eq!(config.listen, "127.0.0.1:7000".parse().unwrap());
        assert_eq!(config.workers, 4);
        assert_eq!(config.dispatch, DispatchMode::Inline);
        assert!(!config.quiet);
        assert_eq!(config.idle_timeout, Duration::from_secs(2));
        assert!(config.greeting.is_empty());
        assert_eq!(config.drain_timeout, Duration::from_secs(10));
        assert_eq!(config.force_timeout, Duration::from_secs(3));
        assert_eq!(config.log_filter(), "debug");
    }

    #[test]
    fn test_cli_overrides_toml() {
        let cli = CliArgs::parse_from([
            "ackd",
            "--port",
            "9000",
            "--workers",
            "2",
            "--dispatch",
            "inline",
            "--verbose",
            "--log-level",
            "trace",
        ]);
        let parsed: TomlConfig = toml::from_str("[server]\nport = 7000\nworkers = 8").unwrap();

        let config = Config::merge(cli, parsed);
        assert_eq!(config.listen.port(), 9000);
        assert_eq!(config.pool_size(), 2);
        assert_eq!(config.dispatch, DispatchMode::Inline);
        assert!(!config.quiet);
        assert_eq!(config.log_filter(), "trace");
    }

    #[test]
    fn test_quiet_suppresses_diagnostics() {
        let config = Config::default();
        assert_eq!(config.log_filter(), "error");
        assert!(config.pool_size() >= 1);
    }
}
