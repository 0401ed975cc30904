//! Configuration module for caret-echo.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::{AddrParseError, SocketAddr};
use std::path::PathBuf;

/// Concurrency strategy used to serve connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// One connection at a time, blocking I/O
    Sequential,
    /// One OS thread per connection, blocking I/O
    Threaded,
    /// Single-threaded reactor over select(2)
    Select,
    /// Single-threaded reactor over mio (epoll/kqueue)
    Mio,
}

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "caret-echo")]
#[command(author = "caret-echo authors")]
#[command(version = "0.1.0")]
#[command(about = "Marker-delimited echo server", long_about = None)]
pub struct CliArgs {
    /// Port to listen on; overrides the port of the listen address
    pub port: Option<u16>,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:9090)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Concurrency strategy
    #[arg(short = 's', long, value_enum)]
    pub strategy: Option<Strategy>,

    /// Directory for per-connection payload files
    #[arg(long)]
    pub sink_dir: Option<PathBuf>,

    /// Maximum number of concurrent reactor connections
    #[arg(short = 'm', long)]
    pub max_connections: Option<usize>,

    /// Events returned per mio wait
    #[arg(long)]
    pub events: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub sink: SinkConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_strategy")]
    pub strategy: Strategy,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Events returned per mio wait
    #[serde(default = "default_events")]
    pub events: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            strategy: default_strategy(),
            max_connections: default_max_connections(),
            events: default_events(),
        }
    }
}

/// Persistence sink configuration
#[derive(Debug, Deserialize)]
pub struct SinkConfig {
    #[serde(default = "default_sink_dir")]
    pub dir: PathBuf,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            dir: default_sink_dir(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:9090".to_string()
}

fn default_strategy() -> Strategy {
    Strategy::Mio
}

fn default_max_connections() -> usize {
    1024
}

fn default_events() -> usize {
    256
}

fn default_sink_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub strategy: Strategy,
    pub sink_dir: PathBuf,
    pub max_connections: usize,
    pub events: usize,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Resolve already-parsed CLI arguments against the optional TOML file.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let listen = cli.listen.unwrap_or(toml_config.server.listen);
        let mut addr: SocketAddr = listen
            .parse()
            .map_err(|e| ConfigError::InvalidListen(listen.clone(), e))?;
        if let Some(port) = cli.port {
            addr.set_port(port);
        }

        Ok(Config {
            listen: addr,
            strategy: cli.strategy.unwrap_or(toml_config.server.strategy),
            sink_dir: cli.sink_dir.unwrap_or(toml_config.sink.dir),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            events: cli.events.unwrap_or(toml_config.server.events),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    InvalidListen(String, AddrParseError),
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
            ConfigError::InvalidListen(addr, e) => {
                write!(f, "Invalid listen address '{addr}': {e}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}
