//! Configuration module for the iperf-reactor server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the test server
#[derive(Parser, Debug)]
#[command(name = "iperf-reactor")]
#[command(author = "iperf-reactor authors")]
#[command(version = "0.1.0")]
#[command(about = "An iperf3-compatible throughput test server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:5201)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Upper bound on one poll wait, in milliseconds
    #[arg(long)]
    pub poll_timeout_ms: Option<u64>,

    /// Readiness events handled per poll
    #[arg(long)]
    pub max_events: Option<usize>,

    /// Serve a single test, then exit
    #[arg(short = '1', long)]
    pub one_off: bool,

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
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Upper bound on one poll wait, in milliseconds
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    /// Readiness events handled per poll
    #[serde(default = "default_max_events")]
    pub max_events: usize,
    /// Serve a single test, then exit
    #[serde(default)]
    pub one_off: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            poll_timeout_ms: default_poll_timeout_ms(),
            max_events: default_max_events(),
            one_off: false,
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
    "0.0.0.0:5201".to_string()
}

fn default_poll_timeout_ms() -> u64 {
    500
}

fn default_max_events() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub poll_timeout: Duration,
    pub max_events: usize,
    pub one_off: bool,
    pub log_level: String,
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

        Ok(Self::merge(cli, toml_config))
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            poll_timeout: Duration::from_millis(
                cli.poll_timeout_ms
                    .unwrap_or(toml_config.server.poll_timeout_ms),
            ),
            max_events: cli
                .max_events
                .unwrap_or(toml_config.server.max_events)
                .max(1),
            one_off: cli.one_off || toml_config.server.one_off,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        }
    }

    /// Parse the listen address.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen
            .parse()
            .map_err(|e| ConfigError::InvalidListen(self.listen.clone(), e))
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    InvalidListen(String, std::net::AddrParseError),
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
                write!(f, "Invalid listen address '{}': {}", addr, e)
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
        let config = TomlConfig::default();
        assert_eq!(config.server.listen, "0.0.0.0:5201");
        assert_eq!(config.server.poll_timeout_ms, 500);
        assert_eq!(config.server.max_events, 1024);
        assert!(!config.server.one_off);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "127.0.0.1:5202"
            poll_timeout_ms = 100
            one_off = true

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:5202");
        assert_eq!(config.server.poll_timeout_ms, 100);
        assert_eq!(config.server.max_events, 1024);
        assert!(config.server.one_off);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_toml() {
        let cli = CliArgs::parse_from([
            "iperf-reactor",
            "-l",
            "127.0.0.1:6000",
            "--one-off",
            "--log-level",
            "trace",
        ]);
        let toml_config: TomlConfig = toml::from_str("[server]\npoll_timeout_ms = 50\n").unwrap();

        let config = Config::merge(cli, toml_config);
        assert_eq!(config.listen, "127.0.0.1:6000");
        assert_eq!(config.poll_timeout, Duration::from_millis(50));
        assert!(config.one_off);
        assert_eq!(config.log_level, "trace");
        assert_eq!(config.listen_addr().unwrap().port(), 6000);
    }

    #[test]
    fn test_invalid_listen() {
        let cli = CliArgs::parse_from(["iperf-reactor", "--listen", "not-an-address"]);
        let config = Config::merge(cli, TomlConfig::default());
        assert!(matches!(
            config.listen_addr(),
            Err(ConfigError::InvalidListen(_, _))
        ));
    }
}
