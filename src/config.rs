//! Configuration module for echo-bench.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values. Every value is
//! validated here, before any socket is opened.

use crate::runtime::{Interval, IntervalError};
use clap::Parser;
use serde::Deserialize;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the load generator
#[derive(Parser, Debug)]
#[command(name = "echo-bench")]
#[command(author = "echo-bench authors")]
#[command(version = "0.1.0")]
#[command(about = "Synthetic load generator for TCP echo servers", long_about = None)]
#[command(allow_negative_numbers = true)]
#[command(after_help = "Row format: send_start_ms,send_finish_ms,response_time_ms,\
bytes_sent,bytes_received,worker_id,connection_id,error_flag")]
pub struct CliArgs {
    /// Host or IP of the echo server to test
    pub host: Option<String>,

    /// Port of the echo server
    pub port: Option<i64>,

    /// Path to TOML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Payload length in bytes (0 = connect and disconnect only)
    #[arg(short, long)]
    pub length: Option<i64>,

    /// Interval between messages in ms: `N` or `MIN-MAX`
    #[arg(short, long, allow_hyphen_values = true)]
    pub interval: Option<String>,

    /// Messages to send on each connection
    #[arg(short = 'r', long = "num")]
    pub messages: Option<i64>,

    /// Print one row per message instead of periodic averages
    #[arg(short, long)]
    pub table: bool,

    /// Concurrent connections per worker
    #[arg(short, long)]
    pub connections: Option<i64>,

    /// Number of worker threads
    #[arg(short, long)]
    pub workers: Option<i64>,

    /// Averaging window in seconds
    #[arg(long)]
    pub report_window: Option<i64>,

    /// Connect timeout in milliseconds
    #[arg(long)]
    pub connect_timeout: Option<i64>,

    /// Terminate every payload with a newline
    #[arg(long)]
    pub newline: bool,

    /// Seed for payload and jitter generation
    #[arg(long)]
    pub seed: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub target: TargetConfig,
    #[serde(default)]
    pub load: LoadConfig,
    #[serde(default)]
    pub report: ReportConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Echo server to test
#[derive(Debug, Deserialize, Default)]
pub struct TargetConfig {
    pub host: Option<String>,
    pub port: Option<i64>,
}

/// Load shape
#[derive(Debug, Deserialize)]
pub struct LoadConfig {
    #[serde(default = "default_length")]
    pub length: i64,
    #[serde(default = "default_interval")]
    pub interval: String,
    #[serde(default = "default_messages")]
    pub messages: i64,
    #[serde(default = "default_connections")]
    pub connections: i64,
    #[serde(default = "default_workers")]
    pub workers: i64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: i64,
    #[serde(default)]
    pub newline: bool,
    pub seed: Option<u64>,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            length: default_length(),
            interval: default_interval(),
            messages: default_messages(),
            connections: default_connections(),
            workers: default_workers(),
            connect_timeout_ms: default_connect_timeout(),
            newline: false,
            seed: None,
        }
    }
}

/// Report output configuration
#[derive(Debug, Deserialize)]
pub struct ReportConfig {
    /// Row mode instead of periodic averages
    #[serde(default)]
    pub table: bool,
    /// Averaging window in seconds
    #[serde(default = "default_window")]
    pub window_secs: i64,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            table: false,
            window_secs: default_window(),
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

fn default_length() -> i64 {
    64
}

fn default_interval() -> String {
    "1000".to_string()
}

fn default_messages() -> i64 {
    100
}

fn default_connections() -> i64 {
    2
}

fn default_workers() -> i64 {
    1
}

fn default_connect_timeout() -> i64 {
    5000
}

fn default_window() -> i64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Payload length, excluding the optional trailing newline.
    pub length: usize,
    pub interval: Interval,
    /// Message quota per connection.
    pub messages: usize,
    /// Connections per worker.
    pub connections: usize,
    pub workers: usize,
    pub table: bool,
    pub report_window: Duration,
    pub connect_timeout: Duration,
    pub newline: bool,
    pub seed: Option<u64>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    /// Resolve parsed CLI arguments, reading the TOML file they point to.
    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
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

    /// Merge CLI args over TOML values and validate the result.
    pub fn merge(cli: CliArgs, file: TomlConfig) -> Result<Self, ConfigError> {
        let host = cli
            .host
            .or(file.target.host)
            .ok_or(ConfigError::Missing("host"))?;
        let port = cli
            .port
            .or(file.target.port)
            .ok_or(ConfigError::Missing("port"))?;
        if port <= 0 || port > i64::from(u16::MAX) {
            return Err(ConfigError::Invalid(format!(
                "port must be between 1 and {}, got {port}",
                u16::MAX
            )));
        }

        let length = cli.length.unwrap_or(file.load.length);
        if length < 0 {
            return Err(ConfigError::Invalid(format!(
                "length must not be negative, got {length}"
            )));
        }

        let interval = cli.interval.unwrap_or(file.load.interval);
        let interval = Interval::parse(&interval).map_err(ConfigError::Interval)?;

        let messages = positive("messages", cli.messages.unwrap_or(file.load.messages))?;
        let connections = positive(
            "connections",
            cli.connections.unwrap_or(file.load.connections),
        )?;
        let workers = positive("workers", cli.workers.unwrap_or(file.load.workers))?;
        let window = positive(
            "report window",
            cli.report_window.unwrap_or(file.report.window_secs),
        )?;
        let connect_timeout = positive(
            "connect timeout",
            cli.connect_timeout.unwrap_or(file.load.connect_timeout_ms),
        )?;

        Ok(Config {
            host,
            port: port as u16,
            length: length as usize,
            interval,
            messages,
            connections,
            workers,
            table: cli.table || file.report.table,
            report_window: Duration::from_secs(window as u64),
            connect_timeout: Duration::from_millis(connect_timeout as u64),
            newline: cli.newline || file.load.newline,
            seed: cli.seed.or(file.load.seed),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                file.logging.level
            },
        })
    }

    /// Resolve the target to the first socket address it maps to.
    pub fn target_addr(&self) -> Result<SocketAddr, ConfigError> {
        let target = format!("{}:{}", self.host, self.port);
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| ConfigError::Resolve(target.clone(), Some(e)))?
            .next()
            .ok_or_else(|| ConfigError::Resolve(target, None))
    }
}

fn positive(name: &'static str, value: i64) -> Result<usize, ConfigError> {
    if value <= 0 {
        return Err(ConfigError::Invalid(format!(
            "{name} must be greater than 0, got {value}"
        )));
    }
    Ok(value as usize)
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Missing(&'static str),
    Invalid(String),
    Interval(IntervalError),
    Resolve(String, Option<std::io::Error>),
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
            ConfigError::Missing(name) => write!(f, "Missing required value: {name}"),
            ConfigError::Invalid(msg) => write!(f, "Invalid value: {msg}"),
            ConfigError::Interval(e) => write!(f, "Invalid interval: {e}"),
            ConfigError::Resolve(target, Some(e)) => {
                write!(f, "Failed to resolve '{target}': {e}")
            }
            ConfigError::Resolve(target, None) => {
                write!(f, "'{target}' resolved to no addresses")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> CliArgs {
        let mut argv = vec!["echo-bench"];
        argv.extend_from_slice(args);
        CliArgs::try_parse_from(argv).unwrap()
    }

    fn merge(args: &[&str]) -> Result<Config, ConfigError> {
        Config::merge(cli(args), TomlConfig::default())
    }

    #[test]
    fn test_defaults() {
        let config = merge(&["localhost", "7"]).unwrap();
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 7);
        assert_eq!(config.length, 64);
        assert_eq!(config.interval, Interval::fixed(1000));
        assert_eq!(config.messages, 100);
        assert_eq!(config.connections, 2);
        assert_eq!(config.workers, 1);
        assert!(!config.table);
        assert_eq!(config.report_window, Duration::from_secs(5));
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_cli_values() {
        let config = merge(&[
            "127.0.0.1", "9000", "-l", "0", "-i", "100-250", "-r", "3", "-t", "-c", "5", "-w",
            "2",
        ])
        .unwrap();
        assert_eq!(config.length, 0);
        assert_eq!(config.interval, Interval::new(100, 250).unwrap());
        assert_eq!(config.messages, 3);
        assert!(config.table);
        assert_eq!(config.connections, 5);
        assert_eq!(config.workers, 2);
    }

    #[test]
    fn test_hyphen_leading_interval() {
        let config = merge(&["localhost", "7", "-i", "-250"]).unwrap();
        assert_eq!(config.interval, Interval::fixed(250));
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(matches!(
            merge(&["localhost", "0"]),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            merge(&["localhost", "-3"]),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            merge(&["localhost", "70000"]),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            merge(&["localhost", "7", "-l", "-1"]),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            merge(&["localhost", "7", "-r", "0"]),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            merge(&["localhost", "7", "-w", "0"]),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            merge(&["localhost", "7", "-c", "-2"]),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            merge(&["localhost", "7", "-i", "250-100"]),
            Err(ConfigError::Interval(_))
        ));
        assert!(matches!(
            merge(&["localhost", "7", "-i", "abc"]),
            Err(ConfigError::Interval(_))
        ));
    }

    #[test]
    fn test_missing_target() {
        assert!(matches!(merge(&[]), Err(ConfigError::Missing("host"))));
        assert!(matches!(
            merge(&["localhost"]),
            Err(ConfigError::Missing("port"))
        ));
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [target]
            host = "10.0.0.1"
            port = 7

            [load]
            length = 128
            interval = "50-75"
            messages = 10
            connections = 4
            workers = 3
            newline = true

            [report]
            table = true
            window_secs = 10

            [logging]
            level = "debug"
        "#;

        let file: TomlConfig = toml::from_str(toml_str).unwrap();
        let config = Config::merge(cli(&[]), file).unwrap();
        assert_eq!(config.host, "10.0.0.1");
        assert_eq!(config.port, 7);
        assert_eq!(config.length, 128);
        assert_eq!(config.interval, Interval::new(50, 75).unwrap());
        assert_eq!(config.messages, 10);
        assert_eq!(config.connections, 4);
        assert_eq!(config.workers, 3);
        assert!(config.newline);
        assert!(config.table);
        assert_eq!(config.report_window, Duration::from_secs(10));
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_cli_overrides_toml() {
        let file: TomlConfig = toml::from_str(
            r#"
            [target]
            host = "10.0.0.1"
            port = 7

            [load]
            messages = 10
        "#,
        )
        .unwrap();
        let config = Config::merge(cli(&["localhost", "8", "-r", "2"]), file).unwrap();
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 8);
        assert_eq!(config.messages, 2);
    }

    #[test]
    fn test_target_addr() {
        let config = merge(&["127.0.0.1", "4000"]).unwrap();
        assert_eq!(
            config.target_addr().unwrap(),
            "127.0.0.1:4000".parse::<SocketAddr>().unwrap()
        );
    }
}
