//! Configuration module for frame-bench.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Args, Parser, Subcommand};
use rand::Rng;
use serde::Deserialize;
use std::path::PathBuf;
use thiserror::Error;

use crate::protocol::MAX_PAYLOAD_LEN;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "frame-bench")]
#[command(author = "frame-bench authors")]
#[command(version = "0.1.0")]
#[command(about = "Length-prefixed framing server and round-trip benchmark", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Append exchange trace lines to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Subcommand, Debug)]
pub enum CliCommand {
    /// Run the frame server
    Serve(ServeArgs),
    /// Run the round-trip benchmark against a server
    Bench(BenchArgs),
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Address to bind to (e.g., 0.0.0.0:1048)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Listen backlog
    #[arg(long)]
    pub backlog: Option<i32>,

    /// Text returned for WHO
    #[arg(long)]
    pub identity: Option<String>,

    #[command(flatten)]
    pub payload: PayloadArgs,
}

#[derive(Args, Debug)]
pub struct BenchArgs {
    /// Server address to connect to (e.g., 127.0.0.1:1048)
    #[arg(short = 'a', long)]
    pub connect: Option<String>,

    /// Number of TEST exchanges
    #[arg(short = 'n', long)]
    pub exchanges: Option<usize>,

    #[command(flatten)]
    pub payload: PayloadArgs,
}

#[derive(Args, Debug, Default)]
pub struct PayloadArgs {
    /// Smallest random payload size in bytes
    #[arg(long)]
    pub min_payload: Option<usize>,

    /// Largest random payload size in bytes
    #[arg(long)]
    pub max_payload: Option<usize>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub payload: PayloadConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    #[serde(default = "default_identity")]
    pub identity: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            backlog: default_backlog(),
            identity: default_identity(),
        }
    }
}

/// Benchmark client configuration
#[derive(Debug, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_connect")]
    pub connect: String,
    #[serde(default = "default_exchanges")]
    pub exchanges: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect: default_connect(),
            exchanges: default_exchanges(),
        }
    }
}

/// Random payload size bounds, shared by server pushes and client requests
#[derive(Debug, Deserialize)]
pub struct PayloadConfig {
    #[serde(default = "default_min_payload")]
    pub min: usize,
    #[serde(default = "default_max_payload")]
    pub max: usize,
}

impl Default for PayloadConfig {
    fn default() -> Self {
        Self {
            min: default_min_payload(),
            max: default_max_payload(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Optional append-only trace file
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:1048".to_string()
}

fn default_connect() -> String {
    "127.0.0.1:1048".to_string()
}

fn default_backlog() -> i32 {
    5
}

fn default_identity() -> String {
    "frame-bench server: network performance testing".to_string()
}

fn default_exchanges() -> usize {
    5
}

fn default_min_payload() -> usize {
    10
}

fn default_max_payload() -> usize {
    50_000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Inclusive payload size range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadRange {
    pub min: usize,
    pub max: usize,
}

impl PayloadRange {
    pub fn new(min: usize, max: usize) -> Result<Self, ConfigError> {
        if min > max {
            return Err(ConfigError::Invalid(format!(
                "payload min {min} is greater than max {max}"
            )));
        }
        if max > MAX_PAYLOAD_LEN {
            return Err(ConfigError::Invalid(format!(
                "payload max {max} exceeds frame limit {MAX_PAYLOAD_LEN}"
            )));
        }
        Ok(Self { min, max })
    }

    /// Draw a size uniformly from the range.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> usize {
        rng.gen_range(self.min..=self.max)
    }
}

impl Default for PayloadRange {
    fn default() -> Self {
        Self {
            min: default_min_payload(),
            max: default_max_payload(),
        }
    }
}

/// Which side of the protocol to run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Serve,
    Bench,
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub listen: String,
    pub backlog: i32,
    pub identity: String,
    pub connect: String,
    pub exchanges: usize,
    pub payload: PayloadRange,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::Serve,
            listen: default_listen(),
            backlog: default_backlog(),
            identity: default_identity(),
            connect: default_connect(),
            exchanges: default_exchanges(),
            payload: PayloadRange::default(),
            log_level: default_log_level(),
            log_file: None,
        }
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

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
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let mut config = Config {
            mode: Mode::Serve,
            listen: toml_config.server.listen,
            backlog: toml_config.server.backlog,
            identity: toml_config.server.identity,
            connect: toml_config.client.connect,
            exchanges: toml_config.client.exchanges,
            payload: PayloadRange::default(),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
            log_file: cli.log_file.or(toml_config.logging.file),
        };

        let payload_args = match cli.command {
            CliCommand::Serve(args) => {
                config.mode = Mode::Serve;
                config.listen = args.listen.unwrap_or(config.listen);
                config.backlog = args.backlog.unwrap_or(config.backlog);
                config.identity = args.identity.unwrap_or(config.identity);
                args.payload
            }
            CliCommand::Bench(args) => {
                config.mode = Mode::Bench;
                config.connect = args.connect.unwrap_or(config.connect);
                config.exchanges = args.exchanges.unwrap_or(config.exchanges);
                args.payload
            }
        };

        config.payload = PayloadRange::new(
            payload_args.min_payload.unwrap_or(toml_config.payload.min),
            payload_args.max_payload.unwrap_or(toml_config.payload.max),
        )?;

        if config.backlog <= 0 {
            return Err(ConfigError::Invalid(format!(
                "backlog must be positive, got {}",
                config.backlog
            )));
        }
        if config.exchanges == 0 {
            return Err(ConfigError::Invalid(
                "exchanges must be at least 1".to_string(),
            ));
        }

        Ok(config)
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {1}", .0.display())]
    FileRead(PathBuf, std::io::Error),

    #[error("Failed to parse config file '{}': {1}", .0.display())]
    TomlParse(PathBuf, toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn cli(args: &[&str]) -> CliArgs {
        CliArgs::try_parse_from(std::iter::once("frame-bench").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.listen, "0.0.0.0:1048");
        assert_eq!(config.server.backlog, 5);
        assert_eq!(config.client.connect, "127.0.0.1:1048");
        assert_eq!(config.client.exchanges, 5);
        assert_eq!(config.payload.min, 10);
        assert_eq!(config.payload.max, 50_000);
        assert!(config.logging.file.is_none());
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "127.0.0.1:9000"
            backlog = 64
            identity = "test server"

            [client]
            connect = "10.0.0.1:9000"
            exchanges = 20

            [payload]
            min = 100
            max = 200

            [logging]
            level = "debug"
            file = "server_log.txt"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:9000");
        assert_eq!(config.server.backlog, 64);
        assert_eq!(config.server.identity, "test server");
        assert_eq!(config.client.connect, "10.0.0.1:9000");
        assert_eq!(config.client.exchanges, 20);
        assert_eq!(config.payload.min, 100);
        assert_eq!(config.payload.max, 200);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.file, Some(PathBuf::from("server_log.txt")));
    }

    #[test]
    fn test_cli_overrides_toml() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [client]
            connect = "10.0.0.1:9000"
            exchanges = 20

            [logging]
            level = "debug"
            "#,
        )
        .unwrap();

        let config = Config::merge(
            cli(&["--log-level", "warn", "bench", "-n", "3", "--max-payload", "500"]),
            toml_config,
        )
        .unwrap();

        assert_eq!(config.mode, Mode::Bench);
        assert_eq!(config.connect, "10.0.0.1:9000");
        assert_eq!(config.exchanges, 3);
        assert_eq!(config.payload, PayloadRange { min: 10, max: 500 });
        assert_eq!(config.log_level, "warn");
    }

    #[test]
    fn test_serve_args() {
        let config = Config::merge(
            cli(&["serve", "-l", "127.0.0.1:0", "--backlog", "16"]),
            TomlConfig::default(),
        )
        .unwrap();

        assert_eq!(config.mode, Mode::Serve);
        assert_eq!(config.listen, "127.0.0.1:0");
        assert_eq!(config.backlog, 16);
        assert_eq!(config.payload, PayloadRange::default());
    }

    #[test]
    fn test_invalid_payload_range() {
        let err = Config::merge(
            cli(&["serve", "--min-payload", "600", "--max-payload", "500"]),
            TomlConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        assert!(PayloadRange::new(10, MAX_PAYLOAD_LEN + 1).is_err());
        assert!(PayloadRange::new(0, MAX_PAYLOAD_LEN).is_ok());
    }

    #[test]
    fn test_zero_exchanges_rejected() {
        let err = Config::merge(cli(&["bench", "-n", "0"]), TomlConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_payload_sample_in_range() {
        let range = PayloadRange::default();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..1000 {
            let size = range.sample(&mut rng);
            assert!((10..=50_000).contains(&size));
        }

        let fixed = PayloadRange::new(42, 42).unwrap();
        assert_eq!(fixed.sample(&mut rng), 42);
    }
}
