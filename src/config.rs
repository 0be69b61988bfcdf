//! Configuration module for the nio-echo server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::runtime::ReactorConfig;
use clap::Parser;
use serde::Deserialize;
use std::net::{AddrParseError, IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the echo server
#[derive(Parser, Debug)]
#[command(name = "nio-echo")]
#[command(author = "nio-echo authors")]
#[command(version = "0.1.0")]
#[command(about = "A single-threaded readiness-based echo server", long_about = None)]
pub struct CliArgs {
    /// Port to listen on (overrides --config)
    pub port: Option<u16>,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Host address to bind to (e.g., 127.0.0.1)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Maximum number of concurrent connections
    #[arg(short = 'm', long)]
    pub max_connections: Option<usize>,

    /// Per-connection buffer size in bytes
    #[arg(short = 'b', long)]
    pub buffer_size: Option<usize>,

    /// Poll timeout in milliseconds (omit to wait indefinitely)
    #[arg(long)]
    pub poll_timeout_ms: Option<u64>,

    /// Do not greet new connections
    #[arg(long)]
    pub no_greeting: bool,

    /// Run the pipe worker for this many lines instead of serving
    #[arg(long, value_name = "REPS")]
    pub pipe: Option<usize>,

    /// Copy stdin to stdout through a buffer instead of serving
    #[arg(long, conflicts_with = "pipe")]
    pub copy: bool,

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
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener and event loop configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Maximum events handled per wake
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Poll timeout in milliseconds
    pub poll_timeout_ms: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            backlog: default_backlog(),
            batch_size: default_batch_size(),
            poll_timeout_ms: None,
        }
    }
}

/// Per-connection configuration
#[derive(Debug, Deserialize)]
pub struct ConnectionConfig {
    /// Maximum number of concurrent connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Buffer size per connection in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Greeting sent on accept; empty disables it
    #[serde(default = "default_greeting")]
    pub greeting: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            buffer_size: default_buffer_size(),
            greeting: default_greeting(),
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

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    1234
}

fn default_backlog() -> i32 {
    1024
}

fn default_batch_size() -> usize {
    1024
}

fn default_max_connections() -> usize {
    10_000
}

fn default_buffer_size() -> usize {
    1024
}

fn default_greeting() -> String {
    "Hi there!\r\n".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub backlog: i32,
    pub max_connections: usize,
    pub buffer_size: usize,
    pub batch_size: usize,
    pub poll_timeout: Option<Duration>,
    pub greeting: Option<String>,
    pub pipe_reps: Option<usize>,
    pub copy_stdin: bool,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    /// Resolve parsed CLI args, reading the TOML file they point at.
    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
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

    /// Merge CLI args with TOML config (CLI takes precedence).
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let greeting = if cli.no_greeting || toml_config.connection.greeting.is_empty() {
            None
        } else {
            Some(toml_config.connection.greeting)
        };

        Config {
            host: cli.listen.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            backlog: toml_config.server.backlog,
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.connection.max_connections),
            buffer_size: cli
                .buffer_size
                .unwrap_or(toml_config.connection.buffer_size),
            batch_size: toml_config.server.batch_size,
            poll_timeout: cli
                .poll_timeout_ms
                .or(toml_config.server.poll_timeout_ms)
                .map(Duration::from_millis),
            greeting,
            pipe_reps: cli.pipe,
            copy_stdin: cli.copy,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        }
    }

    /// Build the reactor settings.
    pub fn reactor_config(&self) -> Result<ReactorConfig, ConfigError> {
        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|e| ConfigError::InvalidHost(self.host.clone(), e))?;

        Ok(ReactorConfig {
            addr: SocketAddr::new(ip, self.port),
            backlog: self.backlog,
            max_connections: self.max_connections,
            buffer_size: self.buffer_size,
            batch_size: self.batch_size,
            poll_timeout: self.poll_timeout,
            greeting: self.greeting.as_ref().map(|g| g.as_bytes().to_vec()),
        })
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    InvalidHost(String, AddrParseError),
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
            ConfigError::InvalidHost(host, e) => {
                write!(f, "Invalid listen host '{}': {}", host, e)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> CliArgs {
        CliArgs::parse_from(std::iter::once("nio-echo").chain(args.iter().copied()))
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 1234);
        assert_eq!(config.connection.buffer_size, 1024);
        assert_eq!(config.connection.greeting, "Hi there!\r\n");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "127.0.0.1"
            port = 4321
            poll_timeout_ms = 250

            [connection]
            max_connections = 100
            buffer_size = 4096
            greeting = ""

            [logging]
            level = "debug"
        "#;

        let toml_config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(toml_config.server.port, 4321);
        assert_eq!(toml_config.server.backlog, 1024);

        let config = Config::merge(cli(&[]), toml_config);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 4321);
        assert_eq!(config.max_connections, 100);
        assert_eq!(config.buffer_size, 4096);
        assert_eq!(config.poll_timeout, Some(Duration::from_millis(250)));
        assert_eq!(config.greeting, None);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_cli_takes_precedence() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [server]
            port = 4321
            [connection]
            buffer_size = 4096
            "#,
        )
        .unwrap();

        let config = Config::merge(
            cli(&["5678", "-b", "64", "--no-greeting", "--log-level", "warn"]),
            toml_config,
        );
        assert_eq!(config.port, 5678);
        assert_eq!(config.buffer_size, 64);
        assert_eq!(config.greeting, None);
        assert_eq!(config.log_level, "warn");
        assert_eq!(config.pipe_reps, None);
    }

    #[test]
    fn test_reactor_config() {
        let config = Config::merge(cli(&["--listen", "127.0.0.1", "9000"]), TomlConfig::default());
        let reactor = config.reactor_config().unwrap();
        assert_eq!(reactor.addr, "127.0.0.1:9000".parse::<SocketAddr>().unwrap());
        assert_eq!(reactor.greeting.as_deref(), Some(&b"Hi there!\r\n"[..]));
        assert_eq!(reactor.poll_timeout, None);

        let bad = Config::merge(cli(&["--listen", "not-a-host"]), TomlConfig::default());
        assert!(matches!(
            bad.reactor_config(),
            Err(ConfigError::InvalidHost(_, _))
        ));
    }

    #[test]
    fn test_pipe_mode() {
        let config = Config::merge(cli(&["--pipe", "10"]), TomlConfig::default());
        assert_eq!(config.pipe_reps, Some(10));
        assert!(!config.copy_stdin);

        let config = Config::merge(cli(&["--copy"]), TomlConfig::default());
        assert!(config.copy_stdin);
        assert_eq!(config.pipe_reps, None);

        assert!(CliArgs::try_parse_from(["nio-echo", "--copy", "--pipe", "3"]).is_err());
    }
}
