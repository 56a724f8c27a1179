//! Configuration for the reactor-engine server binary.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values. The resolved
//! `Config` turns into engine options with `Config::options`.

use crate::options::{self, Opt};
use clap::Parser;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for the server
#[derive(Parser, Debug, Default)]
#[command(name = "reactor-engine")]
#[command(version)]
#[command(about = "Reactor-based TCP engine (echo server demo)", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Raw-stream listen address (e.g., 127.0.0.1:7000)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Framed-message listen address; disabled when not set
    #[arg(long)]
    pub framed_listen: Option<String>,

    /// Connection table capacity (defaults to the open-file limit)
    #[arg(short = 'n', long)]
    pub max_open_files: Option<usize>,

    /// Number of sub-reactor threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Close connections idle for this many seconds (0 = never)
    #[arg(short = 't', long)]
    pub idle_timeout: Option<u64>,

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
    pub engine: EngineConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener and thread configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    pub framed_listen: Option<String>,
    pub workers: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            framed_listen: None,
            workers: None,
        }
    }
}

/// Engine tuning
#[derive(Debug, Deserialize, Default)]
pub struct EngineConfig {
    pub max_open_files: Option<usize>,
    /// Idle timeout in seconds (0 = never)
    #[serde(default)]
    pub idle_timeout: u64,
    pub read_buffer_size: Option<usize>,
    /// Timing wheel tick in milliseconds
    pub timing_wheel_tick_ms: Option<u64>,
    pub timing_wheel_size: Option<usize>,
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
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
    "127.0.0.1:7000".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub listen: String,
    pub framed_listen: Option<String>,
    pub max_open_files: Option<usize>,
    pub workers: Option<usize>,
    pub idle_timeout: u64,
    pub read_buffer_size: Option<usize>,
    pub timing_wheel_tick_ms: Option<u64>,
    pub timing_wheel_size: Option<usize>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|source| ConfigError::FileRead {
                    path: config_path.clone(),
                    source,
                })?;
            toml::from_str(&contents)
                .map_err(|source| ConfigError::TomlParse {
                    path: config_path.clone(),
                    source,
                })?
        } else {
            TomlConfig::default()
        };

        Ok(Self::merge(cli, toml_config))
    }

    /// Merge CLI args over TOML values.
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let engine = toml_config.engine;
        Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            framed_listen: cli.framed_listen.or(toml_config.server.framed_listen),
            max_open_files: cli.max_open_files.or(engine.max_open_files),
            workers: cli.workers.or(toml_config.server.workers),
            idle_timeout: cli.idle_timeout.unwrap_or(engine.idle_timeout),
            read_buffer_size: engine.read_buffer_size,
            timing_wheel_tick_ms: engine.timing_wheel_tick_ms,
            timing_wheel_size: engine.timing_wheel_size,
            log_level: if cli.log_level != "info" && !cli.log_level.is_empty() {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        }
    }

    /// Engine options for this configuration. Unset values keep the
    /// engine defaults.
    pub fn options(&self) -> Result<Vec<Opt>, ConfigError> {
        let mut opts = vec![options::with_addr(parse_addr(&self.listen)?)];

        if let Some(ref framed) = self.framed_listen {
            opts.push(options::with_framed_addr(parse_addr(framed)?));
        }
        if let Some(max_open_files) = self.max_open_files {
            opts.push(options::with_max_open_files(max_open_files));
        }
        if let Some(workers) = self.workers {
            opts.push(options::with_sub_reactors(workers));
        }
        if self.idle_timeout > 0 {
            opts.push(options::with_idle_timeout(Duration::from_secs(
                self.idle_timeout,
            )));
        }
        if let Some(size) = self.read_buffer_size {
            opts.push(options::with_read_buffer_size(size));
        }
        if self.timing_wheel_tick_ms.is_some() || self.timing_wheel_size.is_some() {
            let defaults = options::EngineOptions::default();
            let tick = self
                .timing_wheel_tick_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.timing_wheel_tick);
            let size = self.timing_wheel_size.unwrap_or(defaults.timing_wheel_size);
            opts.push(options::with_timing_wheel(tick, size));
        }

        Ok(opts)
    }
}

fn parse_addr(addr: &str) -> Result<SocketAddr, ConfigError> {
    addr.parse()
        .map_err(|_| ConfigError::InvalidAddr(addr.to_string()))
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", .path.display())]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file '{}': {source}", .path.display())]
    TomlParse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid socket address '{0}'")]
    InvalidAddr(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::EngineOptions;

    fn cli() -> CliArgs {
        CliArgs {
            log_level: "info".to_string(),
            ..CliArgs::default()
        }
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.listen, "127.0.0.1:7000");
        assert!(config.server.framed_listen.is_none());
        assert_eq!(config.engine.idle_timeout, 0);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "0.0.0.0:7000"
            framed_listen = "0.0.0.0:7001"
            workers = 4

            [engine]
            max_open_files = 4096
            idle_timeout = 30
            timing_wheel_tick_ms = 100

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:7000");
        assert_eq!(config.server.framed_listen.as_deref(), Some("0.0.0.0:7001"));
        assert_eq!(config.server.workers, Some(4));
        assert_eq!(config.engine.max_open_files, Some(4096));
        assert_eq!(config.engine.idle_timeout, 30);
        assert_eq!(config.engine.timing_wheel_tick_ms, Some(100));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_file() {
        let file: TomlConfig = toml::from_str(
            r#"
            [server]
            listen = "0.0.0.0:7000"
            workers = 4
            [engine]
            max_open_files = 4096
            "#,
        )
        .unwrap();

        let args = CliArgs {
            listen: Some("127.0.0.1:9000".to_string()),
            max_open_files: Some(128),
            log_level: "warn".to_string(),
            ..cli()
        };

        let config = Config::merge(args, file);
        assert_eq!(config.listen, "127.0.0.1:9000");
        assert_eq!(config.max_open_files, Some(128));
        assert_eq!(config.workers, Some(4));
        assert_eq!(config.log_level, "warn");
    }

    #[test]
    fn test_options_from_config() {
        let file: TomlConfig = toml::from_str(
            r#"
            [server]
            listen = "127.0.0.1:7100"
            framed_listen = "127.0.0.1:7101"
            workers = 3
            [engine]
            max_open_files = 512
            idle_timeout = 10
            timing_wheel_size = 256
            "#,
        )
        .unwrap();

        let config = Config::merge(cli(), file);
        let options = EngineOptions::build(config.options().unwrap()).unwrap();
        assert_eq!(options.addr, "127.0.0.1:7100".parse::<SocketAddr>().unwrap());
        assert_eq!(options.framed_addr, Some("127.0.0.1:7101".parse::<SocketAddr>().unwrap()));
        assert_eq!(options.sub_reactors, 3);
        assert_eq!(options.max_open_files, 512);
        assert_eq!(options.idle_timeout, Some(Duration::from_secs(10)));
        assert_eq!(options.timing_wheel_size, 256);
        assert_eq!(options.timing_wheel_tick, Duration::from_millis(500));
    }

    #[test]
    fn test_invalid_address_rejected() {
        let args = CliArgs {
            listen: Some("not-an-address".to_string()),
            ..cli()
        };
        let config = Config::merge(args, TomlConfig::default());
        assert!(matches!(
            config.options(),
            Err(ConfigError::InvalidAddr(addr)) if addr == "not-an-address"
        ));
    }
}
