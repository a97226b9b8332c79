//! Configuration module for the nl-echo responder.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::responder::{DEFAULT_PROTOCOL_ID, REPLY_MESSAGE};
use crate::transport::DEFAULT_MAX_MESSAGE_SIZE;
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;

/// Transport the responder binds its endpoint on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Linux netlink socket
    Netlink,
    /// In-memory transport fed from stdin
    Loopback,
}

/// Command-line arguments for the responder
#[derive(Parser, Debug)]
#[command(name = "nl-echo")]
#[command(author = "nl-echo authors")]
#[command(version = "0.1.0")]
#[command(about = "Replies to every netlink message with a fixed greeting", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Transport to bind the endpoint on
    #[arg(short, long, value_enum)]
    pub transport: Option<TransportKind>,

    /// Netlink protocol id (must match the peers)
    #[arg(short, long)]
    pub protocol_id: Option<u32>,

    /// Port id to bind to (0 = assigned by the kernel)
    #[arg(long)]
    pub port_id: Option<u32>,

    /// Reply sent for every message
    #[arg(long)]
    pub reply: Option<String>,

    /// Sender id of stdin messages in loopback mode
    #[arg(long)]
    pub peer: Option<u32>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub endpoint: EndpointConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub loopback: LoopbackConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Endpoint-related configuration
#[derive(Debug, Deserialize)]
pub struct EndpointConfig {
    /// Protocol id of the channel
    #[serde(default = "default_protocol_id")]
    pub protocol_id: u32,
    /// Port id to bind to
    #[serde(default)]
    pub port_id: u32,
    /// Reply sent for every message
    #[serde(default = "default_reply")]
    pub reply: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            protocol_id: default_protocol_id(),
            port_id: 0,
            reply: default_reply(),
        }
    }
}

/// Transport-related configuration
#[derive(Debug, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_transport_kind")]
    pub kind: TransportKind,
    /// Size of the datagram receive buffer
    #[serde(default = "default_recv_buffer_size")]
    pub recv_buffer_size: usize,
    /// Largest outbound payload
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: default_transport_kind(),
            recv_buffer_size: default_recv_buffer_size(),
            max_message_size: default_max_message_size(),
        }
    }
}

/// Loopback mode configuration
#[derive(Debug, Deserialize)]
pub struct LoopbackConfig {
    /// Sender id of stdin messages
    #[serde(default = "default_peer")]
    pub peer: u32,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            peer: default_peer(),
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

fn default_protocol_id() -> u32 {
    DEFAULT_PROTOCOL_ID
}

fn default_reply() -> String {
    REPLY_MESSAGE.to_string()
}

fn default_transport_kind() -> TransportKind {
    TransportKind::Netlink
}

fn default_recv_buffer_size() -> usize {
    8192
}

fn default_max_message_size() -> usize {
    DEFAULT_MAX_MESSAGE_SIZE
}

fn default_peer() -> u32 {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub transport: TransportKind,
    pub protocol_id: u32,
    pub port_id: u32,
    pub reply: String,
    pub recv_buffer_size: usize,
    pub max_message_size: usize,
    pub peer: u32,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
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
            transport: cli.transport.unwrap_or(toml_config.transport.kind),
            protocol_id: cli.protocol_id.unwrap_or(toml_config.endpoint.protocol_id),
            port_id: cli.port_id.unwrap_or(toml_config.endpoint.port_id),
            reply: cli.reply.unwrap_or(toml_config.endpoint.reply),
            recv_buffer_size: toml_config.transport.recv_buffer_size,
            max_message_size: toml_config.transport.max_message_size,
            peer: cli.peer.unwrap_or(toml_config.loopback.peer),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        }
    }
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
