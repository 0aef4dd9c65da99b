//! Configuration module for linkbeat.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::error::ConfigError;
use crate::protocol::MAX_BODY_LEN;
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Which end of the protocol the process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Listen, answer logins and heartbeats, echo DATA.
    #[default]
    Server,
    /// Connect, log in, then send heartbeats until the link drops.
    Client,
}

/// What a server does with DATA frames once a peer is logged in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppKind {
    /// Send every payload back.
    #[default]
    Echo,
    /// Answer `QUERY TIME ORDER` with the current time.
    Time,
}

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "linkbeat")]
#[command(author = "linkbeat authors")]
#[command(version = "0.1.0")]
#[command(about = "Login and heartbeat session runtime over a mio reactor", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Run as server or client
    #[arg(long, value_enum)]
    pub mode: Option<Mode>,

    /// Address to bind to in server mode (e.g., 127.0.0.1:8080)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Server-side handler for DATA frames
    #[arg(long, value_enum)]
    pub application: Option<AppKind>,

    /// Address to connect to in client mode
    #[arg(long)]
    pub connect: Option<String>,

    /// Heartbeat period in milliseconds
    #[arg(long)]
    pub heartbeat_interval_ms: Option<u64>,

    /// Largest accepted frame body in bytes
    #[arg(long)]
    pub max_frame_body: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    pub mode: Option<Mode>,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub reactor: ReactorConfig,
    #[serde(default)]
    pub login: LoginConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default)]
    pub application: AppKind,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_connections: default_max_connections(),
            application: AppKind::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_listen")]
    pub connect: String,
    /// Sent as the `LOGIN_REQ` body.
    #[serde(default)]
    pub credentials: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect: default_listen(),
            credentials: String::new(),
        }
    }
}

/// Per-session protocol settings
#[derive(Debug, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_max_frame_body")]
    pub max_frame_body: usize,
    /// Size of the chunk each socket read fills
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            max_frame_body: default_max_frame_body(),
            read_buffer_size: default_read_buffer_size(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ReactorConfig {
    /// Upper bound on a single poll wait
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    /// Readiness events fetched per poll
    #[serde(default = "default_events_capacity")]
    pub events_capacity: usize,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: default_poll_timeout_ms(),
            events_capacity: default_events_capacity(),
        }
    }
}

/// Login acceptance. An empty allow list accepts every peer.
#[derive(Debug, Deserialize, Default)]
pub struct LoginConfig {
    #[serde(default)]
    pub allowed_peers: Vec<IpAddr>,
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
    "127.0.0.1:8080".to_string()
}

fn default_max_connections() -> usize {
    10_000
}

fn default_heartbeat_interval_ms() -> u64 {
    5000
}

fn default_max_frame_body() -> usize {
    1024 * 1024 // 1 MB
}

fn default_read_buffer_size() -> usize {
    16 * 1024
}

fn default_poll_timeout_ms() -> u64 {
    1000
}

fn default_events_capacity() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub listen: String,
    pub application: AppKind,
    pub connect: String,
    pub credentials: String,
    pub max_connections: usize,
    pub heartbeat_interval_ms: u64,
    pub max_frame_body: usize,
    pub read_buffer_size: usize,
    pub poll_timeout_ms: u64,
    pub events_capacity: usize,
    pub allowed_peers: Vec<IpAddr>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(None, TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
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

        let config = Self::merge(Some(cli), toml_config);
        config.validate()?;
        Ok(config)
    }

    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "heartbeat_interval_ms",
                reason: "must be at least 1",
            });
        }
        if self.max_frame_body > MAX_BODY_LEN {
            return Err(ConfigError::InvalidValue {
                field: "max_frame_body",
                reason: "must fit a signed 32-bit length",
            });
        }
        Ok(())
    }

    fn merge(cli: Option<CliArgs>, toml_config: TomlConfig) -> Self {
        let TomlConfig {
            mode,
            server,
            client,
            session,
            reactor,
            login,
            logging,
        } = toml_config;

        let mut config = Config {
            mode: mode.unwrap_or_default(),
            listen: server.listen,
            application: server.application,
            connect: client.connect,
            credentials: client.credentials,
            max_connections: server.max_connections,
            heartbeat_interval_ms: session.heartbeat_interval_ms,
            max_frame_body: session.max_frame_body,
            read_buffer_size: session.read_buffer_size,
            poll_timeout_ms: reactor.poll_timeout_ms,
            events_capacity: reactor.events_capacity,
            allowed_peers: login.allowed_peers,
            log_level: logging.level,
        };

        let Some(cli) = cli else {
            return config;
        };

        if let Some(mode) = cli.mode {
            config.mode = mode;
        }
        if let Some(listen) = cli.listen {
            config.listen = listen;
        }
        if let Some(application) = cli.application {
            config.application = application;
        }
        if let Some(connect) = cli.connect {
            config.connect = connect;
        }
        if let Some(ms) = cli.heartbeat_interval_ms {
            config.heartbeat_interval_ms = ms;
        }
        if let Some(max) = cli.max_frame_body {
            config.max_frame_body = max;
        }
        if cli.log_level != "info" {
            config.log_level = cli.log_level;
        }
        config
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        parse_addr(&self.listen)
    }

    pub fn connect_addr(&self) -> Result<SocketAddr, ConfigError> {
        parse_addr(&self.connect)
    }
}

fn parse_addr(addr: &str) -> Result<SocketAddr, ConfigError> {
    addr.parse()
        .map_err(|_| ConfigError::InvalidAddress(addr.to_string()))
}
