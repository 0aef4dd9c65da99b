//! Error taxonomy for the codec, sessions and configuration.
//!
//! Every failure here is confined to one session. Nothing is retried: the
//! caller decides whether to open a new connection after seeing a close.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Malformed or oversized frame on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramingError {
    #[error("negative body length {0}")]
    NegativeLength(i32),
    #[error("body length {len} exceeds maximum {max}")]
    BodyTooLarge { len: usize, max: usize },
    #[error("unknown message type {0:#04x}")]
    UnknownType(u8),
    #[error("login response body must be 1 byte, got {0}")]
    BadLoginResponse(usize),
    #[error("peer closed with {0} bytes of a partial frame buffered")]
    TruncatedFrame(usize),
}

/// Failure that terminates a single session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),
    #[error("login rejected with status {status}")]
    AuthRejected { status: u8 },
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("heartbeat timer failed: {0}")]
    Timer(String),
    #[error("protocol violation: {0}")]
    Protocol(String),
}

/// Why a session reached `Closed`.
#[derive(Debug)]
pub enum CloseReason {
    /// Orderly EOF from the peer.
    PeerClosed,
    /// The reactor was stopped.
    Shutdown,
    /// Server side: a rejecting `LOGIN_RESP` was flushed.
    LoginRejected,
    Failed(SessionError),
}

impl CloseReason {
    /// True for closes that stem from a fault rather than an orderly end.
    pub fn is_failure(&self) -> bool {
        matches!(self, CloseReason::Failed(_))
    }
}

impl From<SessionError> for CloseReason {
    fn from(e: SessionError) -> Self {
        CloseReason::Failed(e)
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::PeerClosed => write!(f, "peer closed"),
            CloseReason::Shutdown => write!(f, "shutdown"),
            CloseReason::LoginRejected => write!(f, "login rejected"),
            CloseReason::Failed(e) => write!(f, "{e}"),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("Invalid socket address '{0}'")]
    InvalidAddress(String),
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: &'static str,
    },
}
