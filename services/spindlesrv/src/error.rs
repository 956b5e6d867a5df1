//! Service-wide error type

use thiserror::Error;

use crate::codec::FrameError;
use crate::transport::TransportError;

/// Errors raised by the spindle control stack
#[derive(Error, Debug)]
pub enum VfdError {
    /// Serial link failure (open, write, short read, timeout)
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Reply frame failed length, CRC or address validation
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    /// Well-formed reply that does not answer the request
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    /// Drive acknowledged a different frequency than the one written
    #[error("Frequency echo mismatch: sent {sent}, drive echoed {received}")]
    EchoMismatch { sent: u16, received: u16 },

    /// Invalid or incomplete configuration
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl VfdError {
    pub fn unexpected(msg: impl Into<String>) -> Self {
        Self::UnexpectedResponse(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether the error is a per-exchange failure that the next poll retries
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Frame(_) | Self::UnexpectedResponse(_) | Self::EchoMismatch { .. }
        )
    }
}

impl From<figment::Error> for VfdError {
    fn from(err: figment::Error) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<serde_yaml::Error> for VfdError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Config(format!("YAML error: {err}"))
    }
}

/// Result alias for the spindle control stack
pub type Result<T> = std::result::Result<T, VfdError>;
