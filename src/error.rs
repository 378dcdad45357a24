//! Error taxonomy for the driver.
//!
//! Transport and protocol failures are fatal to the connection that raised
//! them; store-reported errors are plain replies promoted to typed errors so
//! callers and the cluster redirection logic can match on the leading kind
//! token (`MOVED`, `ASK`, `TRYAGAIN`, ...).

use thiserror::Error;

use crate::resp::RespError;

/// An error reply sent by the store, split into its leading kind token and
/// the remaining message text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    pub kind: String,
    pub message: String,
}

impl ServerError {
    /// Splits a raw error line (e.g. `"MOVED 3999 127.0.0.1:6381"`) into
    /// kind and message. An error with no space has an empty message.
    pub fn from_line(line: &str) -> Self {
        match line.split_once(' ') {
            Some((kind, rest)) => ServerError {
                kind: kind.to_string(),
                message: rest.to_string(),
            },
            None => ServerError {
                kind: line.to_string(),
                message: String::new(),
            },
        }
    }
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{} {}", self.kind, self.message)
        }
    }
}

/// Errors surfaced by every driver operation.
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("protocol error: {0}")]
    Protocol(#[from] RespError),
    #[error("reply with no matching request")]
    StrayReply,
    #[error("server error: {0}")]
    Server(ServerError),
    #[error("connection pool at capacity")]
    PoolFull,
    #[error("keys map to different hash slots")]
    CrossSlot,
    #[error("no slot owner for slot {0}")]
    UnroutableSlot(u16),
    #[error("discovery failed: {0}")]
    DiscoveryFailed(String),
    #[error("operation timed out")]
    Timeout,
    #[error("unexpected response type")]
    UnexpectedResponse,
}

impl DriverError {
    /// The store error kind token, when this is a store-reported error.
    pub fn server_kind(&self) -> Option<&str> {
        match self {
            DriverError::Server(err) => Some(err.kind.as_str()),
            _ => None,
        }
    }

    /// True for failures that invalidate the connection they occurred on.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            DriverError::Io(_)
                | DriverError::ConnectionClosed
                | DriverError::Protocol(_)
                | DriverError::StrayReply
        )
    }
}
