//! Socket error taxonomy.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Errors surfaced by connections and the session manager
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SocketError {
    /// Operation not valid for this identifier or in the current state
    #[error("invalid invocation: {0}")]
    InvalidInvocation(String),

    /// Missing or invalid configuration (host, bind address, TLS material)
    #[error("bad config: {0}")]
    BadConfig(String),

    /// Invalid parameter value
    #[error("bad param: {0}")]
    BadParam(String),

    /// A write did not complete before its deadline
    #[error("send timed out (msg {msg_id})")]
    SendTimeout {
        /// Tag of the write that timed out
        msg_id: u64,
    },

    /// A write failed on the transport
    #[error("send failed (msg {msg_id}): {reason}")]
    SendFailed {
        /// Tag of the failed write
        msg_id: u64,
        /// Transport error text
        reason: String,
    },

    /// The socket is closed
    #[error("socket closed")]
    Closed,

    /// Anything else, described by the message
    #[error("{0}")]
    Other(String),
}

/// Error class as seen across the host boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    /// See [`SocketError::InvalidInvocation`]
    InvalidInvocation,
    /// See [`SocketError::BadConfig`]
    BadConfig,
    /// See [`SocketError::BadParam`]
    BadParam,
    /// See [`SocketError::SendTimeout`]
    SendTimeout,
    /// See [`SocketError::SendFailed`]
    SendFailed,
    /// See [`SocketError::Closed`]
    Closed,
    /// See [`SocketError::Other`]
    Other,
}

impl ErrorKind {
    /// Stable name used in bridge records
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidInvocation => "InvalidInvocation",
            ErrorKind::BadConfig => "BadConfig",
            ErrorKind::BadParam => "BadParam",
            ErrorKind::SendTimeout => "SendTimeout",
            ErrorKind::SendFailed => "SendFailed",
            ErrorKind::Closed => "Closed",
            ErrorKind::Other => "Other",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl SocketError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            SocketError::InvalidInvocation(_) => ErrorKind::InvalidInvocation,
            SocketError::BadConfig(_) => ErrorKind::BadConfig,
            SocketError::BadParam(_) => ErrorKind::BadParam,
            SocketError::SendTimeout { .. } => ErrorKind::SendTimeout,
            SocketError::SendFailed { .. } => ErrorKind::SendFailed,
            SocketError::Closed => ErrorKind::Closed,
            SocketError::Other(_) => ErrorKind::Other,
        }
    }

    /// Message tag this error refers to, for write failures
    pub fn msg_id(&self) -> Option<u64> {
        match self {
            SocketError::SendTimeout { msg_id } | SocketError::SendFailed { msg_id, .. } => {
                Some(*msg_id)
            }
            _ => None,
        }
    }

    pub(crate) fn unknown_id(id: crate::SocketId) -> Self {
        SocketError::InvalidInvocation(format!("no socket with id {}", id))
    }
}

impl From<std::io::Error> for SocketError {
    fn from(e: std::io::Error) -> Self {
        SocketError::Other(e.to_string())
    }
}

/// Result alias for socket operations
pub type Result<T> = std::result::Result<T, SocketError>;
