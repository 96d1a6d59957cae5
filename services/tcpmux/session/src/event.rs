//! Events delivered to the host and the sinks that receive them.

use crate::error::SocketError;
use crate::SocketId;
use bytes::Bytes;
use serde::Serialize;
use std::net::SocketAddr;
use tokio::sync::mpsc;

/// Address family of a socket address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AddressFamily {
    /// IPv4
    #[serde(rename = "IPv4")]
    IPv4,
    /// IPv6
    #[serde(rename = "IPv6")]
    IPv6,
}

impl AddressFamily {
    /// Family of `addr`
    pub fn of(addr: &SocketAddr) -> Self {
        if addr.is_ipv4() {
            AddressFamily::IPv4
        } else {
            AddressFamily::IPv6
        }
    }
}

/// A bound or peer address
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddressInfo {
    /// Textual IP address
    pub address: String,
    /// Port number
    pub port: u16,
    /// Address family
    pub family: AddressFamily,
}

impl From<SocketAddr> for AddressInfo {
    fn from(addr: SocketAddr) -> Self {
        Self {
            address: addr.ip().to_string(),
            port: addr.port(),
            family: AddressFamily::of(&addr),
        }
    }
}

/// Both ends of an established connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    /// Local address
    pub local_address: String,
    /// Local port
    pub local_port: u16,
    /// Remote address
    pub remote_address: String,
    /// Remote port
    pub remote_port: u16,
    /// Remote address family
    pub remote_family: AddressFamily,
}

impl ConnectionInfo {
    /// Build from the two socket addresses
    pub fn new(local: SocketAddr, remote: SocketAddr) -> Self {
        Self {
            local_address: local.ip().to_string(),
            local_port: local.port(),
            remote_address: remote.ip().to_string(),
            remote_port: remote.port(),
            remote_family: AddressFamily::of(&remote),
        }
    }
}

/// Notifications emitted by the session manager
#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    /// Outbound connection established (after the TLS handshake, if any)
    Connect {
        /// Client socket id
        id: SocketId,
        /// Connection endpoints
        connection: ConnectionInfo,
    },
    /// Server bound and accepting
    Listening {
        /// Server socket id
        id: SocketId,
        /// Bound address
        address: AddressInfo,
    },
    /// Plain inbound connection accepted
    Connection {
        /// Server socket id
        id: SocketId,
        /// Id assigned to the accepted socket
        child_id: SocketId,
        /// Connection endpoints
        connection: ConnectionInfo,
    },
    /// TLS inbound connection accepted and handshaken
    SecureConnection {
        /// Server socket id
        id: SocketId,
        /// Id assigned to the accepted socket
        child_id: SocketId,
        /// Connection endpoints
        connection: ConnectionInfo,
    },
    /// In-place TLS upgrade finished
    SecureConnect {
        /// Upgraded socket id
        id: SocketId,
    },
    /// Bytes received
    Data {
        /// Socket id
        id: SocketId,
        /// Received chunk
        data: Bytes,
    },
    /// A tagged write completed
    Written {
        /// Socket id
        id: SocketId,
        /// Tag passed to `send`
        msg_id: u64,
    },
    /// Asynchronous failure
    Error {
        /// Socket id
        id: SocketId,
        /// What went wrong
        error: SocketError,
    },
    /// Socket closed; final event for the id
    Close {
        /// Socket id
        id: SocketId,
        /// Set when the close followed an error
        error: Option<SocketError>,
    },
}

impl SocketEvent {
    /// The id the event is addressed to
    pub fn id(&self) -> SocketId {
        match self {
            SocketEvent::Connect { id, .. }
            | SocketEvent::Listening { id, .. }
            | SocketEvent::Connection { id, .. }
            | SocketEvent::SecureConnection { id, .. }
            | SocketEvent::SecureConnect { id }
            | SocketEvent::Data { id, .. }
            | SocketEvent::Written { id, .. }
            | SocketEvent::Error { id, .. }
            | SocketEvent::Close { id, .. } => *id,
        }
    }

    /// Event name as used by hosts
    pub fn name(&self) -> &'static str {
        match self {
            SocketEvent::Connect { .. } => "connect",
            SocketEvent::Listening { .. } => "listening",
            SocketEvent::Connection { .. } => "connection",
            SocketEvent::SecureConnection { .. } => "secureConnection",
            SocketEvent::SecureConnect { .. } => "secureConnect",
            SocketEvent::Data { .. } => "data",
            SocketEvent::Written { .. } => "written",
            SocketEvent::Error { .. } => "error",
            SocketEvent::Close { .. } => "close",
        }
    }
}

/// Receiver of socket events
///
/// `emit` is called from the manager's event task, one event at a time and
/// in per-id order. It must not block.
pub trait EventSink: Send + Sync {
    /// Deliver one event
    fn emit(&self, event: SocketEvent);
}

impl<F> EventSink for F
where
    F: Fn(SocketEvent) + Send + Sync,
{
    fn emit(&self, event: SocketEvent) {
        self(event)
    }
}

/// Sink that forwards events into an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<SocketEvent>,
}

impl ChannelSink {
    /// Wrap an existing sender
    pub fn new(tx: mpsc::UnboundedSender<SocketEvent>) -> Self {
        Self { tx }
    }

    /// Create a sink together with the receiving end
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SocketEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: SocketEvent) {
        // Receiver gone means nobody is listening anymore
        let _ = self.tx.send(event);
    }
}
