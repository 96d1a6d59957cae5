//! Multiplexed TCP/TLS sockets behind integer identifiers.
//!
//! This crate manages many independent client connections and listening
//! sockets, each addressed by an integer id, and reports their lifecycle and
//! data through a single [`EventSink`].
//!
//! ## Features
//!
//! - **Client sockets**: connect with optional local bind and TLS
//! - **Listeners**: plain or TLS, accepted sockets get generated ids
//! - **In-place TLS upgrade**: `start_tls` on an established stream
//! - **Tagged writes**: every `send` resolves to `Written` or `Error`
//! - **Flow control**: `pause`/`resume` reading per socket
//! - **Full duplex**: reads keep flowing while a large write is pending
//! - **Introspection**: byte counters and TLS certificates per socket
//!
//! ## Example
//!
//! ```rust,no_run
//! use tcpmux_session::{ConnectOptions, ListenOptions, ManagerConfig, SessionManager, SocketEvent};
//!
//! # async fn example() -> Result<(), tcpmux_session::SocketError> {
//! let (manager, mut events) = SessionManager::channel(ManagerConfig::default());
//! manager.listen(1, ListenOptions::new("127.0.0.1", 0))?;
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         SocketEvent::Listening { address, .. } => {
//!             manager.connect(10, &address.address, address.port, ConnectOptions::default(), None)?;
//!         }
//!         SocketEvent::Connect { id, .. } => manager.send(id, &b"ping"[..], 1)?,
//!         SocketEvent::Data { id, data } => println!("socket {} got {} bytes", id, data.len()),
//!         SocketEvent::Close { id, error } => println!("socket {} closed ({:?})", id, error),
//!         _ => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod connection;
pub mod error;
pub mod event;
pub mod manager;
pub mod options;
pub mod registry;
pub mod transport;

/// Socket identifier, unique among the live sockets of one manager
pub type SocketId = u32;

pub use connection::{ConnectionState, Role, TlsState};
pub use error::{ErrorKind, Result, SocketError};
pub use event::{AddressFamily, AddressInfo, ChannelSink, ConnectionInfo, EventSink, SocketEvent};
pub use manager::{ManagerConfig, SessionManager};
pub use options::{ConnectOptions, ListenOptions, TlsOptions, TlsServerOptions};
pub use transport::tls::Certificate;
