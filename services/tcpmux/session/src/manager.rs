//! Session manager: the public entry point.
//!
//! The manager creates connections, keeps the registry, and runs the relay
//! pump that turns connection signals into [`SocketEvent`]s for the sink.
//! All signals from all connections go through one FIFO channel, so events
//! for a given id reach the sink in the order the connection raised them.

use crate::connection::{Connection, ConnectionState, Envelope, Role, Settings, Signal, DEFAULT_READ_BUFFER};
use crate::error::{Result, SocketError};
use crate::event::{AddressInfo, ChannelSink, ConnectionInfo, EventSink, SocketEvent};
use crate::options::{ConnectOptions, ListenOptions, TlsOptions};
use crate::registry::SessionRegistry;
use crate::transport::tls::{Certificate, ServerTls};
use crate::SocketId;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Manager-wide defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// First id handed out to accepted sockets
    pub first_child_id: SocketId,
    /// Write deadline applied when a connection sets none
    #[serde(with = "humantime_serde")]
    pub send_timeout: Option<Duration>,
    /// Read buffer size per connection
    pub read_buffer_size: usize,
    /// Disable Nagle's algorithm on new streams
    pub no_delay: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            first_child_id: 1,
            send_timeout: None,
            read_buffer_size: DEFAULT_READ_BUFFER,
            no_delay: false,
        }
    }
}

impl ManagerConfig {
    fn settings(&self) -> Settings {
        Settings {
            send_timeout: self.send_timeout,
            read_buffer: self.read_buffer_size,
            no_delay: self.no_delay,
        }
    }
}

struct ManagerInner {
    registry: Arc<SessionRegistry<Connection>>,
    signals: mpsc::UnboundedSender<Envelope>,
    settings: Settings,
}

impl ManagerInner {
    fn shutdown(&self) {
        let connections = self.registry.drain();
        if !connections.is_empty() {
            info!("Destroying {} sockets", connections.len());
        }
        for connection in connections {
            connection.destroy();
        }
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Multiplexes many sockets behind integer identifiers
///
/// Cloning is cheap and clones share the same sockets. Dropping the last
/// clone destroys everything still open.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("registry", &self.inner.registry)
            .finish()
    }
}

impl SessionManager {
    /// Create a manager delivering events to `sink`
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: ManagerConfig, sink: Arc<dyn EventSink>) -> Self {
        let registry = Arc::new(SessionRegistry::new(config.first_child_id));
        let (signals, signal_rx) = mpsc::unbounded_channel();

        let pump = RelayPump {
            registry: registry.clone(),
            sink,
            settings: config.settings(),
            signals: signals.downgrade(),
        };
        tokio::spawn(pump.run(signal_rx));

        Self {
            inner: Arc::new(ManagerInner {
                registry,
                signals,
                settings: config.settings(),
            }),
        }
    }

    /// Create a manager whose events are read from a channel
    pub fn channel(config: ManagerConfig) -> (Self, mpsc::UnboundedReceiver<SocketEvent>) {
        let (sink, events) = ChannelSink::channel();
        (Self::new(config, Arc::new(sink)), events)
    }

    fn lookup(&self, id: SocketId) -> Result<Arc<Connection>> {
        self.inner
            .registry
            .lookup(id)
            .ok_or_else(|| SocketError::unknown_id(id))
    }

    fn create(&self, id: SocketId, role: Role, settings: Settings) -> Result<Arc<Connection>> {
        let connection = Connection::new(id, role, None, settings, self.inner.signals.clone());
        self.inner
            .registry
            .register(id, connection.serial(), connection.clone())?;
        Ok(connection)
    }

    fn discard(&self, connection: &Connection) {
        self.inner
            .registry
            .unregister_if(connection.id(), connection.serial());
    }

    /// Open an outbound connection under `id`
    ///
    /// Completion is reported by a `Connect` event, or `Error` then `Close`.
    pub fn connect(
        &self,
        id: SocketId,
        host: &str,
        port: u16,
        options: ConnectOptions,
        tls_options: Option<TlsOptions>,
    ) -> Result<()> {
        let mut settings = self.inner.settings.clone();
        if options.send_timeout.is_some() {
            settings.send_timeout = options.send_timeout;
        }
        let connection = self.create(id, Role::Client, settings)?;
        if let Err(e) = connection.connect(host, port, options, tls_options) {
            self.discard(&connection);
            return Err(e);
        }
        Ok(())
    }

    /// Bind a listener under `id`; accepted sockets get generated ids
    pub fn listen(&self, id: SocketId, options: ListenOptions) -> Result<()> {
        let connection = self.create(id, Role::Server, self.inner.settings.clone())?;
        if let Err(e) = connection.listen(options) {
            self.discard(&connection);
            return Err(e);
        }
        Ok(())
    }

    /// Queue `data` for writing; completion is a `Written` event for `msg_id`
    pub fn send(&self, id: SocketId, data: impl Into<Bytes>, msg_id: u64) -> Result<()> {
        self.lookup(id)?.send(data.into(), msg_id, None)
    }

    /// Like [`send`](Self::send) with a deadline for this write only
    pub fn send_with_timeout(
        &self,
        id: SocketId,
        data: impl Into<Bytes>,
        msg_id: u64,
        timeout: Duration,
    ) -> Result<()> {
        self.lookup(id)?.send(data.into(), msg_id, Some(timeout))
    }

    /// Local address of the socket
    pub fn get_address(&self, id: SocketId) -> Result<AddressInfo> {
        self.lookup(id)?.get_address()
    }

    /// Upgrade a plain connection to TLS; completion is a `SecureConnect` event
    pub fn start_tls(&self, id: SocketId, tls_options: &TlsOptions) -> Result<()> {
        self.lookup(id)?.start_tls(tls_options)
    }

    /// Flush pending writes, half-close and release the socket
    pub fn end(&self, id: SocketId) -> Result<()> {
        let connection = self.lookup(id)?;
        if connection.end()? {
            self.destroy_connection(&connection);
        }
        Ok(())
    }

    /// Close immediately, discarding queued writes
    ///
    /// Unknown ids are ignored so that destroy can always be called.
    pub fn destroy(&self, id: SocketId) -> Result<()> {
        if let Some(connection) = self.inner.registry.lookup(id) {
            self.destroy_connection(&connection);
        }
        Ok(())
    }

    fn destroy_connection(&self, connection: &Arc<Connection>) {
        connection.destroy();
        // The id is free again as soon as destroy returns
        self.discard(connection);
    }

    /// Stop a listener
    pub fn close(&self, id: SocketId) -> Result<()> {
        let connection = self.lookup(id)?;
        if connection.role() != Role::Server {
            return Err(SocketError::InvalidInvocation(format!(
                "socket {} is not listening; use end or destroy",
                id
            )));
        }
        self.destroy_connection(&connection);
        Ok(())
    }

    /// Toggle TCP_NODELAY
    pub fn set_no_delay(&self, id: SocketId, enable: bool) -> Result<()> {
        self.lookup(id)?.set_no_delay(enable)
    }

    /// Toggle SO_KEEPALIVE
    pub fn set_keep_alive(&self, id: SocketId, enable: bool, initial_delay: Option<Duration>) -> Result<()> {
        self.lookup(id)?.set_keep_alive(enable, initial_delay)
    }

    /// Stop reading from the socket
    pub fn pause(&self, id: SocketId) -> Result<()> {
        self.lookup(id)?.pause()
    }

    /// Resume reading from the socket
    pub fn resume(&self, id: SocketId) -> Result<()> {
        self.lookup(id)?.resume()
    }

    /// Certificate the peer presented, once the socket is secure
    pub fn peer_certificate(&self, id: SocketId) -> Result<Option<Certificate>> {
        self.lookup(id)?.peer_certificate()
    }

    /// Certificate this end presented, once the socket is secure
    pub fn certificate(&self, id: SocketId) -> Result<Option<Certificate>> {
        self.lookup(id)?.certificate()
    }

    /// Lifecycle state of the socket
    pub fn state(&self, id: SocketId) -> Result<ConnectionState> {
        Ok(self.lookup(id)?.state())
    }

    /// Bytes received on the socket so far
    pub fn bytes_read(&self, id: SocketId) -> Result<u64> {
        Ok(self.lookup(id)?.bytes_read())
    }

    /// Bytes written to the socket so far, counting completed writes only
    pub fn bytes_written(&self, id: SocketId) -> Result<u64> {
        Ok(self.lookup(id)?.bytes_written())
    }

    /// Number of live sockets, listeners included
    pub fn connection_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Destroy every socket
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

/// Turns connection signals into sink events
struct RelayPump {
    registry: Arc<SessionRegistry<Connection>>,
    sink: Arc<dyn EventSink>,
    settings: Settings,
    signals: mpsc::WeakUnboundedSender<Envelope>,
}

impl RelayPump {
    async fn run(self, mut signal_rx: mpsc::UnboundedReceiver<Envelope>) {
        debug!("Relay pump started");
        while let Some(envelope) = signal_rx.recv().await {
            self.dispatch(envelope);
        }
        debug!("Relay pump stopped");
    }

    fn dispatch(&self, envelope: Envelope) {
        let Envelope { connection, signal } = envelope;
        let id = connection.id();

        let event = match signal {
            Signal::Closed(error) => {
                self.registry.unregister_if(id, connection.serial());
                if !connection.is_announced() {
                    return;
                }
                SocketEvent::Close { id, error }
            }
            // Nothing but the close follows a destroy
            _ if connection.is_destroyed() => return,
            Signal::Connected(info) => SocketEvent::Connect {
                id,
                connection: info,
            },
            Signal::Listening(addr) => SocketEvent::Listening {
                id,
                address: addr.into(),
            },
            Signal::Accepted { stream, tls } => {
                self.accept(&connection, stream, tls);
                return;
            }
            Signal::SecureAccepted(info) => {
                connection.announce();
                SocketEvent::SecureConnection {
                    id: connection.parent().unwrap_or(id),
                    child_id: id,
                    connection: info,
                }
            }
            Signal::SecureUpgraded => SocketEvent::SecureConnect { id },
            Signal::Data(data) => SocketEvent::Data { id, data },
            Signal::Written(msg_id) => SocketEvent::Written { id, msg_id },
            Signal::Error(error) => {
                if !connection.is_announced() {
                    return;
                }
                SocketEvent::Error { id, error }
            }
        };

        self.sink.emit(event);
    }

    fn accept(&self, listener: &Connection, stream: TcpStream, tls: Option<ServerTls>) {
        let Some(signals) = self.signals.upgrade() else {
            return;
        };
        let parent = listener.id();
        let settings = self.settings.clone();

        let registered = self.registry.register_child(|child_id| {
            let child = Connection::new(child_id, Role::Accepted, Some(parent), settings, signals);
            (child.serial(), child)
        });
        let (child_id, child) = match registered {
            Ok(registered) => registered,
            Err(e) => {
                warn!("Socket {}: dropping accepted connection: {}", parent, e);
                return;
            }
        };

        if tls.is_none() {
            let info = match (stream.local_addr(), stream.peer_addr()) {
                (Ok(local), Ok(remote)) => ConnectionInfo::new(local, remote),
                (Err(e), _) | (_, Err(e)) => {
                    debug!("Socket {}: accepted socket already gone: {}", parent, e);
                    self.registry.unregister_if(child_id, child.serial());
                    return;
                }
            };
            child.announce();
            self.sink.emit(SocketEvent::Connection {
                id: parent,
                child_id,
                connection: info,
            });
        }

        debug!("Socket {}: accepted socket {}", parent, child_id);
        child.attach(stream, tls);
    }
}
