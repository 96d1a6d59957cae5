//! A single managed socket: outbound client, listener, or accepted child.
//!
//! Every connection runs its transport on its own tokio task. Operations on
//! the [`Connection`] validate synchronously and hand work to that task over
//! a command channel; the task reports back through [`Signal`]s that the
//! session manager turns into host events.

use crate::error::{Result, SocketError};
use crate::event::{AddressInfo, ConnectionInfo};
use crate::options::{validate_endpoint, ConnectOptions, ListenOptions, TlsOptions, TlsServerOptions};
use crate::transport::tls::{self, Certificate, ServerTls};
use crate::transport::{self, IoStream};
use crate::SocketId;
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, trace, warn};

/// Default size of the per-connection read buffer
pub const DEFAULT_READ_BUFFER: usize = 16 * 1024;

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// What kind of socket a connection wraps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Outbound connection
    Client,
    /// Listening socket
    Server,
    /// Connection accepted by a listener
    Accepted,
}

/// TLS progress of an established stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsState {
    /// No TLS
    Plain,
    /// Handshake in progress
    Upgrading,
    /// Handshake finished
    Secure,
}

/// Lifecycle state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, nothing started
    Idle,
    /// Connecting, binding, or running the accept-side handshake
    Connecting,
    /// Stream established
    Connected(TlsState),
    /// Bound and accepting
    Listening,
    /// `end` requested, flushing queued writes
    Closing,
    /// Transport released
    Closed,
}

/// Raw callbacks from a connection task to the manager
pub(crate) enum Signal {
    Connected(ConnectionInfo),
    Listening(SocketAddr),
    Accepted {
        stream: TcpStream,
        tls: Option<ServerTls>,
    },
    SecureAccepted(ConnectionInfo),
    SecureUpgraded,
    Data(Bytes),
    Written(u64),
    Error(SocketError),
    Closed(Option<SocketError>),
}

/// A signal tagged with the connection that raised it
pub(crate) struct Envelope {
    pub(crate) connection: Arc<Connection>,
    pub(crate) signal: Signal,
}

/// Per-connection tunables resolved by the manager
#[derive(Debug, Clone)]
pub(crate) struct Settings {
    pub(crate) send_timeout: Option<Duration>,
    pub(crate) read_buffer: usize,
    pub(crate) no_delay: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            send_timeout: None,
            read_buffer: DEFAULT_READ_BUFFER,
            no_delay: false,
        }
    }
}

enum Upgrade {
    Client(tls::ClientTls),
    Server(ServerTls),
}

impl Upgrade {
    fn certificate(&self) -> Option<Certificate> {
        match self {
            Upgrade::Client(client) => client.certificate.clone(),
            Upgrade::Server(server) => server.certificate.clone(),
        }
    }
}

enum Command {
    Write {
        data: Bytes,
        msg_id: u64,
        timeout: Option<Duration>,
    },
    StartTls(Upgrade),
    End,
    NoDelay(bool),
    KeepAlive(bool, Option<Duration>),
    Pause,
    Resume,
}

/// Work for the writer half of a split stream, in queue order
enum Outbound {
    Write {
        data: Bytes,
        msg_id: u64,
        timeout: Option<Duration>,
    },
    /// Hand the write half back for a TLS upgrade
    Release,
    /// Flush, send FIN, stop
    End,
}

enum WriterExit {
    Released(WriteHalf<IoStream>),
    Failed(SocketError),
    Ended(std::io::Result<()>),
}

enum WriteOutcome {
    Done,
    TimedOut,
    Failed(std::io::Error),
}

#[derive(Debug, Default)]
struct Certificates {
    local: Option<Certificate>,
    peer: Option<Certificate>,
}

/// One managed socket
pub struct Connection {
    id: SocketId,
    serial: u64,
    role: Role,
    parent: Option<SocketId>,
    settings: Settings,
    state: Mutex<ConnectionState>,
    local_addr: Mutex<Option<SocketAddr>>,
    remote_host: Mutex<Option<String>>,
    commands: mpsc::UnboundedSender<Command>,
    command_rx: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    signals: mpsc::UnboundedSender<Envelope>,
    shutdown: Notify,
    closed: AtomicBool,
    destroyed: AtomicBool,
    announced: AtomicBool,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    certificates: Mutex<Certificates>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("serial", &self.serial)
            .field("role", &self.role)
            .field("state", &self.state())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Connection {
    pub(crate) fn new(
        id: SocketId,
        role: Role,
        parent: Option<SocketId>,
        settings: Settings,
        signals: mpsc::UnboundedSender<Envelope>,
    ) -> Arc<Self> {
        let (commands, command_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            id,
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
            role,
            parent,
            settings,
            state: Mutex::new(ConnectionState::Idle),
            local_addr: Mutex::new(None),
            remote_host: Mutex::new(None),
            commands,
            command_rx: Mutex::new(Some(command_rx)),
            signals,
            shutdown: Notify::new(),
            closed: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            // Accepted sockets are announced by the manager once it has
            // reported them to the host
            announced: AtomicBool::new(role != Role::Accepted),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            certificates: Mutex::new(Certificates::default()),
        })
    }

    /// Identifier this connection is registered under
    pub fn id(&self) -> SocketId {
        self.id
    }

    /// Instance serial, unique for the life of the process
    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Socket role
    pub fn role(&self) -> Role {
        self.role
    }

    /// Listener that accepted this socket
    pub fn parent(&self) -> Option<SocketId> {
        self.parent
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    /// Bytes delivered as data so far
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    /// Bytes the transport accepted so far
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub(crate) fn is_announced(&self) -> bool {
        self.announced.load(Ordering::Acquire)
    }

    pub(crate) fn announce(&self) {
        self.announced.store(true, Ordering::Release);
    }

    fn set_state(&self, state: ConnectionState) {
        let mut current = lock(&self.state);
        if *current != ConnectionState::Closed {
            *current = state;
        }
    }

    /// Move to `to` when the current state is `from`
    fn advance(&self, from: ConnectionState, to: ConnectionState) -> bool {
        let mut current = lock(&self.state);
        if *current == from {
            *current = to;
            true
        } else {
            false
        }
    }

    fn signal(self: &Arc<Self>, signal: Signal) {
        let envelope = Envelope {
            connection: self.clone(),
            signal,
        };
        if self.signals.send(envelope).is_err() {
            trace!("Socket {}: manager gone, dropping signal", self.id);
        }
    }

    fn take_commands(&self) -> Result<mpsc::UnboundedReceiver<Command>> {
        lock(&self.command_rx)
            .take()
            .ok_or_else(|| SocketError::InvalidInvocation(format!("socket {} already started", self.id)))
    }

    fn start(&self) -> Result<mpsc::UnboundedReceiver<Command>> {
        if !self.advance(ConnectionState::Idle, ConnectionState::Connecting) {
            return Err(SocketError::InvalidInvocation(format!(
                "socket {} already started",
                self.id
            )));
        }
        self.take_commands()
    }

    /// Begin an outbound connection
    pub(crate) fn connect(
        self: &Arc<Self>,
        host: &str,
        port: u16,
        options: ConnectOptions,
        tls_options: Option<TlsOptions>,
    ) -> Result<()> {
        validate_endpoint(host, port)?;
        options.validate()?;
        let client_tls = tls_options
            .as_ref()
            .map(|tls_options| tls::client_tls(tls_options, host))
            .transpose()?;

        let commands = self.start()?;
        *lock(&self.remote_host) = Some(host.to_string());

        debug!("Socket {}: connecting to {}:{}", self.id, host, port);
        let connection = self.clone();
        let host = host.to_string();
        tokio::spawn(async move {
            connection
                .run_client(host, port, options, client_tls, commands)
                .await;
        });
        Ok(())
    }

    /// Bind and start accepting
    pub(crate) fn listen(self: &Arc<Self>, options: ListenOptions) -> Result<()> {
        options.validate()?;
        let acceptor = options.tls.as_ref().map(tls::server_tls).transpose()?;

        // Listeners never consume commands
        self.start()?;

        let connection = self.clone();
        tokio::spawn(async move {
            connection.run_listener(options, acceptor).await;
        });
        Ok(())
    }

    /// Take over a stream accepted by a listener
    pub(crate) fn attach(self: &Arc<Self>, stream: TcpStream, acceptor: Option<ServerTls>) {
        let commands = match self.take_commands() {
            Ok(commands) => commands,
            Err(_) => return,
        };
        if self.settings.no_delay {
            let _ = stream.set_nodelay(true);
        }
        *lock(&self.local_addr) = stream.local_addr().ok();

        let connection = self.clone();
        match acceptor {
            None => {
                self.advance(ConnectionState::Idle, ConnectionState::Connected(TlsState::Plain));
                tokio::spawn(async move {
                    connection.drive(IoStream::Plain(stream), commands).await;
                });
            }
            Some(acceptor) => {
                self.advance(ConnectionState::Idle, ConnectionState::Connecting);
                tokio::spawn(async move {
                    connection.run_secure_child(stream, acceptor, commands).await;
                });
            }
        }
    }

    /// Queue a tagged write
    pub(crate) fn send(&self, data: Bytes, msg_id: u64, timeout: Option<Duration>) -> Result<()> {
        self.require_stream("send on")?;
        match self.state() {
            ConnectionState::Connected(_) => {}
            _ => return Err(SocketError::Closed),
        }
        let timeout = timeout.or(self.settings.send_timeout);
        trace!("Socket {}: queued {} bytes (msg {})", self.id, data.len(), msg_id);
        self.command(Command::Write {
            data,
            msg_id,
            timeout,
        })
    }

    /// Upgrade a plain established stream to TLS in place
    pub(crate) fn start_tls(&self, options: &TlsOptions) -> Result<()> {
        if self.role == Role::Server {
            return Err(SocketError::BadConfig(
                "cannot start TLS on a listening socket".to_string(),
            ));
        }

        let mut state = lock(&self.state);
        match *state {
            ConnectionState::Connected(TlsState::Plain) => {}
            ConnectionState::Closed => return Err(SocketError::Closed),
            ConnectionState::Connected(_) => {
                return Err(SocketError::BadConfig(format!(
                    "socket {} is already secure",
                    self.id
                )))
            }
            other => {
                return Err(SocketError::BadConfig(format!(
                    "socket {} is not connected ({:?})",
                    self.id, other
                )))
            }
        }

        let upgrade = match self.role {
            Role::Accepted => {
                let (cert, key) = options.identity()?.ok_or_else(|| {
                    SocketError::BadConfig(
                        "cert and key are required to secure an accepted socket".to_string(),
                    )
                })?;
                Upgrade::Server(tls::server_tls(&TlsServerOptions {
                    cert: cert.to_string(),
                    key: key.to_string(),
                    ca: options.ca.clone(),
                })?)
            }
            _ => {
                let host = lock(&self.remote_host).clone().unwrap_or_default();
                Upgrade::Client(tls::client_tls(options, &host)?)
            }
        };

        *state = ConnectionState::Connected(TlsState::Upgrading);
        drop(state);
        debug!("Socket {}: starting TLS upgrade", self.id);
        self.command(Command::StartTls(upgrade))
    }

    /// Flush queued writes, then half-close and release the transport
    ///
    /// Returns `true` when the caller should destroy the connection instead.
    pub(crate) fn end(&self) -> Result<bool> {
        match self.state() {
            ConnectionState::Closed => Err(SocketError::Closed),
            ConnectionState::Closing => Ok(false),
            ConnectionState::Idle | ConnectionState::Listening => Ok(true),
            ConnectionState::Connecting if self.role == Role::Server => Ok(true),
            ConnectionState::Connecting => self.command(Command::End).map(|_| false),
            ConnectionState::Connected(_) => {
                self.set_state(ConnectionState::Closing);
                self.command(Command::End).map(|_| false)
            }
        }
    }

    /// Tear down immediately; queued writes are discarded
    ///
    /// Idempotent. Only the first call (or a concurrent close of the
    /// connection task) produces the terminal signal.
    pub(crate) fn destroy(self: &Arc<Self>) {
        self.destroyed.store(true, Ordering::Release);
        if self.mark_closed() {
            debug!("Socket {}: destroyed", self.id);
            self.shutdown.notify_one();
            self.signal(Signal::Closed(None));
        }
    }

    pub(crate) fn set_no_delay(&self, enable: bool) -> Result<()> {
        self.require_stream("set no-delay on")?;
        self.require_open()?;
        self.command(Command::NoDelay(enable))
    }

    pub(crate) fn set_keep_alive(&self, enable: bool, initial_delay: Option<Duration>) -> Result<()> {
        self.require_stream("set keep-alive on")?;
        self.require_open()?;
        self.command(Command::KeepAlive(enable, initial_delay))
    }

    pub(crate) fn pause(&self) -> Result<()> {
        self.require_stream("pause")?;
        self.require_open()?;
        self.command(Command::Pause)
    }

    pub(crate) fn resume(&self) -> Result<()> {
        self.require_stream("resume")?;
        self.require_open()?;
        self.command(Command::Resume)
    }

    /// Certificate the peer presented; `None` on plain streams
    pub(crate) fn peer_certificate(&self) -> Result<Option<Certificate>> {
        self.require_stream("read certificates of")?;
        self.require_open()?;
        Ok(lock(&self.certificates).peer.clone())
    }

    /// Certificate this end presented; `None` on plain streams
    pub(crate) fn certificate(&self) -> Result<Option<Certificate>> {
        self.require_stream("read certificates of")?;
        self.require_open()?;
        Ok(lock(&self.certificates).local.clone())
    }

    /// Local end of the live transport
    pub(crate) fn get_address(&self) -> Result<AddressInfo> {
        if self.state() == ConnectionState::Closed {
            return Err(SocketError::Closed);
        }
        let local_addr = *lock(&self.local_addr);
        local_addr.map(AddressInfo::from).ok_or_else(|| {
            SocketError::InvalidInvocation(format!("socket {} is not bound yet", self.id))
        })
    }

    fn require_stream(&self, what: &str) -> Result<()> {
        if self.role == Role::Server {
            return Err(SocketError::InvalidInvocation(format!(
                "cannot {} listening socket {}",
                what, self.id
            )));
        }
        Ok(())
    }

    fn require_open(&self) -> Result<()> {
        match self.state() {
            ConnectionState::Closed => Err(SocketError::Closed),
            _ => Ok(()),
        }
    }

    fn command(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| SocketError::Closed)
    }

    /// Claim the terminal transition; true for the first caller only
    fn mark_closed(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        *lock(&self.state) = ConnectionState::Closed;
        *lock(&self.local_addr) = None;
        true
    }

    /// Terminal close from the connection task
    ///
    /// Writes that never reached the transport each get a `SendFailed`
    /// ahead of the close.
    fn finish(self: &Arc<Self>, error: Option<SocketError>, abandoned: Vec<u64>) {
        if !self.mark_closed() {
            return;
        }
        match &error {
            Some(e) => {
                warn!("Socket {}: closed with error: {}", self.id, e);
                self.signal(Signal::Error(e.clone()));
            }
            None => debug!("Socket {}: closed", self.id),
        }
        if !abandoned.is_empty() {
            debug!("Socket {}: failing {} queued writes", self.id, abandoned.len());
        }
        for msg_id in abandoned {
            self.signal(Signal::Error(SocketError::SendFailed {
                msg_id,
                reason: "socket closed before the write completed".to_string(),
            }));
        }
        self.signal(Signal::Closed(error));
    }

    fn record_certificates(&self, stream: &IoStream, local: Option<Certificate>) {
        let mut certificates = lock(&self.certificates);
        certificates.peer = stream.peer_certificate();
        certificates.local = local;
    }

    async fn establish(
        &self,
        host: &str,
        port: u16,
        options: &ConnectOptions,
        client_tls: Option<tls::ClientTls>,
    ) -> Result<IoStream> {
        let remote = transport::resolve(host, port).await?;
        let local = options.local_bind(&remote)?;
        let tcp = transport::connect_tcp(remote, local, options.reuse_address()).await?;
        if options.no_delay.unwrap_or(self.settings.no_delay) {
            tcp.set_nodelay(true)?;
        }

        match client_tls {
            None => Ok(IoStream::Plain(tcp)),
            Some(client_tls) => tls::connect_tls(client_tls, tcp)
                .await
                .map_err(|e| SocketError::Other(format!("{:#}", e))),
        }
    }

    async fn run_client(
        self: Arc<Self>,
        host: String,
        port: u16,
        options: ConnectOptions,
        client_tls: Option<tls::ClientTls>,
        commands: mpsc::UnboundedReceiver<Command>,
    ) {
        let secure = client_tls.is_some();
        let local_certificate = client_tls.as_ref().and_then(|tls| tls.certificate.clone());
        let established = tokio::select! {
            biased;
            _ = self.shutdown.notified() => return,
            result = self.establish(&host, port, &options, client_tls) => result,
        };

        let stream = match established.and_then(|stream| {
            let info = ConnectionInfo::new(stream.local_addr()?, stream.peer_addr()?);
            Ok((stream, info))
        }) {
            Ok((stream, info)) => {
                info!(
                    "Socket {}: connected to {}:{}{}",
                    self.id,
                    info.remote_address,
                    info.remote_port,
                    if secure { " (TLS)" } else { "" }
                );
                *lock(&self.local_addr) = stream.local_addr().ok();
                if secure {
                    self.record_certificates(&stream, local_certificate);
                }
                let tls_state = if secure { TlsState::Secure } else { TlsState::Plain };
                self.advance(ConnectionState::Connecting, ConnectionState::Connected(tls_state));
                self.signal(Signal::Connected(info));
                stream
            }
            Err(e) => {
                self.finish(Some(e), Vec::new());
                return;
            }
        };

        self.drive(stream, commands).await;
    }

    async fn run_secure_child(
        self: Arc<Self>,
        stream: TcpStream,
        server: ServerTls,
        commands: mpsc::UnboundedReceiver<Command>,
    ) {
        let handshake = tokio::select! {
            biased;
            _ = self.shutdown.notified() => return,
            result = tls::accept_tls(&server.acceptor, stream) => result,
        };

        let stream = match handshake.and_then(|stream| {
            let info = ConnectionInfo::new(stream.local_addr()?, stream.peer_addr()?);
            Ok((stream, info))
        }) {
            Ok((stream, info)) => {
                self.record_certificates(&stream, server.certificate.clone());
                self.advance(
                    ConnectionState::Connecting,
                    ConnectionState::Connected(TlsState::Secure),
                );
                self.signal(Signal::SecureAccepted(info));
                stream
            }
            Err(e) => {
                debug!("Socket {}: TLS accept failed: {:#}", self.id, e);
                self.finish(Some(SocketError::Other(format!("{:#}", e))), Vec::new());
                return;
            }
        };

        self.drive(stream, commands).await;
    }

    async fn run_listener(self: Arc<Self>, options: ListenOptions, acceptor: Option<ServerTls>) {
        let bind = async {
            let addr = transport::resolve(&options.host, options.port).await?;
            let listener = transport::listen_tcp(addr, options.reuse_address, options.backlog).await?;
            Ok::<TcpListener, SocketError>(listener)
        };
        let bound = tokio::select! {
            biased;
            _ = self.shutdown.notified() => return,
            result = bind => result.and_then(|listener| {
                let addr = listener.local_addr()?;
                Ok((listener, addr))
            }),
        };

        let listener = match bound {
            Ok((listener, addr)) => {
                info!(
                    "Socket {}: listening on {}{}",
                    self.id,
                    addr,
                    if acceptor.is_some() { " (TLS)" } else { "" }
                );
                *lock(&self.local_addr) = Some(addr);
                self.advance(ConnectionState::Connecting, ConnectionState::Listening);
                self.signal(Signal::Listening(addr));
                listener
            }
            Err(e) => {
                self.finish(Some(e), Vec::new());
                return;
            }
        };

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.notified() => {
                    debug!("Socket {}: listener stopped", self.id);
                    return;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("Socket {}: accepted connection from {}", self.id, peer);
                        self.signal(Signal::Accepted {
                            stream,
                            tls: acceptor.clone(),
                        });
                    }
                    Err(e) => {
                        // Per-connection failures (aborted handshakes, fd
                        // exhaustion) leave the listener usable
                        warn!("Socket {}: accept failed: {}", self.id, e);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
            }
        }
    }

    async fn upgrade(&self, stream: IoStream, upgrade: Upgrade) -> Option<Result<IoStream>> {
        let tcp = match stream {
            IoStream::Plain(tcp) => tcp,
            _ => {
                return Some(Err(SocketError::BadConfig(format!(
                    "socket {} is already secure",
                    self.id
                ))))
            }
        };
        let handshake = async {
            match upgrade {
                Upgrade::Client(client_tls) => tls::connect_tls(client_tls, tcp).await,
                Upgrade::Server(server) => tls::accept_tls(&server.acceptor, tcp).await,
            }
        };

        tokio::select! {
            biased;
            _ = self.shutdown.notified() => None,
            result = handshake => Some(result.map_err(|e| SocketError::Other(format!("{:#}", e)))),
        }
    }

    /// Run the stream until it closes or is destroyed, upgrading in between
    async fn drive(self: &Arc<Self>, mut stream: IoStream, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut paused = false;
        loop {
            let Some((plain, upgrade)) = self.pump(stream, &mut commands, &mut paused).await else {
                return;
            };
            let local_certificate = upgrade.certificate();
            match self.upgrade(plain, upgrade).await {
                Some(Ok(secure)) => {
                    self.record_certificates(&secure, local_certificate);
                    self.advance(
                        ConnectionState::Connected(TlsState::Upgrading),
                        ConnectionState::Connected(TlsState::Secure),
                    );
                    info!("Socket {}: TLS upgrade complete", self.id);
                    self.signal(Signal::SecureUpgraded);
                    stream = secure;
                }
                Some(Err(e)) => {
                    let abandoned = queued_writes(&mut commands);
                    self.finish(Some(e), abandoned);
                    return;
                }
                None => return,
            }
        }
    }

    /// Read and write one stream concurrently
    ///
    /// Returns the reunited stream when a TLS upgrade was requested, `None`
    /// once the connection is closed or destroyed.
    async fn pump(
        self: &Arc<Self>,
        stream: IoStream,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        paused: &mut bool,
    ) -> Option<(IoStream, Upgrade)> {
        let socket = match transport::socket_handle(stream.tcp()) {
            Ok(socket) => socket,
            Err(e) => {
                let abandoned = queued_writes(commands);
                self.finish(Some(e.into()), abandoned);
                return None;
            }
        };
        let capacity = self.settings.read_buffer.max(1);
        let mut buf = BytesMut::with_capacity(capacity);
        let (mut reader, writer) = tokio::io::split(stream);

        // Message ids handed to the writer and not yet resolved, oldest first
        let inflight = Mutex::new(VecDeque::new());
        let (outbound, queue) = mpsc::unbounded_channel();
        let flusher = self.write_loop(writer, queue, &inflight);
        tokio::pin!(flusher);

        let mut upgrade: Option<Upgrade> = None;
        let mut ending = false;
        let mut peer_ended = false;

        loop {
            let readable = !*paused && !peer_ended && upgrade.is_none();
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => return None,

                exit = &mut flusher => {
                    let error = match exit {
                        WriterExit::Released(writer) => {
                            let stream = reader.unsplit(writer);
                            return upgrade.take().map(|upgrade| (stream, upgrade));
                        }
                        WriterExit::Failed(e) => Some(e),
                        WriterExit::Ended(Ok(())) => None,
                        WriterExit::Ended(Err(e)) if peer_ended => {
                            debug!("Socket {}: closing after peer FIN: {}", self.id, e);
                            None
                        }
                        WriterExit::Ended(Err(e)) => Some(e.into()),
                    };
                    self.finish(error, unresolved_writes(&inflight, commands));
                    return None;
                }

                command = commands.recv(), if !ending && upgrade.is_none() => {
                    let Some(command) = command else { return None };
                    match command {
                        Command::Write { data, msg_id, timeout } => {
                            lock(&inflight).push_back(msg_id);
                            let _ = outbound.send(Outbound::Write { data, msg_id, timeout });
                        }
                        Command::StartTls(next) => {
                            // Reads stop so the handshake bytes reach TLS
                            upgrade = Some(next);
                            let _ = outbound.send(Outbound::Release);
                        }
                        Command::End => {
                            ending = true;
                            let _ = outbound.send(Outbound::End);
                        }
                        Command::NoDelay(enable) => {
                            if let Err(e) = socket.set_nodelay(enable) {
                                self.signal(Signal::Error(e.into()));
                            }
                        }
                        Command::KeepAlive(enable, initial_delay) => {
                            if let Err(e) = transport::set_keepalive(&socket, enable, initial_delay) {
                                self.signal(Signal::Error(e.into()));
                            }
                        }
                        Command::Pause => *paused = true,
                        Command::Resume => *paused = false,
                    }
                }

                result = reader.read_buf(&mut buf), if readable => match result {
                    Ok(0) => {
                        // No half-open sockets: flush what is queued and close
                        debug!("Socket {}: peer closed its side", self.id);
                        peer_ended = true;
                        self.set_state(ConnectionState::Closing);
                        if !ending {
                            ending = true;
                            let _ = outbound.send(Outbound::End);
                        }
                    }
                    Ok(n) => {
                        trace!("Socket {}: read {} bytes", self.id, n);
                        self.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
                        self.signal(Signal::Data(buf.split().freeze()));
                        buf.reserve(capacity);
                    }
                    Err(e) => {
                        self.finish(Some(e.into()), unresolved_writes(&inflight, commands));
                        return None;
                    }
                },
            }
        }
    }

    /// Drain the write queue in order, resolving each message id
    async fn write_loop(
        self: &Arc<Self>,
        mut writer: WriteHalf<IoStream>,
        mut queue: mpsc::UnboundedReceiver<Outbound>,
        inflight: &Mutex<VecDeque<u64>>,
    ) -> WriterExit {
        while let Some(item) = queue.recv().await {
            match item {
                Outbound::Write { data, msg_id, timeout } => {
                    let outcome = write_with_deadline(&mut writer, &data, timeout).await;
                    lock(inflight).pop_front();
                    match outcome {
                        WriteOutcome::Done => {
                            trace!("Socket {}: wrote {} bytes (msg {})", self.id, data.len(), msg_id);
                            self.bytes_written
                                .fetch_add(data.len() as u64, Ordering::Relaxed);
                            self.signal(Signal::Written(msg_id));
                        }
                        WriteOutcome::TimedOut => {
                            warn!("Socket {}: write timed out (msg {})", self.id, msg_id);
                            self.signal(Signal::Error(SocketError::SendTimeout { msg_id }));
                        }
                        WriteOutcome::Failed(e) => {
                            return WriterExit::Failed(SocketError::SendFailed {
                                msg_id,
                                reason: e.to_string(),
                            })
                        }
                    }
                }
                Outbound::Release => return WriterExit::Released(writer),
                Outbound::End => {
                    let result = async {
                        writer.flush().await?;
                        writer.shutdown().await
                    }
                    .await;
                    return WriterExit::Ended(result);
                }
            }
        }
        WriterExit::Ended(Ok(()))
    }
}

async fn write_with_deadline<W>(writer: &mut W, data: &[u8], timeout: Option<Duration>) -> WriteOutcome
where
    W: AsyncWrite + Unpin,
{
    let io = async {
        writer.write_all(data).await?;
        writer.flush().await
    };
    let result = match timeout {
        Some(limit) => match tokio::time::timeout(limit, io).await {
            Ok(result) => result,
            Err(_) => return WriteOutcome::TimedOut,
        },
        None => io.await,
    };
    match result {
        Ok(()) => WriteOutcome::Done,
        Err(e) => WriteOutcome::Failed(e),
    }
}

/// Writes handed to the writer but never resolved, then those still queued
fn unresolved_writes(
    inflight: &Mutex<VecDeque<u64>>,
    commands: &mut mpsc::UnboundedReceiver<Command>,
) -> Vec<u64> {
    let mut msg_ids: Vec<u64> = lock(inflight).drain(..).collect();
    msg_ids.extend(queued_writes(commands));
    msg_ids
}

/// Message ids of writes still waiting in the command queue
fn queued_writes(commands: &mut mpsc::UnboundedReceiver<Command>) -> Vec<u64> {
    let mut msg_ids = Vec::new();
    while let Ok(command) = commands.try_recv() {
        if let Command::Write { msg_id, .. } = command {
            msg_ids.push(msg_id);
        }
    }
    msg_ids
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detached(role: Role) -> (Arc<Connection>, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Connection::new(9, role, None, Settings::default(), tx), rx)
    }

    #[tokio::test]
    async fn test_idle_connection_rejects_stream_ops() {
        let (conn, _rx) = detached(Role::Client);
        assert_eq!(conn.state(), ConnectionState::Idle);
        assert_eq!(conn.send(Bytes::from_static(b"x"), 1, None), Err(SocketError::Closed));
        assert!(matches!(
            conn.start_tls(&TlsOptions::insecure()),
            Err(SocketError::BadConfig(_))
        ));
        assert!(matches!(conn.get_address(), Err(SocketError::InvalidInvocation(_))));
        assert_eq!(conn.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_connect_validates_synchronously() {
        let (conn, mut rx) = detached(Role::Client);
        assert!(matches!(
            conn.connect("", 80, ConnectOptions::default(), None),
            Err(SocketError::BadParam(_))
        ));
        let bad_local = ConnectOptions {
            local_address: Some("nope".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            conn.connect("127.0.0.1", 80, bad_local, None),
            Err(SocketError::BadConfig(_))
        ));
        assert!(matches!(
            conn.connect("127.0.0.1", 80, ConnectOptions::default(), Some(TlsOptions::default())),
            Err(SocketError::BadConfig(_))
        ));
        assert_eq!(conn.state(), ConnectionState::Idle);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let (conn, mut rx) = detached(Role::Client);
        conn.destroy();
        conn.destroy();
        assert_eq!(conn.state(), ConnectionState::Closed);

        let envelope = rx.try_recv().unwrap();
        assert!(matches!(envelope.signal, Signal::Closed(None)));
        assert!(rx.try_recv().is_err());
        assert_eq!(conn.end(), Err(SocketError::Closed));
        assert_eq!(conn.pause(), Err(SocketError::Closed));
    }

    #[tokio::test]
    async fn test_listener_rejects_stream_ops() {
        let (conn, _rx) = detached(Role::Server);
        assert!(matches!(
            conn.send(Bytes::from_static(b"x"), 1, None),
            Err(SocketError::InvalidInvocation(_))
        ));
        assert!(matches!(conn.pause(), Err(SocketError::InvalidInvocation(_))));
        assert!(matches!(
            conn.start_tls(&TlsOptions::insecure()),
            Err(SocketError::BadConfig(_))
        ));
        assert_eq!(conn.end(), Ok(true));
    }

    #[test]
    fn test_serials_are_unique() {
        let (a, _) = detached(Role::Client);
        let (b, _) = detached(Role::Client);
        assert_ne!(a.serial(), b.serial());
        assert!(a.is_announced());

        let (child, _) = detached(Role::Accepted);
        assert!(!child.is_announced());
        child.announce();
        assert!(child.is_announced());
    }
}
