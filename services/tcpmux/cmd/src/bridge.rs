//! JSON-lines host bridge.
//!
//! Each stdin line is one command, e.g.
//! `{"op":"connect","id":1,"host":"example.com","port":80}`. Each stdout line
//! is one record: a socket event, an `address` reply, or a synchronous
//! `error` naming the failed `op`. Payloads travel as standard base64.

use anyhow::Result;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tcpmux_session::{
    AddressInfo, Certificate, ConnectOptions, ConnectionInfo, ErrorKind, ListenOptions,
    SessionManager, SocketError, SocketEvent, SocketId, TlsOptions,
};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::{component_debug, component_info, component_warn};

/// How long to keep forwarding close events after input ends
const DRAIN_PERIOD: Duration = Duration::from_millis(200);

/// A host request
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum Command {
    #[serde(rename_all = "camelCase")]
    Connect {
        id: SocketId,
        host: String,
        port: u16,
        #[serde(default)]
        options: ConnectOptions,
        #[serde(default)]
        tls: Option<TlsOptions>,
    },
    #[serde(rename_all = "camelCase")]
    Listen { id: SocketId, options: ListenOptions },
    #[serde(rename_all = "camelCase")]
    Send {
        id: SocketId,
        data: String,
        msg_id: u64,
        #[serde(default, with = "humantime_serde")]
        timeout: Option<Duration>,
    },
    GetAddress { id: SocketId },
    GetPeerCertificate { id: SocketId },
    GetCertificate { id: SocketId },
    GetStats { id: SocketId },
    #[serde(rename_all = "camelCase")]
    StartTls {
        id: SocketId,
        #[serde(default)]
        tls: TlsOptions,
    },
    End { id: SocketId },
    Destroy { id: SocketId },
    Close { id: SocketId },
    SetNoDelay {
        id: SocketId,
        #[serde(default = "enabled")]
        enable: bool,
    },
    #[serde(rename_all = "camelCase")]
    SetKeepAlive {
        id: SocketId,
        #[serde(default = "enabled")]
        enable: bool,
        #[serde(default, with = "humantime_serde")]
        initial_delay: Option<Duration>,
    },
    Pause { id: SocketId },
    Resume { id: SocketId },
}

fn enabled() -> bool {
    true
}

impl Command {
    fn op(&self) -> &'static str {
        match self {
            Command::Connect { .. } => "connect",
            Command::Listen { .. } => "listen",
            Command::Send { .. } => "send",
            Command::GetAddress { .. } => "getAddress",
            Command::GetPeerCertificate { .. } => "getPeerCertificate",
            Command::GetCertificate { .. } => "getCertificate",
            Command::GetStats { .. } => "getStats",
            Command::StartTls { .. } => "startTls",
            Command::End { .. } => "end",
            Command::Destroy { .. } => "destroy",
            Command::Close { .. } => "close",
            Command::SetNoDelay { .. } => "setNoDelay",
            Command::SetKeepAlive { .. } => "setKeepAlive",
            Command::Pause { .. } => "pause",
            Command::Resume { .. } => "resume",
        }
    }

    fn id(&self) -> SocketId {
        match self {
            Command::Connect { id, .. }
            | Command::Listen { id, .. }
            | Command::Send { id, .. }
            | Command::GetAddress { id }
            | Command::GetPeerCertificate { id }
            | Command::GetCertificate { id }
            | Command::GetStats { id }
            | Command::StartTls { id, .. }
            | Command::End { id }
            | Command::Destroy { id }
            | Command::Close { id }
            | Command::SetNoDelay { id, .. }
            | Command::SetKeepAlive { id, .. }
            | Command::Pause { id }
            | Command::Resume { id } => *id,
        }
    }
}

/// Error payload of `error` and `close` records
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<u64>,
}

impl From<&SocketError> for ErrorBody {
    fn from(error: &SocketError) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
            msg_id: error.msg_id(),
        }
    }
}

/// One stdout line
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Record {
    Connect {
        id: SocketId,
        connection: ConnectionInfo,
    },
    Listening {
        id: SocketId,
        address: AddressInfo,
    },
    #[serde(rename_all = "camelCase")]
    Connection {
        id: SocketId,
        child_id: SocketId,
        connection: ConnectionInfo,
    },
    #[serde(rename_all = "camelCase")]
    SecureConnection {
        id: SocketId,
        child_id: SocketId,
        connection: ConnectionInfo,
    },
    SecureConnect {
        id: SocketId,
    },
    Data {
        id: SocketId,
        data: String,
    },
    #[serde(rename_all = "camelCase")]
    Written {
        id: SocketId,
        msg_id: u64,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<SocketId>,
        /// Set for synchronous failures of a command
        #[serde(skip_serializing_if = "Option::is_none")]
        op: Option<&'static str>,
        #[serde(flatten)]
        error: ErrorBody,
    },
    #[serde(rename_all = "camelCase")]
    Close {
        id: SocketId,
        had_error: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<ErrorBody>,
    },
    Address {
        id: SocketId,
        address: AddressInfo,
    },
    /// Reply to `getPeerCertificate` and `getCertificate`; no `pem` on plain sockets
    Certificate {
        id: SocketId,
        peer: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        pem: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Stats {
        id: SocketId,
        bytes_read: u64,
        bytes_written: u64,
    },
}

impl From<SocketEvent> for Record {
    fn from(event: SocketEvent) -> Self {
        match event {
            SocketEvent::Connect { id, connection } => Record::Connect { id, connection },
            SocketEvent::Listening { id, address } => Record::Listening { id, address },
            SocketEvent::Connection {
                id,
                child_id,
                connection,
            } => Record::Connection {
                id,
                child_id,
                connection,
            },
            SocketEvent::SecureConnection {
                id,
                child_id,
                connection,
            } => Record::SecureConnection {
                id,
                child_id,
                connection,
            },
            SocketEvent::SecureConnect { id } => Record::SecureConnect { id },
            SocketEvent::Data { id, data } => Record::Data {
                id,
                data: STANDARD.encode(&data),
            },
            SocketEvent::Written { id, msg_id } => Record::Written { id, msg_id },
            SocketEvent::Error { id, error } => Record::Error {
                id: Some(id),
                op: None,
                error: ErrorBody::from(&error),
            },
            SocketEvent::Close { id, error } => Record::Close {
                id,
                had_error: error.is_some(),
                error: error.as_ref().map(ErrorBody::from),
            },
        }
    }
}

fn failure(id: Option<SocketId>, op: Option<&'static str>, error: &SocketError) -> Record {
    Record::Error {
        id,
        op,
        error: ErrorBody::from(error),
    }
}

fn certificate_record(
    id: SocketId,
    peer: bool,
    certificate: tcpmux_session::Result<Option<Certificate>>,
    op: &'static str,
) -> Record {
    match certificate {
        Ok(certificate) => Record::Certificate {
            id,
            peer,
            pem: certificate.map(|certificate| certificate.to_pem()),
        },
        Err(e) => failure(Some(id), Some(op), &e),
    }
}

/// Run one command; returns the reply record, if the command has one
pub fn execute(manager: &SessionManager, command: Command) -> Option<Record> {
    let id = command.id();
    let op = command.op();
    component_debug!("bridge", "{} on socket {}", op, id);

    let result = match command {
        Command::Connect {
            id,
            host,
            port,
            options,
            tls,
        } => manager.connect(id, &host, port, options, tls),
        Command::Listen { id, options } => manager.listen(id, options),
        Command::Send {
            id,
            data,
            msg_id,
            timeout,
        } => match STANDARD.decode(data.as_bytes()) {
            Ok(bytes) => match timeout {
                Some(timeout) => manager.send_with_timeout(id, bytes, msg_id, timeout),
                None => manager.send(id, bytes, msg_id),
            },
            Err(e) => Err(SocketError::BadParam(format!("data is not base64: {}", e))),
        },
        Command::GetAddress { id } => {
            return Some(match manager.get_address(id) {
                Ok(address) => Record::Address { id, address },
                Err(e) => failure(Some(id), Some(op), &e),
            })
        }
        Command::GetPeerCertificate { id } => {
            return Some(certificate_record(id, true, manager.peer_certificate(id), op));
        }
        Command::GetCertificate { id } => {
            return Some(certificate_record(id, false, manager.certificate(id), op));
        }
        Command::GetStats { id } => {
            let stats = manager
                .bytes_read(id)
                .and_then(|bytes_read| Ok((bytes_read, manager.bytes_written(id)?)));
            return Some(match stats {
                Ok((bytes_read, bytes_written)) => Record::Stats {
                    id,
                    bytes_read,
                    bytes_written,
                },
                Err(e) => failure(Some(id), Some(op), &e),
            });
        }
        Command::StartTls { id, tls } => manager.start_tls(id, &tls),
        Command::End { id } => manager.end(id),
        Command::Destroy { id } => manager.destroy(id),
        Command::Close { id } => manager.close(id),
        Command::SetNoDelay { id, enable } => manager.set_no_delay(id, enable),
        Command::SetKeepAlive {
            id,
            enable,
            initial_delay,
        } => manager.set_keep_alive(id, enable, initial_delay),
        Command::Pause { id } => manager.pause(id),
        Command::Resume { id } => manager.resume(id),
    };

    match result {
        Ok(()) => None,
        Err(e) => {
            component_warn!("bridge", "{} on socket {} failed: {}", op, id, e);
            Some(failure(Some(id), Some(op), &e))
        }
    }
}

/// Parse and run one input line
pub fn handle_line(manager: &SessionManager, line: &str) -> Option<Record> {
    match serde_json::from_str::<Command>(line) {
        Ok(command) => execute(manager, command),
        Err(e) => Some(failure(
            None,
            None,
            &SocketError::BadParam(format!("invalid command: {}", e)),
        )),
    }
}

async fn write_record<W>(output: &mut W, record: &Record) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');
    output.write_all(&line).await?;
    output.flush().await?;
    Ok(())
}

/// Pump commands from `input` and events to `output` until input ends
///
/// Remaining sockets are destroyed once input is exhausted.
pub async fn run<R, W>(
    manager: SessionManager,
    mut events: mpsc::UnboundedReceiver<SocketEvent>,
    input: R,
    mut output: W,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    component_info!("bridge", "Bridge ready");
    let mut lines = input.lines();

    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => {
                    if let Some(record) = handle_line(&manager, &line) {
                        write_record(&mut output, &record).await?;
                    }
                }
                None => break,
            },
            Some(event) = events.recv() => {
                write_record(&mut output, &Record::from(event)).await?;
            }
        }
    }

    component_info!("bridge", "Input closed, destroying {} sockets", manager.connection_count());
    manager.shutdown();
    while let Ok(Some(event)) = tokio::time::timeout(DRAIN_PERIOD, events.recv()).await {
        write_record(&mut output, &Record::from(event)).await?;
    }
    Ok(())
}
