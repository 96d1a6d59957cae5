//! Echo server built on the session manager.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::Path;
use tcpmux_session::{ListenOptions, SessionManager, SocketEvent, SocketId, TlsServerOptions};
use tokio::sync::mpsc;

use crate::{component_debug, component_error, component_info, component_warn};

const LISTENER_ID: SocketId = 1;

/// Load a PEM certificate and key for a TLS listener
pub fn load_server_tls(cert: &Path, key: &Path) -> Result<TlsServerOptions> {
    Ok(TlsServerOptions {
        cert: std::fs::read_to_string(cert)
            .with_context(|| format!("Failed to read certificate {:?}", cert))?,
        key: std::fs::read_to_string(key)
            .with_context(|| format!("Failed to read private key {:?}", key))?,
        ca: None,
    })
}

/// Echo everything received back to the sender until ctrl-c
pub async fn run(
    manager: SessionManager,
    mut events: mpsc::UnboundedReceiver<SocketEvent>,
    listen: SocketAddr,
    tls: Option<TlsServerOptions>,
) -> Result<()> {
    let options = ListenOptions {
        tls,
        ..ListenOptions::new(listen.ip().to_string(), listen.port())
    };
    manager
        .listen(LISTENER_ID, options)
        .context("Failed to start listener")?;

    let mut next_msg_id: u64 = 0;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                component_info!("echo", "Interrupted, shutting down");
                break;
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    SocketEvent::Listening { address, .. } => {
                        component_info!("echo", "Echo server listening on {}:{}", address.address, address.port);
                    }
                    SocketEvent::Connection { child_id, connection, .. }
                    | SocketEvent::SecureConnection { child_id, connection, .. } => {
                        component_info!(
                            "echo",
                            "Socket {} connected from {}:{}",
                            child_id,
                            connection.remote_address,
                            connection.remote_port
                        );
                    }
                    SocketEvent::Data { id, data } => {
                        next_msg_id += 1;
                        if let Err(e) = manager.send(id, data, next_msg_id) {
                            component_warn!("echo", "Failed to echo on socket {}: {}", id, e);
                        }
                    }
                    SocketEvent::Error { id, error } if id == LISTENER_ID => {
                        component_error!("echo", "Listener failed: {}", error);
                        manager.shutdown();
                        anyhow::bail!("Listener failed: {}", error);
                    }
                    SocketEvent::Error { id, error } => {
                        component_warn!("echo", "Socket {} error: {}", id, error);
                    }
                    SocketEvent::Close { id, .. } => {
                        component_debug!("echo", "Socket {} closed", id);
                    }
                    _ => {}
                }
            }
        }
    }

    manager.shutdown();
    Ok(())
}
