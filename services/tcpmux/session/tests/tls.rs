//! TLS listeners, TLS clients, and in-place upgrades.

mod common;

use common::*;
use std::time::Duration;
use tcpmux_session::{
    ConnectOptions, ConnectionState, ListenOptions, ManagerConfig, SessionManager, SocketError,
    SocketEvent, TlsOptions, TlsServerOptions, TlsState,
};

fn manager() -> (SessionManager, Events) {
    let (manager, rx) = SessionManager::channel(ManagerConfig::default());
    (manager, Events::new(rx))
}

fn server_tls() -> TlsServerOptions {
    TlsServerOptions {
        cert: SERVER_CERT_PEM.to_string(),
        key: SERVER_KEY_PEM.to_string(),
        ca: None,
    }
}

fn verified_client() -> TlsOptions {
    TlsOptions {
        ca: Some(CA_PEM.to_string()),
        server_name: Some("localhost".to_string()),
        ..TlsOptions::default()
    }
}

fn is_secure_connection(parent: u32) -> impl Fn(&SocketEvent) -> bool {
    move |event| matches!(event, SocketEvent::SecureConnection { id, .. } if *id == parent)
}

fn is_secure_connect(id: u32) -> impl Fn(&SocketEvent) -> bool {
    move |event| matches!(event, SocketEvent::SecureConnect { id: secure_id } if *secure_id == id)
}

#[tokio::test]
async fn test_tls_listener_with_verified_client() {
    let (manager, mut events) = manager();

    let options = ListenOptions {
        tls: Some(server_tls()),
        ..ListenOptions::new("127.0.0.1", 0)
    };
    manager.listen(1, options).unwrap();
    let port = listening_port(&events.wait_for("listening", is_listening(1)).await);

    manager
        .connect(10, "127.0.0.1", port, ConnectOptions::default(), Some(verified_client()))
        .unwrap();
    events.wait_for("connect", is_connect(10)).await;
    let child = child_id(&events.wait_for("secure connection", is_secure_connection(1)).await);

    assert_eq!(
        manager.state(10).unwrap(),
        ConnectionState::Connected(TlsState::Secure)
    );
    assert_eq!(
        manager.state(child).unwrap(),
        ConnectionState::Connected(TlsState::Secure)
    );

    let server_cert = manager
        .peer_certificate(10)
        .unwrap()
        .expect("client sees the server certificate");
    assert_eq!(server_cert.to_pem().trim(), SERVER_CERT_PEM.trim());
    assert_eq!(manager.certificate(child).unwrap(), Some(server_cert));
    // No client authentication on this listener
    assert_eq!(manager.certificate(10).unwrap(), None);
    assert_eq!(manager.peer_certificate(child).unwrap(), None);
    assert!(matches!(
        manager.peer_certificate(1),
        Err(SocketError::InvalidInvocation(_))
    ));

    manager.send(10, &b"hello over tls"[..], 1).unwrap();
    assert_eq!(events.wait_data(child, 14).await, b"hello over tls");
    manager.send(child, &b"back"[..], 2).unwrap();
    assert_eq!(events.wait_data(10, 4).await, b"back");

    // TLS children are only announced as secure connections
    assert_eq!(events.count(|event| matches!(event, SocketEvent::Connection { .. })), 0);
    // connect-with-TLS reports a single connect, no separate upgrade event
    assert_eq!(events.count(is_secure_connect(10)), 0);
}

#[tokio::test]
async fn test_start_tls_upgrades_both_sides() {
    let (manager, mut events) = manager();

    manager.listen(1, ListenOptions::new("127.0.0.1", 0)).unwrap();
    let port = listening_port(&events.wait_for("listening", is_listening(1)).await);
    manager
        .connect(10, "127.0.0.1", port, ConnectOptions::default(), None)
        .unwrap();
    events.wait_for("connect", is_connect(10)).await;
    let child = child_id(&events.wait_for("connection", is_connection(1)).await);

    // Plain traffic first
    manager.send(10, &b"STARTTLS"[..], 1).unwrap();
    assert_eq!(events.wait_data(child, 8).await, b"STARTTLS");

    let server_side = TlsOptions {
        cert: Some(SERVER_CERT_PEM.to_string()),
        key: Some(SERVER_KEY_PEM.to_string()),
        ..TlsOptions::default()
    };
    assert_eq!(manager.peer_certificate(10).unwrap(), None);
    manager.start_tls(child, &server_side).unwrap();
    manager.start_tls(10, &verified_client()).unwrap();

    events.wait_for("client upgrade", is_secure_connect(10)).await;
    events.wait_for("child upgrade", is_secure_connect(child)).await;
    assert_eq!(
        manager.state(10).unwrap(),
        ConnectionState::Connected(TlsState::Secure)
    );

    let server_cert = manager.peer_certificate(10).unwrap().unwrap();
    assert_eq!(server_cert.to_pem().trim(), SERVER_CERT_PEM.trim());
    assert_eq!(manager.certificate(child).unwrap(), Some(server_cert));

    manager.send(10, &b"secret"[..], 2).unwrap();
    assert_eq!(events.wait_data(child, 14).await, b"STARTTLSsecret");
    events.wait_for("written 2", is_written(10, 2)).await;
    // Counters cover plain and TLS phases, application bytes only
    assert_eq!(manager.bytes_written(10).unwrap(), 14);
    assert_eq!(manager.bytes_read(child).unwrap(), 14);
    assert!(matches!(
        manager.start_tls(10, &verified_client()),
        Err(SocketError::BadConfig(_))
    ));
}

#[tokio::test]
async fn test_failed_tls_accept_is_silent() {
    let (manager, mut events) = manager();

    let options = ListenOptions {
        tls: Some(server_tls()),
        ..ListenOptions::new("127.0.0.1", 0)
    };
    manager.listen(1, options).unwrap();
    let port = listening_port(&events.wait_for("listening", is_listening(1)).await);

    // A plain client speaking garbage fails the server handshake
    manager
        .connect(10, "127.0.0.1", port, ConnectOptions::default(), None)
        .unwrap();
    events.wait_for("connect", is_connect(10)).await;
    manager.send(10, &b"GET / HTTP/1.1\r\n\r\n"[..], 1).unwrap();
    events.wait_for("client close", is_close(10)).await;
    events.settle(Duration::from_millis(100)).await;

    let from_children = events.count(|event| !matches!(event.id(), 1 | 10));
    assert_eq!(from_children, 0, "child events leaked: {:#?}", events.seen);
    assert_eq!(
        events.count(|event| matches!(event, SocketEvent::SecureConnection { .. })),
        0
    );
    assert_eq!(manager.connection_count(), 1);
}

#[tokio::test]
async fn test_untrusted_server_fails_connect() {
    let (manager, mut events) = manager();

    let options = ListenOptions {
        tls: Some(server_tls()),
        ..ListenOptions::new("127.0.0.1", 0)
    };
    manager.listen(1, options).unwrap();
    let port = listening_port(&events.wait_for("listening", is_listening(1)).await);

    // Trusting the leaf instead of its issuer does not verify
    let wrong_anchor = TlsOptions {
        ca: Some(SERVER_CERT_PEM.to_string()),
        server_name: Some("localhost".to_string()),
        ..TlsOptions::default()
    };
    manager
        .connect(10, "127.0.0.1", port, ConnectOptions::default(), Some(wrong_anchor))
        .unwrap();

    let close = events.wait_for("close", is_close(10)).await;
    assert!(matches!(
        close,
        SocketEvent::Close {
            error: Some(SocketError::Other(_)),
            ..
        }
    ));
    assert_eq!(events.count(is_connect(10)), 0);
    assert_eq!(
        events.count(|event| matches!(event, SocketEvent::Error { id: 10, .. })),
        1
    );
}

#[tokio::test]
async fn test_insecure_client_skips_verification() {
    let (manager, mut events) = manager();

    let options = ListenOptions {
        tls: Some(server_tls()),
        ..ListenOptions::new("127.0.0.1", 0)
    };
    manager.listen(1, options).unwrap();
    let port = listening_port(&events.wait_for("listening", is_listening(1)).await);

    manager
        .connect(10, "127.0.0.1", port, ConnectOptions::default(), Some(TlsOptions::insecure()))
        .unwrap();
    events.wait_for("connect", is_connect(10)).await;
    events
        .wait_for("secure connection", is_secure_connection(1))
        .await;
}

#[tokio::test]
async fn test_tls_options_are_checked_synchronously() {
    let (manager, _events) = manager();

    assert!(matches!(
        manager.connect(10, "127.0.0.1", 443, ConnectOptions::default(), Some(TlsOptions::default())),
        Err(SocketError::BadConfig(_))
    ));
    let half_identity = TlsOptions {
        cert: Some(SERVER_CERT_PEM.to_string()),
        ..TlsOptions::insecure()
    };
    assert!(matches!(
        manager.connect(10, "127.0.0.1", 443, ConnectOptions::default(), Some(half_identity)),
        Err(SocketError::BadConfig(_))
    ));
    let broken_server = ListenOptions {
        tls: Some(TlsServerOptions {
            cert: "garbage".to_string(),
            key: SERVER_KEY_PEM.to_string(),
            ca: None,
        }),
        ..ListenOptions::new("127.0.0.1", 0)
    };
    assert!(matches!(manager.listen(1, broken_server), Err(SocketError::BadConfig(_))));
    assert_eq!(manager.connection_count(), 0);
}
