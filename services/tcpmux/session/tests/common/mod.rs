//! Helpers shared by the integration tests.

#![allow(dead_code)]

use std::time::Duration;
use tcpmux_session::{SocketEvent, SocketId};
use tokio::sync::mpsc;
use tokio::time::Instant;

pub const WAIT: Duration = Duration::from_secs(10);

pub const CA_PEM: &str = include_str!("../fixtures/ca.pem");
pub const SERVER_CERT_PEM: &str = include_str!("../fixtures/server.pem");
pub const SERVER_KEY_PEM: &str = include_str!("../fixtures/server.key");

/// Records every event so tests can wait for one and inspect the rest later
pub struct Events {
    rx: mpsc::UnboundedReceiver<SocketEvent>,
    pub seen: Vec<SocketEvent>,
}

impl Events {
    pub fn new(rx: mpsc::UnboundedReceiver<SocketEvent>) -> Self {
        Self {
            rx,
            seen: Vec::new(),
        }
    }

    async fn pull(&mut self, deadline: Instant, what: &str) -> SocketEvent {
        match tokio::time::timeout_at(deadline, self.rx.recv()).await {
            Ok(Some(event)) => {
                self.seen.push(event.clone());
                event
            }
            Ok(None) => panic!("event channel closed while waiting for {}", what),
            Err(_) => panic!("timed out waiting for {}; seen {:#?}", what, self.seen),
        }
    }

    /// First event (already seen or upcoming) matching `matches`
    pub async fn wait_for<F>(&mut self, what: &str, matches: F) -> SocketEvent
    where
        F: Fn(&SocketEvent) -> bool,
    {
        if let Some(event) = self.seen.iter().find(|event| matches(event)) {
            return event.clone();
        }
        let deadline = Instant::now() + WAIT;
        loop {
            let event = self.pull(deadline, what).await;
            if matches(&event) {
                return event;
            }
        }
    }

    /// Wait until `id` has received at least `len` bytes; returns them all
    pub async fn wait_data(&mut self, id: SocketId, len: usize) -> Vec<u8> {
        let deadline = Instant::now() + WAIT;
        loop {
            let data = self.data_for(id);
            if data.len() >= len {
                return data;
            }
            self.pull(deadline, &format!("{} bytes on socket {}", len, id))
                .await;
        }
    }

    /// Wait until `id` has received at least `len` bytes, without keeping a copy
    pub async fn wait_byte_count(&mut self, id: SocketId, len: usize) -> usize {
        let deadline = Instant::now() + WAIT;
        let mut total = self.byte_count(id);
        while total < len {
            let event = self
                .pull(deadline, &format!("{} bytes on socket {} (have {})", len, id, total))
                .await;
            if let SocketEvent::Data { id: data_id, data } = &event {
                if *data_id == id {
                    total += data.len();
                }
            }
        }
        total
    }

    pub fn byte_count(&self, id: SocketId) -> usize {
        self.seen
            .iter()
            .map(|event| match event {
                SocketEvent::Data { id: data_id, data } if *data_id == id => data.len(),
                _ => 0,
            })
            .sum()
    }

    /// Message ids that ended in `Written` or `Error` on `id`, in event order
    pub fn resolved(&self, id: SocketId) -> Vec<(u64, bool)> {
        self.seen
            .iter()
            .filter_map(|event| match event {
                SocketEvent::Written { id: written_id, msg_id } if *written_id == id => {
                    Some((*msg_id, true))
                }
                SocketEvent::Error { id: error_id, error } if *error_id == id => {
                    error.msg_id().map(|msg_id| (msg_id, false))
                }
                _ => None,
            })
            .collect()
    }

    /// Collect whatever arrives during `period`
    pub async fn settle(&mut self, period: Duration) {
        let deadline = Instant::now() + period;
        while let Ok(Some(event)) = tokio::time::timeout_at(deadline, self.rx.recv()).await {
            self.seen.push(event);
        }
    }

    pub fn data_for(&self, id: SocketId) -> Vec<u8> {
        self.seen
            .iter()
            .filter_map(|event| match event {
                SocketEvent::Data { id: data_id, data } if *data_id == id => Some(data.to_vec()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn count<F>(&self, matches: F) -> usize
    where
        F: Fn(&SocketEvent) -> bool,
    {
        self.seen.iter().filter(|event| matches(event)).count()
    }

    pub fn closes(&self, id: SocketId) -> usize {
        self.count(|event| matches!(event, SocketEvent::Close { id: close_id, .. } if *close_id == id))
    }

    /// Nothing was delivered for `id` after its close
    pub fn assert_close_is_last(&self, id: SocketId) {
        let for_id: Vec<&SocketEvent> = self.seen.iter().filter(|event| event.id() == id).collect();
        let position = for_id
            .iter()
            .position(|event| matches!(event, SocketEvent::Close { .. }))
            .unwrap_or_else(|| panic!("socket {} never closed", id));
        assert_eq!(
            position,
            for_id.len() - 1,
            "events after close on socket {}: {:#?}",
            id,
            &for_id[position..]
        );
    }
}

pub fn is_listening(id: SocketId) -> impl Fn(&SocketEvent) -> bool {
    move |event| matches!(event, SocketEvent::Listening { id: listen_id, .. } if *listen_id == id)
}

pub fn is_connect(id: SocketId) -> impl Fn(&SocketEvent) -> bool {
    move |event| matches!(event, SocketEvent::Connect { id: connect_id, .. } if *connect_id == id)
}

pub fn is_connection(parent: SocketId) -> impl Fn(&SocketEvent) -> bool {
    move |event| matches!(event, SocketEvent::Connection { id, .. } if *id == parent)
}

pub fn is_written(id: SocketId, msg_id: u64) -> impl Fn(&SocketEvent) -> bool {
    move |event| {
        matches!(event, SocketEvent::Written { id: written_id, msg_id: written_msg }
            if *written_id == id && *written_msg == msg_id)
    }
}

pub fn is_close(id: SocketId) -> impl Fn(&SocketEvent) -> bool {
    move |event| matches!(event, SocketEvent::Close { id: close_id, .. } if *close_id == id)
}

pub fn listening_port(event: &SocketEvent) -> u16 {
    match event {
        SocketEvent::Listening { address, .. } => address.port,
        other => panic!("expected listening, got {:?}", other),
    }
}

pub fn child_id(event: &SocketEvent) -> SocketId {
    match event {
        SocketEvent::Connection { child_id, .. } | SocketEvent::SecureConnection { child_id, .. } => *child_id,
        other => panic!("expected an accepted connection, got {:?}", other),
    }
}
