//! Fan-out of job events to connected real-time clients.
//!
//! The hub owns one bounded channel per connection. The transport layer
//! drains the receiving half into the socket; the hub only ever uses
//! `try_send`, so a stalled client loses frames instead of stalling the
//! engine's output pump or other clients.

use chrono::{DateTime, Utc};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, trace};

use crate::protocol::{ClientId, Ownership, ServerMessage};

/// Frames queued per connection before new ones are dropped
pub const DEFAULT_CLIENT_BUFFER: usize = 256;

/// Frame handed to the transport for one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Ping,
    Close,
}

/// Whether frames may still be delivered to a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Closed,
}

/// A registered client connection
#[derive(Debug)]
pub struct ClientConnection {
    /// Distinguishes successive connections under the same key
    pub connection_id: u64,
    pub sender: mpsc::Sender<Outbound>,
    pub state: ConnectionState,
    pub connected_at: DateTime<Utc>,
}

impl ClientConnection {
    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open && !self.sender.is_closed()
    }

    /// Non-blocking delivery; false when the frame was not queued
    fn deliver(&self, client_id: &str, frame: Outbound) -> bool {
        if !self.is_open() {
            return false;
        }
        match self.sender.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("Client {} is not keeping up, dropping frame", client_id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                trace!("Client {} closed, skipping", client_id);
                false
            }
        }
    }
}

/// Registry of live client connections plus the broadcast logic
#[derive(Debug)]
pub struct ClientHub {
    connections: RwLock<HashMap<ClientId, ClientConnection>>,
    buffer: usize,
    next_connection_id: AtomicU64,
}

impl ClientHub {
    pub fn new() -> Self {
        Self::with_buffer(DEFAULT_CLIENT_BUFFER)
    }

    pub fn with_buffer(buffer: usize) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            buffer: buffer.max(1),
            next_connection_id: AtomicU64::new(1),
        }
    }

    fn open_connection(&self) -> (ClientConnection, mpsc::Receiver<Outbound>) {
        let (sender, receiver) = mpsc::channel(self.buffer);
        let conn = ClientConnection {
            connection_id: self.next_connection_id.fetch_add(1, Ordering::Relaxed),
            sender,
            state: ConnectionState::Open,
            connected_at: Utc::now(),
        };
        (conn, receiver)
    }

    /// Register a connection and get the receiver the transport drains
    ///
    /// Replaces any connection already held under the key.
    pub async fn register(&self, client_id: impl Into<ClientId>) -> mpsc::Receiver<Outbound> {
        let (conn, receiver) = self.open_connection();
        self.connections.write().await.insert(client_id.into(), conn);
        receiver
    }

    /// Claim a key unless an open connection already holds it
    ///
    /// Returns the connection id to hand back to
    /// [`ClientHub::unregister_connection`].
    pub async fn register_if_absent(
        &self,
        client_id: impl Into<ClientId>,
    ) -> Option<(u64, mpsc::Receiver<Outbound>)> {
        let mut conns = self.connections.write().await;
        let entry = conns.entry(client_id.into());
        if let Entry::Occupied(ref held) = entry {
            if held.get().is_open() {
                return None;
            }
        }

        let (conn, receiver) = self.open_connection();
        let connection_id = conn.connection_id;
        match entry {
            Entry::Occupied(mut stale) => {
                stale.insert(conn);
            }
            Entry::Vacant(free) => {
                free.insert(conn);
            }
        }
        Some((connection_id, receiver))
    }

    /// Remove a connection only if the key still belongs to it
    pub async fn unregister_connection(&self, client_id: &str, connection_id: u64) -> bool {
        let mut conns = self.connections.write().await;
        match conns.get(client_id) {
            Some(conn) if conn.connection_id == connection_id => {
                conns.remove(client_id);
                true
            }
            _ => false,
        }
    }

    pub async fn is_open(&self, client_id: &str) -> bool {
        self.connections
            .read()
            .await
            .get(client_id)
            .map(ClientConnection::is_open)
            .unwrap_or(false)
    }

    /// Send a message to every open connection, tagging ownership per recipient
    ///
    /// Returns the number of connections the frame was queued for. Closed or
    /// saturated connections are skipped silently.
    pub async fn broadcast(&self, owner: &str, message: &ServerMessage) -> usize {
        let (mine, theirs) = match (
            message.clone().with_ownership(Ownership::You).to_json(),
            message.clone().with_ownership(Ownership::Others).to_json(),
        ) {
            (Ok(mine), Ok(theirs)) => (mine, theirs),
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to serialize broadcast: {}", e);
                return 0;
            }
        };

        let conns = self.connections.read().await;
        let mut delivered = 0;
        for (client_id, conn) in conns.iter() {
            let frame = match Ownership::for_recipient(client_id, owner) {
                Ownership::You => mine.clone(),
                Ownership::Others => theirs.clone(),
            };
            if conn.deliver(client_id, Outbound::Text(frame)) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Send the same message to every open connection
    pub async fn notify_all(&self, message: &ServerMessage) -> usize {
        let frame = match message.to_json() {
            Ok(frame) => frame,
            Err(e) => {
                error!("Failed to serialize notification: {}", e);
                return 0;
            }
        };

        let conns = self.connections.read().await;
        conns
            .iter()
            .filter(|(client_id, conn)| conn.deliver(client_id, Outbound::Text(frame.clone())))
            .count()
    }

    /// Send a message to one connection only
    pub async fn send_to(&self, client_id: &str, message: &ServerMessage) -> bool {
        let frame = match message.to_json() {
            Ok(frame) => frame,
            Err(e) => {
                error!("Failed to serialize message for {}: {}", client_id, e);
                return false;
            }
        };

        let conns = self.connections.read().await;
        conns
            .get(client_id)
            .map(|conn| conn.deliver(client_id, Outbound::Text(frame)))
            .unwrap_or(false)
    }

    /// Close a connection from the server side; no further frames are delivered
    pub async fn terminate(&self, client_id: &str) {
        let mut conns = self.connections.write().await;
        if let Some(conn) = conns.get_mut(client_id) {
            let _ = conn.sender.try_send(Outbound::Close);
            conn.state = ConnectionState::Closed;
            info!("Terminated connection of client {}", client_id);
        }
    }

    /// Queue a ping for every open connection
    pub async fn ping_all(&self) {
        let conns = self.connections.read().await;
        for (client_id, conn) in conns.iter() {
            conn.deliver(client_id, Outbound::Ping);
        }
    }

    /// Send a close frame to every connection, then clear the map
    pub async fn shutdown_all(&self) {
        let mut conns = self.connections.write().await;
        let count = conns.len();
        for conn in conns.values() {
            let _ = conn.sender.try_send(Outbound::Close);
        }
        conns.clear();
        info!("Closed {} client connections", count);
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }
}

impl Default for ClientHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ProgressSample, ProgressUpdate};
    use serde_json::Value;

    fn progress() -> ServerMessage {
        let sample = ProgressSample {
            percent_done_as_number: Some(10),
            percent_done: Some("10%".to_string()),
            ..Default::default()
        };
        ServerMessage::progress(ProgressUpdate::new(sample, 1))
    }

    fn text(frame: Outbound) -> Value {
        match frame {
            Outbound::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected text frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_broadcast_tags_ownership() {
        let hub = ClientHub::new();
        let mut owner = hub.register("owner").await;
        let mut other = hub.register("other").await;

        assert_eq!(hub.broadcast("owner", &progress()).await, 2);

        assert_eq!(text(owner.recv().await.unwrap())["ownershipPerson"], "you");
        assert_eq!(text(other.recv().await.unwrap())["ownershipPerson"], "others");
    }

    #[tokio::test]
    async fn test_closed_connection_does_not_block_others() {
        let hub = ClientHub::new();
        let closed = hub.register("gone").await;
        let mut open = hub.register("here").await;
        drop(closed);

        assert_eq!(hub.broadcast("gone", &progress()).await, 1);
        assert_eq!(text(open.recv().await.unwrap())["ownershipPerson"], "others");
    }

    #[tokio::test]
    async fn test_terminated_connection_is_skipped() {
        let hub = ClientHub::new();
        let mut rx = hub.register("a").await;
        hub.terminate("a").await;

        assert_eq!(rx.recv().await, Some(Outbound::Close));
        assert!(!hub.is_open("a").await);
        assert!(!hub.send_to("a", &ServerMessage::starting("x")).await);
        assert_eq!(hub.broadcast("a", &progress()).await, 0);
    }

    #[tokio::test]
    async fn test_stalled_client_drops_frames() {
        let hub = ClientHub::with_buffer(1);
        let _stalled = hub.register("slow").await;
        let mut fast = hub.register("fast").await;

        for _ in 0..3 {
            hub.broadcast("fast", &progress()).await;
            assert!(fast.recv().await.is_some());
        }
    }

    #[tokio::test]
    async fn test_send_to_only_reaches_owner() {
        let hub = ClientHub::new();
        let mut a = hub.register("a").await;
        let mut b = hub.register("b").await;

        assert!(hub.send_to("a", &ServerMessage::error("boom")).await);
        assert_eq!(text(a.recv().await.unwrap())["text"], "boom");
        assert!(b.try_recv().is_err());
        assert!(!hub.send_to("missing", &ServerMessage::error("boom")).await);
    }

    #[tokio::test]
    async fn test_register_if_absent_keeps_live_key() {
        let hub = ClientHub::new();
        let (first, mut first_rx) = hub.register_if_absent("a").await.unwrap();
        assert!(hub.register_if_absent("a").await.is_none());

        assert!(hub.send_to("a", &ServerMessage::error("still mine")).await);
        assert_eq!(text(first_rx.recv().await.unwrap())["text"], "still mine");
        assert!(hub.unregister_connection("a", first).await);
        assert_eq!(hub.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_stale_connection_cannot_unregister_successor() {
        let hub = ClientHub::new();
        let (stale, _stale_rx) = hub.register_if_absent("a").await.unwrap();
        hub.terminate("a").await;

        let (current, _current_rx) = hub.register_if_absent("a").await.unwrap();
        assert_ne!(stale, current);
        assert!(!hub.unregister_connection("a", stale).await);
        assert!(hub.is_open("a").await);
        assert!(hub.unregister_connection("a", current).await);
    }

    #[tokio::test]
    async fn test_concurrent_claims_of_one_key() {
        let hub = std::sync::Arc::new(ClientHub::new());
        let claims: Vec<_> = (0..8)
            .map(|_| {
                let hub = std::sync::Arc::clone(&hub);
                tokio::spawn(async move { hub.register_if_absent("same").await })
            })
            .collect();

        let mut winners = Vec::new();
        for claim in claims {
            if let Some(won) = claim.await.unwrap() {
                winners.push(won);
            }
        }
        assert_eq!(winners.len(), 1);
        assert_eq!(hub.connection_count().await, 1);
    }

    #[tokio::test]
    async fn test_notify_all_and_shutdown() {
        let hub = ClientHub::new();
        let mut a = hub.register("a").await;
        let mut b = hub.register("b").await;

        assert_eq!(hub.notify_all(&ServerMessage::language_update("translating")).await, 2);
        assert_eq!(text(a.recv().await.unwrap())["message"], "languageUpdate");
        assert_eq!(text(b.recv().await.unwrap())["message"], "languageUpdate");

        hub.shutdown_all().await;
        assert_eq!(hub.connection_count().await, 0);
        assert_eq!(a.recv().await, Some(Outbound::Close));
    }
}
