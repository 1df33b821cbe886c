//! Connection registry.
//!
//! Maps a claimant token to at most one live transport: the outbound sender
//! half of that connection's WebSocket writer, plus a per-connection
//! cancellation token. Unlike the allocation state (owned by the admission
//! actor), the registry is mutated concurrently by many connection tasks, so
//! it carries its own lock.
//!
//! Delivery is best-effort everywhere: a claimant that is offline or slow
//! loses messages rather than blocking the pipeline or a broadcast.

use crate::errors::AllocError;
use allocation_protocol::ServerMessage;
use std::collections::HashMap;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Outbound buffer per connection. A full buffer means the client is not
/// draining its socket; further messages to it are dropped.
pub const OUTBOUND_CHANNEL_BUFFER: usize = 64;

struct ConnectionEntry {
    connection_id: Uuid,
    display_name: String,
    sender: mpsc::Sender<ServerMessage>,
    cancel: CancellationToken,
}

/// Registry of live claimant connections.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, ConnectionEntry>>,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transport for a claimant, replacing (and cancelling) any
    /// existing one. A claimant may not hold two live connections; the newer
    /// device wins. Sends `Connected` on the new transport.
    ///
    /// Returns the connection id, which [`disconnect`](Self::disconnect)
    /// uses to disambiguate a close racing a replacement.
    pub async fn connect(
        &self,
        claimant_token: &str,
        display_name: &str,
        sender: mpsc::Sender<ServerMessage>,
        cancel: CancellationToken,
    ) -> Uuid {
        let connection_id = Uuid::new_v4();
        let replaced = {
            let mut connections = self.connections.write().await;
            connections.insert(
                claimant_token.to_string(),
                ConnectionEntry {
                    connection_id,
                    display_name: display_name.to_string(),
                    sender: sender.clone(),
                    cancel,
                },
            )
        };

        if let Some(old) = replaced {
            debug!(
                target: "alloc.registry",
                claimant = %display_name,
                old_connection_id = %old.connection_id,
                "Replacing existing connection"
            );
            old.cancel.cancel();
        }

        metrics::gauge!("alloc_connections").increment(1.0);
        if sender.try_send(ServerMessage::Connected).is_err() {
            warn!(
                target: "alloc.registry",
                claimant = %display_name,
                "New connection closed before Connected ack was delivered"
            );
        }
        connection_id
    }

    /// Remove a claimant's registration. A no-op when no mapping exists or
    /// when the mapping belongs to a newer connection — disconnect races a
    /// replacing connect, and the newer registration must survive.
    pub async fn disconnect(&self, claimant_token: &str, connection_id: Uuid) {
        let mut connections = self.connections.write().await;
        let matches_current = connections
            .get(claimant_token)
            .is_some_and(|entry| entry.connection_id == connection_id);
        if matches_current {
            connections.remove(claimant_token);
            metrics::gauge!("alloc_connections").decrement(1.0);
        }
    }

    /// Send to one claimant. `Err(NotConnected)` when the claimant has no
    /// live transport (or its buffer is full); callers treat this as the
    /// claimant being offline, never as a pipeline fault.
    pub async fn send_to(
        &self,
        claimant_token: &str,
        message: ServerMessage,
    ) -> Result<(), AllocError> {
        let connections = self.connections.read().await;
        let entry = connections
            .get(claimant_token)
            .ok_or(AllocError::NotConnected)?;
        entry
            .sender
            .try_send(message)
            .map_err(|_| AllocError::NotConnected)
    }

    /// Send to every registered connection, skipping failures silently.
    pub async fn broadcast(&self, message: ServerMessage) {
        let connections = self.connections.read().await;
        for entry in connections.values() {
            let _ = entry.sender.try_send(message.clone());
        }
    }

    /// As [`broadcast`](Self::broadcast), but skip one claimant — used so a
    /// successful claimant gets its personalized reply while everyone else
    /// gets the generic unavailability notice.
    pub async fn broadcast_except(&self, excluded_claimant: &str, message: ServerMessage) {
        let connections = self.connections.read().await;
        for (token, entry) in connections.iter() {
            if token != excluded_claimant {
                let _ = entry.sender.try_send(message.clone());
            }
        }
    }

    /// Snapshot of connected claimants as (token, display name) pairs, for
    /// the personalized countdown and start fan-outs.
    pub async fn connected_claimants(&self) -> Vec<(String, String)> {
        let connections = self.connections.read().await;
        connections
            .iter()
            .map(|(token, entry)| (token.clone(), entry.display_name.clone()))
            .collect()
    }

    /// Number of live registrations.
    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn recv(
        rx: &mut mpsc::Receiver<ServerMessage>,
    ) -> ServerMessage {
        timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for message")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn connect_sends_connected_ack() {
        let registry = ConnectionRegistry::new();
        let (tx, mut rx) = mpsc::channel(OUTBOUND_CHANNEL_BUFFER);

        registry
            .connect("tok-x", "Team X", tx, CancellationToken::new())
            .await;

        assert_eq!(recv(&mut rx).await, ServerMessage::Connected);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn second_connect_cancels_the_first_and_leaves_one_registration() {
        let registry = ConnectionRegistry::new();
        let (tx1, mut rx1) = mpsc::channel(OUTBOUND_CHANNEL_BUFFER);
        let (tx2, mut rx2) = mpsc::channel(OUTBOUND_CHANNEL_BUFFER);
        let cancel1 = CancellationToken::new();

        registry
            .connect("tok-x", "Team X", tx1, cancel1.clone())
            .await;
        assert_eq!(recv(&mut rx1).await, ServerMessage::Connected);

        registry
            .connect("tok-x", "Team X", tx2, CancellationToken::new())
            .await;

        assert!(cancel1.is_cancelled(), "first connection must be closed");
        assert_eq!(registry.len().await, 1);
        assert_eq!(recv(&mut rx2).await, ServerMessage::Connected);

        // Unicast now reaches only the second transport.
        registry
            .send_to("tok-x", ServerMessage::InvalidClaimant)
            .await
            .unwrap();
        assert_eq!(recv(&mut rx2).await, ServerMessage::InvalidClaimant);
        assert!(rx1.try_recv().is_err());
    }

    #[tokio::test]
    async fn stale_disconnect_does_not_remove_the_replacement() {
        let registry = ConnectionRegistry::new();
        let (tx1, _rx1) = mpsc::channel(OUTBOUND_CHANNEL_BUFFER);
        let (tx2, _rx2) = mpsc::channel(OUTBOUND_CHANNEL_BUFFER);

        let first_id = registry
            .connect("tok-x", "Team X", tx1, CancellationToken::new())
            .await;
        registry
            .connect("tok-x", "Team X", tx2, CancellationToken::new())
            .await;

        // The first connection's close handler fires after the replacement.
        registry.disconnect("tok-x", first_id).await;
        assert_eq!(registry.len().await, 1, "replacement must survive");
    }

    #[tokio::test]
    async fn disconnect_removes_current_connection() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::channel(OUTBOUND_CHANNEL_BUFFER);

        let id = registry
            .connect("tok-x", "Team X", tx, CancellationToken::new())
            .await;
        registry.disconnect("tok-x", id).await;
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn disconnect_when_absent_is_a_noop() {
        let registry = ConnectionRegistry::new();
        registry.disconnect("tok-x", Uuid::new_v4()).await;
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn send_to_offline_claimant_is_not_connected() {
        let registry = ConnectionRegistry::new();
        let result = registry
            .send_to("tok-x", ServerMessage::Connected)
            .await;
        assert!(matches!(result, Err(AllocError::NotConnected)));
    }

    #[tokio::test]
    async fn broadcast_except_skips_exactly_one_claimant() {
        let registry = ConnectionRegistry::new();
        let (tx_x, mut rx_x) = mpsc::channel(OUTBOUND_CHANNEL_BUFFER);
        let (tx_y, mut rx_y) = mpsc::channel(OUTBOUND_CHANNEL_BUFFER);
        registry
            .connect("tok-x", "Team X", tx_x, CancellationToken::new())
            .await;
        registry
            .connect("tok-y", "Team Y", tx_y, CancellationToken::new())
            .await;
        assert_eq!(recv(&mut rx_x).await, ServerMessage::Connected);
        assert_eq!(recv(&mut rx_y).await, ServerMessage::Connected);

        let notice = ServerMessage::ResourceNowUnavailable {
            resource_id: "a1".to_string(),
        };
        registry.broadcast_except("tok-x", notice.clone()).await;

        assert_eq!(recv(&mut rx_y).await, notice);
        assert!(rx_x.try_recv().is_err(), "excluded claimant gets nothing");
    }

    #[tokio::test]
    async fn broadcast_survives_a_dead_recipient() {
        let registry = ConnectionRegistry::new();
        let (tx_x, rx_x) = mpsc::channel(OUTBOUND_CHANNEL_BUFFER);
        let (tx_y, mut rx_y) = mpsc::channel(OUTBOUND_CHANNEL_BUFFER);
        registry
            .connect("tok-x", "Team X", tx_x, CancellationToken::new())
            .await;
        registry
            .connect("tok-y", "Team Y", tx_y, CancellationToken::new())
            .await;
        drop(rx_x); // X's writer task is gone.
        let _ = recv(&mut rx_y).await; // Connected

        registry.broadcast(ServerMessage::InvalidClaimant).await;
        assert_eq!(recv(&mut rx_y).await, ServerMessage::InvalidClaimant);
    }
}
