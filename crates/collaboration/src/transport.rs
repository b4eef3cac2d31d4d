/// Transport boundary plus an in-process hub
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{CollaborationError, PeerId, Result, WireMessage};

/// Recipients of an outgoing message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerSet {
    /// Everyone in the room except the sender
    All,
    Only(Vec<PeerId>),
}

impl PeerSet {
    pub fn includes(&self, peer: &PeerId) -> bool {
        match self {
            PeerSet::All => true,
            PeerSet::Only(peers) => peers.contains(peer),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

/// Outgoing half of a room connection
///
/// Sending is fire-and-forget; delivery happens through the inbound
/// channel handed to the session loop. An error means the message did not
/// leave this peer and may be retried.
pub trait Transport: Send + Sync {
    fn send(&self, peers: &PeerSet, message: &WireMessage) -> Result<()>;

    fn is_connected(&self) -> bool;
}

type Tx = mpsc::UnboundedSender<WireMessage>;

#[derive(Debug)]
struct HubPeer {
    tx: Tx,
    connected: bool,
}

/// In-process message hub connecting peers in one room
///
/// Used by the simulator and tests in place of a relay server.
#[derive(Debug, Clone, Default)]
pub struct LocalHub {
    peers: Arc<RwLock<HashMap<PeerId, HubPeer>>>,
}

impl LocalHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer, returning its transport and inbound channel
    pub fn join(&self, peer: PeerId) -> (HubTransport, mpsc::UnboundedReceiver<WireMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.peers
            .write()
            .insert(peer.clone(), HubPeer { tx, connected: true });
        debug!(peer = %peer, "Peer joined hub");

        (
            HubTransport {
                hub: self.clone(),
                peer,
            },
            rx,
        )
    }

    /// Remove a peer; its inbound channel closes
    pub fn leave(&self, peer: &PeerId) {
        if self.peers.write().remove(peer).is_some() {
            debug!(peer = %peer, "Peer left hub");
        }
    }

    /// Take a peer offline or bring it back
    pub fn set_connected(&self, peer: &PeerId, connected: bool) {
        if let Some(entry) = self.peers.write().get_mut(peer) {
            entry.connected = connected;
        }
    }

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.peers
            .read()
            .get(peer)
            .map(|entry| entry.connected)
            .unwrap_or(false)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    fn broadcast(&self, from: &PeerId, peers: &PeerSet, message: &WireMessage) -> Result<()> {
        let hub = self.peers.read();

        match hub.get(from) {
            Some(sender) if sender.connected => {}
            _ => {
                return Err(CollaborationError::NetworkError(format!(
                    "{} is not connected",
                    from
                )))
            }
        }

        for (peer, entry) in hub.iter() {
            if peer == from || !entry.connected || !peers.includes(peer) {
                continue;
            }
            if entry.tx.send(message.clone()).is_err() {
                warn!(peer = %peer, "Inbound channel closed, message not delivered");
            }
        }

        Ok(())
    }
}

/// A peer's handle on a `LocalHub`
#[derive(Debug, Clone)]
pub struct HubTransport {
    hub: LocalHub,
    peer: PeerId,
}

impl HubTransport {
    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn hub(&self) -> &LocalHub {
        &self.hub
    }
}

impl Transport for HubTransport {
    fn send(&self, peers: &PeerSet, message: &WireMessage) -> Result<()> {
        self.hub.broadcast(&self.peer, peers, message)
    }

    fn is_connected(&self) -> bool {
        self.hub.is_connected(&self.peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MessageType;
    use chrono::Utc;

    fn hello(from: &str) -> WireMessage {
        WireMessage::presence(MessageType::UserJoined, PeerId::from(from), Utc::now())
    }

    #[test]
    fn test_broadcast_excludes_sender() {
        let hub = LocalHub::new();
        let (alice, mut alice_rx) = hub.join(PeerId::from("alice"));
        let (_bob, mut bob_rx) = hub.join(PeerId::from("bob"));

        alice.send(&PeerSet::All, &hello("alice")).unwrap();

        assert_eq!(bob_rx.try_recv().unwrap().author, PeerId::from("alice"));
        assert!(alice_rx.try_recv().is_err());
    }

    #[test]
    fn test_offline_send_fails() {
        let hub = LocalHub::new();
        let (alice, _alice_rx) = hub.join(PeerId::from("alice"));
        let (_bob, mut bob_rx) = hub.join(PeerId::from("bob"));

        hub.set_connected(&PeerId::from("alice"), false);
        assert!(!alice.is_connected());
        let err = alice.send(&PeerSet::All, &hello("alice")).unwrap_err();
        assert!(matches!(err, CollaborationError::NetworkError(_)));
        assert!(bob_rx.try_recv().is_err());

        hub.set_connected(&PeerId::from("alice"), true);
        alice.send(&PeerSet::All, &hello("alice")).unwrap();
        assert!(bob_rx.try_recv().is_ok());
    }

    #[test]
    fn test_targeted_send() {
        let hub = LocalHub::new();
        let (alice, _alice_rx) = hub.join(PeerId::from("alice"));
        let (_bob, mut bob_rx) = hub.join(PeerId::from("bob"));
        let (_carol, mut carol_rx) = hub.join(PeerId::from("carol"));

        alice
            .send(&PeerSet::Only(vec![PeerId::from("carol")]), &hello("alice"))
            .unwrap();

        assert!(bob_rx.try_recv().is_err());
        assert!(carol_rx.try_recv().is_ok());
    }

    #[test]
    fn test_leave_closes_channel() {
        let hub = LocalHub::new();
        let (_alice, mut alice_rx) = hub.join(PeerId::from("alice"));
        assert_eq!(hub.peer_count(), 1);

        hub.leave(&PeerId::from("alice"));
        assert_eq!(hub.peer_count(), 0);
        assert!(matches!(
            alice_rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }
}
