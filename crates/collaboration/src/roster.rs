/// Peer presence tracking for a collaboration room
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::PeerId;

/// What we know about another peer in the room
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerPresence {
    pub peer_id: PeerId,
    pub first_seen: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl PeerPresence {
    pub fn new(peer_id: PeerId, now: DateTime<Utc>) -> Self {
        Self {
            peer_id,
            first_seen: now,
            last_activity: now,
        }
    }

    /// Check if the peer has been silent for longer than `idle_after`
    pub fn is_idle(&self, now: DateTime<Utc>, idle_after: Duration) -> bool {
        now - self.last_activity > idle_after
    }
}

/// Other peers seen in the room, keyed by peer id
#[derive(Debug, Clone, Default)]
pub struct PeerRoster {
    peers: HashMap<PeerId, PeerPresence>,
}

impl PeerRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record activity from a peer; returns true if the peer is new
    pub fn touch(&mut self, peer_id: &PeerId, now: DateTime<Utc>) -> bool {
        match self.peers.get_mut(peer_id) {
            Some(presence) => {
                presence.last_activity = now;
                false
            }
            None => {
                self.peers
                    .insert(peer_id.clone(), PeerPresence::new(peer_id.clone(), now));
                true
            }
        }
    }

    pub fn remove(&mut self, peer_id: &PeerId) -> Option<PeerPresence> {
        self.peers.remove(peer_id)
    }

    /// Drop idle peers, returning who was removed
    pub fn prune_idle(&mut self, now: DateTime<Utc>, idle_after: Duration) -> Vec<PeerId> {
        let idle: Vec<PeerId> = self
            .peers
            .values()
            .filter(|presence| presence.is_idle(now, idle_after))
            .map(|presence| presence.peer_id.clone())
            .collect();

        for peer_id in &idle {
            self.peers.remove(peer_id);
        }
        idle
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<&PeerPresence> {
        self.peers.get(peer_id)
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerPresence> {
        self.peers.values()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }
}
