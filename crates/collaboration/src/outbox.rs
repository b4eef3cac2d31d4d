/// Offline outbox
/// Queue messages that could not be sent and replay them on reconnect
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::Path;
use tokio::fs;

use crate::{CollaborationError, PeerId, Result, WireMessage};

/// Messages waiting for the transport, in send order
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Outbox {
    /// Peer the queued messages belong to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<PeerId>,

    messages: VecDeque<WireMessage>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_peer(peer_id: PeerId) -> Self {
        Self {
            peer_id: Some(peer_id),
            messages: VecDeque::new(),
        }
    }

    /// Add a message to the back of the queue
    pub fn enqueue(&mut self, message: WireMessage) {
        self.messages.push_back(message);
    }

    /// Take every queued message, oldest first
    pub fn drain(&mut self) -> Vec<WireMessage> {
        self.messages.drain(..).collect()
    }

    /// Put unsent messages back at the front, keeping their order
    pub fn requeue_front(&mut self, messages: Vec<WireMessage>) {
        for message in messages.into_iter().rev() {
            self.messages.push_front(message);
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Save the queue as JSON
    pub async fn persist(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).await?;
        Ok(())
    }

    /// Load a saved queue; a missing file yields an empty outbox
    pub async fn restore(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !fs::try_exists(path).await? {
            return Ok(Self::new());
        }

        let json = fs::read_to_string(path).await?;
        serde_json::from_str(&json).map_err(|e| {
            CollaborationError::SerializationError(format!(
                "failed to read outbox {}: {}",
                path.display(),
                e
            ))
        })
    }
}
