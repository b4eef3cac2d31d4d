/// Session events and user-facing notifications
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;

use crate::{ConnectionState, MessageType, Operation, PeerId, Resolution};

/// Published to session subscribers; dropping the receiver unsubscribes
#[derive(Debug, Clone)]
pub enum SessionEvent {
    ConnectionChanged(ConnectionState),

    /// Number of other peers currently in the roster
    PeerCountChanged(usize),

    /// A non-operation message arrived
    MessageReceived {
        message_type: MessageType,
        author: PeerId,
        payload: Value,
    },

    /// A remote operation reached the document
    OperationApplied {
        operation: Operation,
        resolution: Resolution,
    },

    Notification(Notification),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Info,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    pub level: NotificationLevel,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(level: NotificationLevel, message: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            level,
            message: message.into(),
            created_at,
        }
    }
}

/// Bounded, expiring list of notifications, newest last
#[derive(Debug, Clone)]
pub struct NotificationLog {
    entries: VecDeque<Notification>,
    capacity: usize,
}

impl NotificationLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, notification: Notification) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(notification);
    }

    /// Drop notifications older than `ttl`, returning how many went
    pub fn expire(&mut self, now: DateTime<Utc>, ttl: Duration) -> usize {
        let before = self.entries.len();
        self.entries.retain(|n| now - n.created_at <= ttl);
        before - self.entries.len()
    }

    pub fn list(&self) -> Vec<Notification> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_bounded() {
        let now = Utc::now();
        let mut log = NotificationLog::new(2);
        for n in 0..3 {
            log.push(Notification::new(NotificationLevel::Info, format!("n{}", n), now));
        }

        let messages: Vec<_> = log.list().into_iter().map(|n| n.message).collect();
        assert_eq!(messages, vec!["n1", "n2"]);
    }

    #[test]
    fn test_log_expiry() {
        let now = Utc::now();
        let mut log = NotificationLog::new(10);
        log.push(Notification::new(NotificationLevel::Info, "old", now - Duration::minutes(10)));
        log.push(Notification::new(NotificationLevel::Warning, "fresh", now));

        assert_eq!(log.expire(now, Duration::minutes(5)), 1);
        assert_eq!(log.list()[0].message, "fresh");
    }
}
