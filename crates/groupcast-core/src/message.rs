//! The envelope a message travels in between a sender's pump and its group.

use crate::id::{MemberKey, MemberTag};
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// A unique message identifier.
pub type MessageId = u64;

/// Atomic counter for ensuring unique IDs even within the same nanosecond.
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a unique message ID.
#[must_use]
pub fn generate_message_id() -> MessageId {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    timestamp.wrapping_add(counter)
}

/// A message tagged with its sender.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Unique message identifier.
    pub id: MessageId,
    /// The member that sent it.
    pub origin: MemberKey,
    /// The sender's display tag.
    pub sender: MemberTag,
    /// Raw payload as read from the transport.
    pub body: Bytes,
}

impl Envelope {
    /// Create a new envelope.
    #[must_use]
    pub fn new(origin: MemberKey, sender: MemberTag, body: impl Into<Bytes>) -> Self {
        Self {
            id: generate_message_id(),
            origin,
            sender,
            body: body.into(),
        }
    }

    /// Render the text frame delivered to recipients: `"<tag> - <body>"`.
    #[must_use]
    pub fn to_text(&self) -> String {
        format!("{} - {}", self.sender, String::from_utf8_lossy(&self.body))
    }

    /// Get the payload size in bytes.
    #[must_use]
    pub fn body_size(&self) -> usize {
        self.body.len()
    }
}
