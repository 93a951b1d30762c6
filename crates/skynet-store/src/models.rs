//! Domain model held in memory and handed to the UI layer.
//!
//! Every struct derives `Serialize` and `Deserialize` so snapshots can be
//! passed directly over IPC.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use skynet_shared::{ConversationId, MessageId, Participant, ParticipantId};

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// Delivery state of a message, rendered by the UI next to the bubble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryStatus {
    /// Local echo, not yet handed to the network.
    Pending,
    /// Handed to the network (best-effort topics).
    Sent,
    /// Acknowledged by at least one group member.
    Delivered,
    /// Transport failed or no ack arrived within the retry budget.
    NotDelivered,
    /// Inbound message from a peer.
    Received,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub author: Participant,
    pub attachments: Vec<Attachment>,
    pub reactions: Vec<Reaction>,
    pub delivery: DeliveryStatus,
}

impl Message {
    pub fn new(
        id: MessageId,
        text: impl Into<String>,
        created_at: DateTime<Utc>,
        author: Participant,
        delivery: DeliveryStatus,
    ) -> Self {
        Self {
            id,
            text: text.into(),
            created_at,
            updated_at: created_at,
            author,
            attachments: Vec::new(),
            reactions: Vec::new(),
            delivery,
        }
    }

    /// `(author, id)`: the key duplicates are detected by.
    pub fn dedup_key(&self) -> (ParticipantId, MessageId) {
        (self.author.id.clone(), self.id)
    }

    fn order_key(&self) -> (DateTime<Utc>, MessageId) {
        (self.created_at, self.id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attachment {
    pub id: String,
    pub width: u32,
    pub height: u32,
    pub url: String,
    pub file_name: String,
    pub size: u64,
    /// MIME type
    pub kind: String,
    pub thumbnails: Vec<Thumbnail>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Thumbnail {
    pub width: u32,
    pub height: u32,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Reaction {
    pub id: Uuid,
    pub author: ParticipantId,
    pub emoji: String,
    pub created_at: DateTime<Utc>,
}

impl Reaction {
    pub fn new(author: ParticipantId, emoji: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            author,
            emoji: emoji.into(),
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Conversation {
    pub id: ConversationId,
    pub participants: Vec<Participant>,
    /// Ordered by `(created_at, id)`.
    pub messages: Vec<Message>,
    /// Timestamp of the newest message (creation time while empty).
    pub updated_at: DateTime<Utc>,
    pub is_read: bool,
    pub is_pinned: bool,
    /// Selects the transport: group topic when true, direct topic otherwise.
    pub is_group_chat: bool,
    pub title: Option<String>,
    pub profile_image: Option<String>,
}

impl Conversation {
    pub fn new(
        id: ConversationId,
        participants: Vec<Participant>,
        is_group_chat: bool,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            participants,
            messages: Vec::new(),
            updated_at: created_at,
            is_read: true,
            is_pinned: false,
            is_group_chat,
            title: None,
            profile_image: None,
        }
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn message(&self, id: MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub(crate) fn message_mut(&mut self, id: MessageId) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| m.id == id)
    }

    pub fn has_participant(&self, id: &ParticipantId) -> bool {
        self.participants.iter().any(|p| &p.id == id)
    }

    /// Participants other than `local`, e.g. for the conversation title.
    pub fn participants_excluding(&self, local: &ParticipantId) -> Vec<&Participant> {
        self.participants.iter().filter(|p| &p.id != local).collect()
    }

    pub(crate) fn add_participant(&mut self, participant: Participant) {
        if !self.has_participant(&participant.id) {
            self.participants.push(participant);
        }
    }

    /// Insert at the position given by `(created_at, id)` and refresh
    /// `updated_at`. Dedup is the caller's job.
    pub(crate) fn insert_ordered(&mut self, message: Message) {
        let key = message.order_key();
        let pos = self.messages.partition_point(|m| m.order_key() <= key);
        self.messages.insert(pos, message);
        if let Some(last) = self.messages.last() {
            self.updated_at = last.created_at;
        }
    }

    /// Whether ordering and `updated_at` hold. Used by tests and debug checks.
    pub fn invariants_hold(&self) -> bool {
        let ordered = self
            .messages
            .windows(2)
            .all(|w| w[0].order_key() <= w[1].order_key());
        let updated = self
            .messages
            .last()
            .map_or(true, |m| m.created_at == self.updated_at);
        ordered && updated
    }
}
