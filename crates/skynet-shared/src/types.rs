use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::{KDF_CONTEXT_DIRECT_CONVERSATION, ONLINE_THRESHOLD_SECS};
use crate::topic::Topic;

/// Stable participant identity: `<vendor id>-<hostname>`, unique per device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParticipantId(pub String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Caller-generated, globally unique message identifier.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConversationId(pub String);

impl ConversationId {
    /// Fresh random id, used when creating a group conversation.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Deterministic id of the one-to-one conversation between two participants.
    ///
    /// Both ends derive the same value regardless of argument order, so a
    /// direct chat needs no negotiation before the first message.
    pub fn direct(a: &ParticipantId, b: &ParticipantId) -> Self {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_DIRECT_CONVERSATION);
        hasher.update(lo.as_str().as_bytes());
        hasher.update(&[0u8]);
        hasher.update(hi.as_str().as_bytes());
        let hash = hasher.finalize();
        Self(format!("dm-{}", hex::encode(&hash.as_bytes()[..16])))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A known peer (or the local user).
///
/// Liveness fields are only ever written by the presence tracker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Participant {
    pub id: ParticipantId,
    pub display_name: Option<String>,
    /// Avatar reference (URL or blob hash), never the image itself
    pub avatar: Option<String>,
    pub last_seen: Option<DateTime<Utc>>,
    pub topics: BTreeSet<Topic>,
}

impl Participant {
    pub fn new(id: ParticipantId) -> Self {
        Self {
            id,
            display_name: None,
            avatar: None,
            last_seen: None,
            topics: BTreeSet::new(),
        }
    }

    pub fn with_display_name(mut self, name: Option<String>) -> Self {
        self.display_name = name;
        self
    }

    /// Online iff the last announcement is younger than `threshold`.
    pub fn is_online_within(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        match self.last_seen {
            Some(seen) => now.signed_duration_since(seen) < threshold,
            None => false,
        }
    }

    pub fn is_online(&self, now: DateTime<Utc>) -> bool {
        self.is_online_within(now, Duration::seconds(ONLINE_THRESHOLD_SECS as i64))
    }

    /// Display name, falling back to the participant id.
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(self.id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_conversation_id_is_symmetric() {
        let alice = ParticipantId::new("A1B2-alice.local");
        let bob = ParticipantId::new("C3D4-bob.local");

        let ab = ConversationId::direct(&alice, &bob);
        let ba = ConversationId::direct(&bob, &alice);
        assert_eq!(ab, ba);
        assert!(ab.as_str().starts_with("dm-"));
        assert_eq!(ab.as_str().len(), 3 + 32);
    }

    #[test]
    fn test_direct_conversation_id_differs_per_pair() {
        let alice = ParticipantId::new("alice");
        let bob = ParticipantId::new("bob");
        let carol = ParticipantId::new("carol");

        assert_ne!(
            ConversationId::direct(&alice, &bob),
            ConversationId::direct(&alice, &carol)
        );
    }

    #[test]
    fn test_direct_conversation_id_not_ambiguous_on_concatenation() {
        let a = ConversationId::direct(&ParticipantId::new("ab"), &ParticipantId::new("c"));
        let b = ConversationId::direct(&ParticipantId::new("a"), &ParticipantId::new("bc"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_participant_online_threshold() {
        let now = Utc::now();
        let mut p = Participant::new(ParticipantId::new("peer"));
        assert!(!p.is_online(now));

        p.last_seen = Some(now - Duration::seconds(299));
        assert!(p.is_online(now));

        p.last_seen = Some(now - Duration::seconds(300));
        assert!(!p.is_online(now));
    }

    #[test]
    fn test_participant_label() {
        let p = Participant::new(ParticipantId::new("vendor-host"));
        assert_eq!(p.label(), "vendor-host");
        let p = p.with_display_name(Some("Ihor".into()));
        assert_eq!(p.label(), "Ihor");
    }
}
