//! Immutable state handed to the UI.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use skynet_shared::{ConversationId, Participant, ParticipantId};
use skynet_store::Conversation;

/// Everything a UI needs to render, taken atomically after a change.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    /// Most recently updated first.
    pub conversations: Vec<Conversation>,
    /// Live peer table, ordered by id.
    pub peers: Vec<Participant>,
    pub local: Option<Participant>,
    pub taken_at: DateTime<Utc>,
    /// Liveness threshold the peer list was evaluated with.
    pub online_threshold_secs: u64,
}

impl Snapshot {
    pub fn conversation(&self, id: &ConversationId) -> Option<&Conversation> {
        self.conversations.iter().find(|c| &c.id == id)
    }

    pub fn peer(&self, id: &ParticipantId) -> Option<&Participant> {
        self.peers.iter().find(|p| &p.id == id)
    }

    pub fn online_peers(&self) -> impl Iterator<Item = &Participant> {
        let threshold = Duration::seconds(i64::try_from(self.online_threshold_secs).unwrap_or(i64::MAX));
        self.peers
            .iter()
            .filter(move |p| p.is_online_within(self.taken_at, threshold))
    }

    pub fn unread_count(&self) -> usize {
        self.conversations.iter().filter(|c| !c.is_read).count()
    }

    /// JSON for IPC bridges.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_online_peers_and_unread() {
        let now = Utc::now();
        let mut fresh = Participant::new(ParticipantId::new("fresh"));
        fresh.last_seen = Some(now - Duration::seconds(10));
        let mut silent = Participant::new(ParticipantId::new("silent"));
        silent.last_seen = Some(now - Duration::seconds(400));

        let mut unread = Conversation::new(ConversationId::new(), vec![], false, now);
        unread.is_read = false;

        let snapshot = Snapshot {
            conversations: vec![unread, Conversation::new(ConversationId::new(), vec![], true, now)],
            peers: vec![fresh, silent],
            local: None,
            taken_at: now,
            online_threshold_secs: 300,
        };

        let online: Vec<&str> = snapshot.online_peers().map(|p| p.id.as_str()).collect();
        assert_eq!(online, vec!["fresh"]);
        assert_eq!(snapshot.unread_count(), 1);
    }

    #[test]
    fn test_to_json() {
        let snapshot = Snapshot {
            peers: vec![Participant::new(ParticipantId::new("A1-host"))],
            ..Snapshot::default()
        };
        let json: serde_json::Value = serde_json::from_str(&snapshot.to_json().unwrap()).unwrap();
        assert_eq!(json["peers"][0]["id"], "A1-host");
        assert!(json["conversations"].as_array().unwrap().is_empty());
    }
}
