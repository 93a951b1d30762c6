//! Peer liveness tracking.
//!
//! Peers announce themselves on the control topic. The tracker keeps one
//! entry per announced participant and moves it through
//! `Discovered -> Online -> Stale` as announcements arrive or stop arriving;
//! once the grace window elapses the entry is evicted (offline).
//!
//! The tracker is plain data: all time is passed in by the caller, which
//! keeps it deterministic and lets the owning actor drive it.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use skynet_shared::constants::{ONLINE_THRESHOLD_SECS, PRESENCE_GRACE_SECS, PRESENCE_SWEEP_SECS};
use skynet_shared::{Announcement, Participant, ParticipantId, Topic};

/// Liveness windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// Online while the last announcement is younger than this.
    pub online_threshold: Duration,
    /// Evicted once the last announcement is older than this.
    pub grace: Duration,
    /// Period of the expiry sweep.
    pub sweep_interval: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            online_threshold: Duration::from_secs(ONLINE_THRESHOLD_SECS),
            grace: Duration::from_secs(PRESENCE_GRACE_SECS),
            sweep_interval: Duration::from_secs(PRESENCE_SWEEP_SECS),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PresenceState {
    Discovered,
    Online,
    Stale,
}

/// What an announcement, departure or sweep did to a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceTransition {
    /// First sighting (or first since eviction).
    Discovered,
    /// Discovered or stale peer announced again.
    CameOnline,
    /// Already online; `last_seen` refreshed.
    Refreshed,
    WentStale,
    /// Grace window elapsed; evicted.
    WentOffline,
    /// Peer announced its departure; evicted.
    Left,
}

#[derive(Debug, Clone)]
struct PeerEntry {
    participant: Participant,
    state: PresenceState,
}

/// The live peer table.
#[derive(Debug, Clone)]
pub struct PresenceTracker {
    local: ParticipantId,
    config: PresenceConfig,
    peers: HashMap<ParticipantId, PeerEntry>,
}

impl PresenceTracker {
    pub fn new(local: ParticipantId, config: PresenceConfig) -> Self {
        let config = PresenceConfig {
            grace: config.grace.max(config.online_threshold),
            ..config
        };
        Self {
            local,
            config,
            peers: HashMap::new(),
        }
    }

    pub fn config(&self) -> &PresenceConfig {
        &self.config
    }

    /// Record an announcement received at `now`.
    ///
    /// Returns `None` for our own announcements looped back by multicast.
    pub fn on_announcement(
        &mut self,
        sender: &ParticipantId,
        announcement: &Announcement,
        now: DateTime<Utc>,
    ) -> Option<PresenceTransition> {
        if sender == &self.local {
            return None;
        }

        let topics = announcement
            .topics
            .iter()
            .filter_map(|id| Topic::from_channel_id(*id).ok())
            .collect();

        let transition = match self.peers.get_mut(sender) {
            None => {
                let mut participant = Participant::new(sender.clone());
                participant.display_name = announcement.display_name.clone();
                participant.avatar = announcement.avatar.clone();
                participant.last_seen = Some(now);
                participant.topics = topics;
                self.peers.insert(
                    sender.clone(),
                    PeerEntry {
                        participant,
                        state: PresenceState::Discovered,
                    },
                );
                info!(peer = %sender, "Peer discovered");
                PresenceTransition::Discovered
            }
            Some(entry) => {
                let p = &mut entry.participant;
                if announcement.display_name.is_some() {
                    p.display_name = announcement.display_name.clone();
                }
                if announcement.avatar.is_some() {
                    p.avatar = announcement.avatar.clone();
                }
                p.last_seen = Some(now);
                p.topics = topics;

                match entry.state {
                    PresenceState::Online => PresenceTransition::Refreshed,
                    PresenceState::Discovered | PresenceState::Stale => {
                        if entry.state == PresenceState::Stale {
                            info!(peer = %sender, "Stale peer back online");
                        }
                        entry.state = PresenceState::Online;
                        PresenceTransition::CameOnline
                    }
                }
            }
        };

        Some(transition)
    }

    /// Evict a peer that announced its departure.
    pub fn on_leave(&mut self, sender: &ParticipantId) -> Option<PresenceTransition> {
        self.peers.remove(sender).map(|_| {
            info!(peer = %sender, "Peer left");
            PresenceTransition::Left
        })
    }

    /// Apply expiry at `now`: mark silent peers stale, evict expired ones.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> Vec<(ParticipantId, PresenceTransition)> {
        let threshold = to_chrono(self.config.online_threshold);
        let grace = to_chrono(self.config.grace);
        let mut changes = Vec::new();

        self.peers.retain(|id, entry| {
            let silent_for = entry
                .participant
                .last_seen
                .map(|seen| now.signed_duration_since(seen))
                .unwrap_or(chrono::Duration::MAX);

            if silent_for >= grace {
                info!(peer = %id, "Peer offline, evicting");
                changes.push((id.clone(), PresenceTransition::WentOffline));
                return false;
            }
            if silent_for >= threshold && entry.state != PresenceState::Stale {
                debug!(peer = %id, silent_secs = silent_for.num_seconds(), "Peer stale");
                entry.state = PresenceState::Stale;
                changes.push((id.clone(), PresenceTransition::WentStale));
            }
            true
        });

        changes.sort_by(|a, b| a.0.cmp(&b.0));
        changes
    }

    pub fn state_of(&self, id: &ParticipantId) -> Option<PresenceState> {
        self.peers.get(id).map(|entry| entry.state)
    }

    pub fn get(&self, id: &ParticipantId) -> Option<&Participant> {
        self.peers.get(id).map(|entry| &entry.participant)
    }

    pub fn contains(&self, id: &ParticipantId) -> bool {
        self.peers.contains_key(id)
    }

    /// Online per the liveness threshold, independent of sweep timing.
    pub fn is_online(&self, id: &ParticipantId, now: DateTime<Utc>) -> bool {
        self.peers.get(id).is_some_and(|entry| {
            entry
                .participant
                .is_online_within(now, to_chrono(self.config.online_threshold))
        })
    }

    /// Snapshot of the peer table, ordered by id.
    pub fn peers(&self) -> Vec<Participant> {
        let mut peers: Vec<Participant> = self
            .peers
            .values()
            .map(|entry| entry.participant.clone())
            .collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }

    pub fn online_peers(&self, now: DateTime<Utc>) -> Vec<Participant> {
        let threshold = to_chrono(self.config.online_threshold);
        self.peers()
            .into_iter()
            .filter(|p| p.is_online_within(now, threshold))
            .collect()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as Secs;

    fn announcement(name: &str) -> Announcement {
        Announcement {
            display_name: Some(name.to_string()),
            avatar: None,
            topics: vec![Topic::Control.channel_id(), Topic::Chat.channel_id(), 999],
        }
    }

    fn tracker() -> PresenceTracker {
        PresenceTracker::new(ParticipantId::new("local"), PresenceConfig::default())
    }

    #[test]
    fn test_discovery_then_online() {
        let mut t = tracker();
        let peer = ParticipantId::new("vendor-john");
        let now = Utc::now();

        assert_eq!(
            t.on_announcement(&peer, &announcement("John"), now),
            Some(PresenceTransition::Discovered)
        );
        assert_eq!(t.state_of(&peer), Some(PresenceState::Discovered));

        let p = t.get(&peer).unwrap();
        assert_eq!(p.display_name.as_deref(), Some("John"));
        assert!(p.topics.contains(&Topic::Chat));
        assert_eq!(p.topics.len(), 2);

        assert_eq!(
            t.on_announcement(&peer, &announcement("John"), now + Secs::seconds(30)),
            Some(PresenceTransition::CameOnline)
        );
        assert_eq!(t.state_of(&peer), Some(PresenceState::Online));
        assert_eq!(
            t.on_announcement(&peer, &announcement("John"), now + Secs::seconds(60)),
            Some(PresenceTransition::Refreshed)
        );
    }

    #[test]
    fn test_own_announcements_ignored() {
        let mut t = tracker();
        let local = ParticipantId::new("local");
        assert_eq!(t.on_announcement(&local, &announcement("me"), Utc::now()), None);
        assert_eq!(t.peer_count(), 0);
    }

    #[test]
    fn test_stale_between_threshold_and_grace() {
        let mut t = tracker();
        let peer = ParticipantId::new("vendor-jane");
        let start = Utc::now();
        t.on_announcement(&peer, &announcement("Jane"), start);

        assert!(t.sweep(start + Secs::seconds(299)).is_empty());
        assert!(t.is_online(&peer, start + Secs::seconds(299)));

        let later = start + Secs::seconds(301);
        assert_eq!(
            t.sweep(later),
            vec![(peer.clone(), PresenceTransition::WentStale)]
        );
        assert!(t.contains(&peer));
        assert!(!t.is_online(&peer, later));
        assert!(!t.get(&peer).unwrap().is_online(later));
        assert!(t.online_peers(later).is_empty());

        // No repeated transition on the next sweep.
        assert!(t.sweep(start + Secs::seconds(400)).is_empty());
    }

    #[test]
    fn test_evicted_after_grace() {
        let mut t = tracker();
        let peer = ParticipantId::new("vendor-alex");
        let start = Utc::now();
        t.on_announcement(&peer, &announcement("Alex"), start);

        t.sweep(start + Secs::seconds(350));
        assert_eq!(
            t.sweep(start + Secs::seconds(601)),
            vec![(peer.clone(), PresenceTransition::WentOffline)]
        );
        assert!(!t.contains(&peer));
        assert!(t.peers().is_empty());
    }

    #[test]
    fn test_stale_returns_without_rediscovery() {
        let mut t = tracker();
        let peer = ParticipantId::new("vendor-alex");
        let start = Utc::now();
        t.on_announcement(&peer, &announcement("Alex"), start);
        t.sweep(start + Secs::seconds(400));
        assert_eq!(t.state_of(&peer), Some(PresenceState::Stale));

        assert_eq!(
            t.on_announcement(&peer, &announcement("Alex"), start + Secs::seconds(450)),
            Some(PresenceTransition::CameOnline)
        );
        assert_eq!(t.state_of(&peer), Some(PresenceState::Online));
    }

    #[test]
    fn test_rediscovered_after_eviction() {
        let mut t = tracker();
        let peer = ParticipantId::new("vendor-alex");
        let start = Utc::now();
        t.on_announcement(&peer, &announcement("Alex"), start);
        t.sweep(start + Secs::seconds(700));

        assert_eq!(
            t.on_announcement(&peer, &announcement("Alex"), start + Secs::seconds(710)),
            Some(PresenceTransition::Discovered)
        );
    }

    #[test]
    fn test_leave_evicts_immediately() {
        let mut t = tracker();
        let peer = ParticipantId::new("vendor-alex");
        t.on_announcement(&peer, &announcement("Alex"), Utc::now());

        assert_eq!(t.on_leave(&peer), Some(PresenceTransition::Left));
        assert!(!t.contains(&peer));
        assert_eq!(t.on_leave(&peer), None);
    }

    #[test]
    fn test_grace_never_shorter_than_threshold() {
        let t = PresenceTracker::new(
            ParticipantId::new("local"),
            PresenceConfig {
                online_threshold: Duration::from_secs(300),
                grace: Duration::from_secs(10),
                sweep_interval: Duration::from_secs(30),
            },
        );
        assert_eq!(t.config().grace, Duration::from_secs(300));
    }

    #[test]
    fn test_display_name_kept_when_announcement_omits_it() {
        let mut t = tracker();
        let peer = ParticipantId::new("vendor-alex");
        let now = Utc::now();
        t.on_announcement(&peer, &announcement("Alex"), now);

        let anonymous = Announcement {
            display_name: None,
            avatar: None,
            topics: vec![],
        };
        t.on_announcement(&peer, &anonymous, now + Secs::seconds(5));
        assert_eq!(t.get(&peer).unwrap().display_name.as_deref(), Some("Alex"));
    }
}
