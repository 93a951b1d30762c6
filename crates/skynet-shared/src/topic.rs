//! Static topic catalog.
//!
//! Every traffic class travels on its own multicast group. The numeric
//! channel id selects the group address and UDP port; the delivery policy
//! decides how the transport treats the traffic.

use std::net::{Ipv4Addr, SocketAddrV4};

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// How a topic's traffic is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeliveryPolicy {
    /// Discovery / heartbeat: unreliable broadcast.
    Control,
    /// Peer-to-peer chat: unreliable, addressed to one conversation partner.
    Direct,
    /// Tactical / group chat: acknowledged broadcast with retransmission.
    Group,
}

impl DeliveryPolicy {
    pub fn is_reliable(self) -> bool {
        matches!(self, DeliveryPolicy::Group)
    }

    pub fn is_addressed(self) -> bool {
        matches!(self, DeliveryPolicy::Direct)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Topic {
    #[serde(rename = "npg.control")]
    Control,
    #[serde(rename = "npg.pli")]
    Pli,
    #[serde(rename = "npg.surveillance")]
    Surveillance,
    #[serde(rename = "npg.chat")]
    Chat,
    #[serde(rename = "npg.tactical")]
    Tactical,
    #[serde(rename = "npg.c2")]
    C2,
    #[serde(rename = "npg.alerts")]
    Alerts,
    #[serde(rename = "npg.logistics")]
    Logistics,
    #[serde(rename = "npg.coord")]
    Coord,
}

impl Topic {
    pub const ALL: [Topic; 9] = [
        Topic::Control,
        Topic::Pli,
        Topic::Surveillance,
        Topic::Chat,
        Topic::Tactical,
        Topic::C2,
        Topic::Alerts,
        Topic::Logistics,
        Topic::Coord,
    ];

    /// Numeric channel id. Stable on the wire; never reassigned.
    pub fn channel_id(self) -> u16 {
        match self {
            Topic::Control => 1,
            Topic::Pli => 6,
            Topic::Surveillance => 7,
            Topic::Chat => 28,
            Topic::Tactical => 29,
            Topic::C2 => 100,
            Topic::Alerts => 101,
            Topic::Logistics => 102,
            Topic::Coord => 103,
        }
    }

    pub fn policy(self) -> DeliveryPolicy {
        match self {
            Topic::Control | Topic::Pli | Topic::Surveillance => DeliveryPolicy::Control,
            Topic::Chat => DeliveryPolicy::Direct,
            Topic::Tactical | Topic::C2 | Topic::Alerts | Topic::Logistics | Topic::Coord => {
                DeliveryPolicy::Group
            }
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Topic::Control => "npg.control",
            Topic::Pli => "npg.pli",
            Topic::Surveillance => "npg.surveillance",
            Topic::Chat => "npg.chat",
            Topic::Tactical => "npg.tactical",
            Topic::C2 => "npg.c2",
            Topic::Alerts => "npg.alerts",
            Topic::Logistics => "npg.logistics",
            Topic::Coord => "npg.coord",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Topic::Control => "Discovery",
            Topic::Pli => "Position Data",
            Topic::Surveillance => "Surveillance",
            Topic::Chat => "Public Chat",
            Topic::Tactical => "Tactical / Group",
            Topic::C2 => "Command & Control",
            Topic::Alerts => "Alerts",
            Topic::Logistics => "Logistics",
            Topic::Coord => "Coordination",
        }
    }

    pub fn from_channel_id(id: u16) -> Result<Self, ProtocolError> {
        Self::ALL
            .into_iter()
            .find(|t| t.channel_id() == id)
            .ok_or_else(|| ProtocolError::UnknownTopic(id.to_string()))
    }

    /// Parse a wire name (`npg.chat`) or a bare suffix (`chat`).
    pub fn from_name(name: &str) -> Result<Self, ProtocolError> {
        let name = name.trim();
        Self::ALL
            .into_iter()
            .find(|t| t.name() == name || t.name().strip_prefix("npg.") == Some(name))
            .ok_or_else(|| ProtocolError::UnknownTopic(name.to_string()))
    }

    /// Multicast group selected by the channel id under the given prefix.
    pub fn group_addr(self, prefix: [u8; 2]) -> Ipv4Addr {
        let id = self.channel_id();
        Ipv4Addr::new(prefix[0], prefix[1], (id >> 8) as u8, (id & 0xff) as u8)
    }

    /// UDP port for this topic, or `None` if `base + id` overflows.
    pub fn port(self, base: u16) -> Option<u16> {
        base.checked_add(self.channel_id())
    }

    pub fn endpoint(self, prefix: [u8; 2], port_base: u16) -> Option<SocketAddrV4> {
        self.port(port_base)
            .map(|port| SocketAddrV4::new(self.group_addr(prefix), port))
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Delivery policy of a topic.
pub fn policy_for(topic: Topic) -> DeliveryPolicy {
    topic.policy()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_channel_ids_unique() {
        let ids: HashSet<u16> = Topic::ALL.iter().map(|t| t.channel_id()).collect();
        assert_eq!(ids.len(), Topic::ALL.len());
    }

    #[test]
    fn test_policies() {
        assert_eq!(policy_for(Topic::Control), DeliveryPolicy::Control);
        assert_eq!(policy_for(Topic::Chat), DeliveryPolicy::Direct);
        assert_eq!(policy_for(Topic::Tactical), DeliveryPolicy::Group);
        assert!(Topic::Tactical.policy().is_reliable());
        assert!(!Topic::Chat.policy().is_reliable());
        assert!(Topic::Chat.policy().is_addressed());
    }

    #[test]
    fn test_lookup_by_id_and_name() {
        assert_eq!(Topic::from_channel_id(28).unwrap(), Topic::Chat);
        assert_eq!(Topic::from_name("npg.tactical").unwrap(), Topic::Tactical);
        assert_eq!(Topic::from_name("control").unwrap(), Topic::Control);
        assert!(matches!(
            Topic::from_channel_id(42),
            Err(ProtocolError::UnknownTopic(_))
        ));
        assert!(Topic::from_name("npg.bogus").is_err());
    }

    #[test]
    fn test_addressing() {
        assert_eq!(
            Topic::Tactical.group_addr([239, 255]),
            Ipv4Addr::new(239, 255, 0, 29)
        );
        assert_eq!(Topic::C2.port(32_000), Some(32_100));
        assert_eq!(Topic::Coord.port(u16::MAX), None);
        assert!(Topic::Control.group_addr([239, 255]).is_multicast());
    }
}
