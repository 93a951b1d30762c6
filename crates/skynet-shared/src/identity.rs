use serde::{Deserialize, Serialize};

use crate::types::ParticipantId;

/// Identity of the local device, supplied by bootstrap configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LocalIdentity {
    id: ParticipantId,
    pub display_name: Option<String>,
    pub avatar: Option<String>,
}

impl LocalIdentity {
    /// Build the identity from a vendor/device identifier and the hostname.
    ///
    /// The participant id is `<vendor>-<hostname>`, or just the hostname when
    /// the platform exposes no vendor identifier.
    pub fn new(vendor_id: &str, hostname: &str, display_name: Option<String>) -> Self {
        Self {
            id: participant_id_for(vendor_id, hostname),
            display_name,
            avatar: None,
        }
    }

    pub fn with_avatar(mut self, avatar: impl Into<String>) -> Self {
        self.avatar = Some(avatar.into());
        self
    }

    pub fn participant_id(&self) -> &ParticipantId {
        &self.id
    }
}

pub fn participant_id_for(vendor_id: &str, hostname: &str) -> ParticipantId {
    let vendor = vendor_id.trim();
    let host = hostname.trim();
    if vendor.is_empty() {
        ParticipantId::new(host)
    } else {
        ParticipantId::new(format!("{vendor}-{host}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_participant_id_with_vendor() {
        let identity = LocalIdentity::new("6F1C-22AB", "field-01", Some("Jane".into()));
        assert_eq!(identity.participant_id().as_str(), "6F1C-22AB-field-01");
        assert_eq!(identity.display_name.as_deref(), Some("Jane"));
    }

    #[test]
    fn test_participant_id_without_vendor() {
        assert_eq!(participant_id_for("", "field-02").as_str(), "field-02");
        assert_eq!(participant_id_for("  ", "field-02").as_str(), "field-02");
    }
}
