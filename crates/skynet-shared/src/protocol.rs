//! Envelope wire format.
//!
//! A datagram is `SK32` magic, one version byte, then the bincode encoding
//! (fixed-width little-endian integers) of an [`Envelope`]. The envelope
//! payload is opaque to the transport; the router decodes it per kind.

use bincode::Options;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::constants::{HEADER_LEN, MAX_DATAGRAM_SIZE, WIRE_MAGIC, WIRE_VERSION};
use crate::error::ProtocolError;
use crate::topic::Topic;
use crate::types::{ConversationId, MessageId, ParticipantId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvelopeKind {
    Text,
    Ack,
    Presence,
    Control,
}

/// The wire unit. `(sender, message_id)` is unique and serves as dedup key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Topic channel id
    pub topic: u16,
    pub sender: ParticipantId,
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    /// Sender clock, milliseconds since the Unix epoch
    pub timestamp_ms: i64,
    pub kind: EnvelopeKind,
    /// Opaque body, bincode of the kind-specific struct
    pub payload: Vec<u8>,
    /// Opaque authentication tag, carried untouched
    pub auth_tag: Vec<u8>,
    /// Group topics only: per (sender, conversation) stream sequence
    pub sequence: Option<u64>,
}

/// Body of a `Text` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextBody {
    pub text: String,
    /// Author's display name at send time
    pub display_name: Option<String>,
    /// Conversation members known to the sender, author included
    pub participants: Vec<ParticipantId>,
    pub group: bool,
}

/// Body of an `Ack` envelope, referencing the acknowledged message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckBody {
    pub message_id: MessageId,
    pub sequence: Option<u64>,
}

/// Body of a `Presence` envelope, broadcast on the control topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    pub display_name: Option<String>,
    pub avatar: Option<String>,
    /// Channel ids the sender listens on
    pub topics: Vec<u16>,
}

/// Body of a `Control` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlBody {
    /// Graceful departure; the sender should be dropped from peer tables.
    Leave,
}

fn wire_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .with_limit(MAX_DATAGRAM_SIZE as u64)
}

fn encode_body<T: Serialize>(body: &T) -> Result<Vec<u8>, ProtocolError> {
    wire_options().serialize(body).map_err(|e| match *e {
        bincode::ErrorKind::SizeLimit => ProtocolError::Encoding {
            size: bincode::DefaultOptions::new()
                .with_fixint_encoding()
                .serialized_size(body)
                .map_or(usize::MAX, |n| n as usize),
            max: MAX_DATAGRAM_SIZE,
        },
        _ => ProtocolError::Serialization(e),
    })
}

impl Envelope {
    fn build(
        topic: u16,
        sender: ParticipantId,
        conversation_id: ConversationId,
        kind: EnvelopeKind,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            topic,
            sender,
            message_id: MessageId::new(),
            conversation_id,
            timestamp_ms: Utc::now().timestamp_millis(),
            kind,
            payload,
            auth_tag: Vec::new(),
            sequence: None,
        }
    }

    pub fn text(
        topic: Topic,
        sender: ParticipantId,
        conversation_id: ConversationId,
        body: &TextBody,
    ) -> Result<Self, ProtocolError> {
        Ok(Self::build(
            topic.channel_id(),
            sender,
            conversation_id,
            EnvelopeKind::Text,
            encode_body(body)?,
        ))
    }

    /// Ack for `original`, addressed back on the same topic and conversation.
    pub fn ack(sender: ParticipantId, original: &Envelope) -> Result<Self, ProtocolError> {
        let body = AckBody {
            message_id: original.message_id,
            sequence: original.sequence,
        };
        Ok(Self::build(
            original.topic,
            sender,
            original.conversation_id.clone(),
            EnvelopeKind::Ack,
            encode_body(&body)?,
        ))
    }

    pub fn presence(sender: ParticipantId, body: &Announcement) -> Result<Self, ProtocolError> {
        Ok(Self::build(
            Topic::Control.channel_id(),
            sender,
            ConversationId(String::new()),
            EnvelopeKind::Presence,
            encode_body(body)?,
        ))
    }

    pub fn control(sender: ParticipantId, body: &ControlBody) -> Result<Self, ProtocolError> {
        Ok(Self::build(
            Topic::Control.channel_id(),
            sender,
            ConversationId(String::new()),
            EnvelopeKind::Control,
            encode_body(body)?,
        ))
    }

    /// Serialize into a datagram, rejecting anything over [`MAX_DATAGRAM_SIZE`].
    pub fn to_datagram(&self) -> Result<Vec<u8>, ProtocolError> {
        let body = wire_options().serialize(self).map_err(|e| match *e {
            bincode::ErrorKind::SizeLimit => ProtocolError::Encoding {
                size: self.payload.len() + HEADER_LEN,
                max: MAX_DATAGRAM_SIZE,
            },
            _ => ProtocolError::Serialization(e),
        })?;

        let size = HEADER_LEN + body.len();
        if size > MAX_DATAGRAM_SIZE {
            return Err(ProtocolError::Encoding {
                size,
                max: MAX_DATAGRAM_SIZE,
            });
        }

        let mut out = Vec::with_capacity(size);
        out.extend_from_slice(WIRE_MAGIC);
        out.push(WIRE_VERSION);
        out.extend_from_slice(&body);
        Ok(out)
    }

    pub fn from_datagram(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < HEADER_LEN {
            return Err(ProtocolError::Malformed(format!(
                "datagram too short: {} bytes",
                data.len()
            )));
        }
        if &data[..WIRE_MAGIC.len()] != WIRE_MAGIC {
            return Err(ProtocolError::Malformed("bad magic".into()));
        }
        let version = data[WIRE_MAGIC.len()];
        if version != WIRE_VERSION {
            return Err(ProtocolError::Malformed(format!(
                "unsupported version {version}"
            )));
        }

        wire_options()
            .deserialize(&data[HEADER_LEN..])
            .map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    pub fn topic(&self) -> Result<Topic, ProtocolError> {
        Topic::from_channel_id(self.topic)
    }

    pub fn dedup_key(&self) -> (ParticipantId, MessageId) {
        (self.sender.clone(), self.message_id)
    }

    /// Sender timestamp as a UTC instant; out-of-range values clamp to the epoch.
    pub fn created_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.timestamp_ms).unwrap_or_default()
    }

    pub fn body<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        wire_options()
            .deserialize(&self.payload)
            .map_err(|e| ProtocolError::Malformed(format!("{:?} body: {e}", self.kind)))
    }

    pub fn text_body(&self) -> Result<TextBody, ProtocolError> {
        self.expect_kind(EnvelopeKind::Text)?;
        self.body()
    }

    pub fn ack_body(&self) -> Result<AckBody, ProtocolError> {
        self.expect_kind(EnvelopeKind::Ack)?;
        self.body()
    }

    pub fn announcement(&self) -> Result<Announcement, ProtocolError> {
        self.expect_kind(EnvelopeKind::Presence)?;
        self.body()
    }

    pub fn control_body(&self) -> Result<ControlBody, ProtocolError> {
        self.expect_kind(EnvelopeKind::Control)?;
        self.body()
    }

    fn expect_kind(&self, kind: EnvelopeKind) -> Result<(), ProtocolError> {
        if self.kind == kind {
            Ok(())
        } else {
            Err(ProtocolError::Malformed(format!(
                "expected {kind:?} envelope, got {:?}",
                self.kind
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_text(text: &str) -> Envelope {
        Envelope::text(
            Topic::Chat,
            ParticipantId::new("vendor-alice"),
            ConversationId::new(),
            &TextBody {
                text: text.to_string(),
                display_name: Some("Alice".into()),
                participants: vec![ParticipantId::new("vendor-alice")],
                group: false,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_datagram_roundtrip() {
        let env = sample_text("PING?");
        let bytes = env.to_datagram().unwrap();
        assert_eq!(&bytes[..4], WIRE_MAGIC);
        assert_eq!(bytes[4], WIRE_VERSION);

        let restored = Envelope::from_datagram(&bytes).unwrap();
        assert_eq!(restored, env);
        assert_eq!(restored.text_body().unwrap().text, "PING?");
        assert_eq!(restored.topic().unwrap(), Topic::Chat);
    }

    #[test]
    fn test_rejects_foreign_datagrams() {
        assert!(matches!(
            Envelope::from_datagram(b"SK"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            Envelope::from_datagram(b"M-SEARCH * HTTP/1.1\r\n"),
            Err(ProtocolError::Malformed(_))
        ));

        let mut bytes = sample_text("hi").to_datagram().unwrap();
        bytes[4] = WIRE_VERSION + 1;
        assert!(Envelope::from_datagram(&bytes).is_err());

        let mut truncated = sample_text("hi").to_datagram().unwrap();
        truncated.truncate(truncated.len() - 3);
        assert!(Envelope::from_datagram(&truncated).is_err());
    }

    #[test]
    fn test_oversize_payload_rejected() {
        let mut env = sample_text("hi");
        env.payload = vec![b'x'; MAX_DATAGRAM_SIZE];
        match env.to_datagram() {
            Err(ProtocolError::Encoding { max, .. }) => assert_eq!(max, MAX_DATAGRAM_SIZE),
            other => panic!("expected encoding error, got {other:?}"),
        }
    }

    #[test]
    fn test_ack_references_original() {
        let mut original = sample_text("hi");
        original.topic = Topic::Tactical.channel_id();
        original.sequence = Some(7);

        let ack = Envelope::ack(ParticipantId::new("vendor-bob"), &original).unwrap();
        assert_eq!(ack.kind, EnvelopeKind::Ack);
        assert_eq!(ack.topic, original.topic);
        assert_ne!(ack.message_id, original.message_id);

        let body = ack.ack_body().unwrap();
        assert_eq!(body.message_id, original.message_id);
        assert_eq!(body.sequence, Some(7));
    }

    #[test]
    fn test_body_kind_mismatch() {
        let env = sample_text("hi");
        assert!(env.announcement().is_err());
        assert!(env.ack_body().is_err());
    }

    #[test]
    fn test_created_at_from_millis() {
        let mut env = sample_text("hi");
        env.timestamp_ms = 1_700_000_000_123;
        assert_eq!(env.created_at().timestamp_millis(), 1_700_000_000_123);
    }
}
