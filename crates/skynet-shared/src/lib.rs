// Shared types, topic catalog and wire codec for the Skynet multicast transport.

pub mod constants;
pub mod error;
pub mod identity;
pub mod protocol;
pub mod topic;
pub mod types;

pub use error::ProtocolError;
pub use identity::LocalIdentity;
pub use protocol::{AckBody, Announcement, ControlBody, Envelope, EnvelopeKind, TextBody};
pub use topic::{DeliveryPolicy, Topic};
pub use types::{ConversationId, MessageId, Participant, ParticipantId};
