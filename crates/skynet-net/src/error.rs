use thiserror::Error;

use skynet_shared::{MessageId, ProtocolError, Topic};

/// Errors surfaced by a transport channel.
#[derive(Error, Debug)]
pub enum ChannelError {
    /// Fatal for the channel: it has transitioned to `Stopped`.
    #[error("Socket error: {0}")]
    Socket(#[from] std::io::Error),

    /// The envelope could not be put on the wire (usually: too large).
    #[error("Encoding error: {0}")]
    Encoding(#[from] ProtocolError),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("No acknowledgement for message {message_id} after {attempts} attempts")]
    DeliveryTimeout { message_id: MessageId, attempts: u32 },

    #[error("Topic {0} does not support reliable delivery")]
    NotReliable(Topic),
}
