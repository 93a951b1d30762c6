use thiserror::Error;

use skynet_net::ChannelError;
use skynet_shared::{ConversationId, MessageId, ProtocolError, Topic};
use skynet_store::StoreError;

/// Errors returned to callers of the router.
#[derive(Error, Debug)]
pub enum RouterError {
    /// Nothing left after trimming; the store was not touched.
    #[error("Message is empty")]
    EmptyMessage,

    /// The outgoing envelope cannot be put on the wire; the store was not touched.
    #[error("Encoding error: {0}")]
    Encoding(#[from] ProtocolError),

    #[error("Conversation not found: {0}")]
    ConversationNotFound(ConversationId),

    #[error("Message not found: {0}")]
    MessageNotFound(MessageId),

    #[error("Topic {0} cannot carry group conversations")]
    NotGroupTopic(Topic),

    /// The router task has terminated.
    #[error("Router closed")]
    Closed,

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),
}

impl From<StoreError> for RouterError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::ConversationNotFound(id) => RouterError::ConversationNotFound(id),
            StoreError::MessageNotFound(id) => RouterError::MessageNotFound(id),
        }
    }
}
