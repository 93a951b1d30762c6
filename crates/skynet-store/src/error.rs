use thiserror::Error;

use skynet_shared::{ConversationId, MessageId};

/// Errors produced by the store layer.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum StoreError {
    #[error("Conversation not found: {0}")]
    ConversationNotFound(ConversationId),

    #[error("Message not found: {0}")]
    MessageNotFound(MessageId),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
