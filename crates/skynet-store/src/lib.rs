//! # skynet-store
//!
//! In-memory conversation state for the Skynet client.
//!
//! The [`ConversationStore`] is owned by exactly one task (the router) and
//! is never shared behind a lock; the UI only ever sees cloned snapshots.
//! Merging enforces the conversation invariants: one message per
//! `(author, message id)`, messages ordered by creation time with the id as
//! tie-break, and `updated_at` equal to the newest message's timestamp.

pub mod conversations;
pub mod models;

mod error;

pub use conversations::{ConversationStore, MergeOutcome};
pub use error::StoreError;
pub use models::*;
