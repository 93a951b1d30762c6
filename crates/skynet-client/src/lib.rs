//! # skynet-client
//!
//! Client core for the Skynet messaging transport.
//!
//! [`spawn_router`] starts the coordinator actor. It owns one transport
//! channel per subscribed topic, the presence table and the conversation
//! store, and publishes an immutable [`Snapshot`] after every change. UI
//! layers talk to it exclusively through the cloneable [`RouterHandle`].

pub mod config;
pub mod error;
pub mod router;
pub mod snapshot;

pub use config::ClientConfig;
pub use error::RouterError;
pub use router::{spawn_router, RouterHandle};
pub use snapshot::Snapshot;
