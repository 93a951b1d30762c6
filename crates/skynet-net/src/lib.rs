// Multicast transport: one channel actor per topic, reliable group delivery,
// and presence tracking over the control topic.

pub mod channel;
pub mod error;
pub mod multicast;
pub mod presence;
pub mod reliable;

pub use channel::{spawn_channel, ChannelEvent, ChannelHandle, ChannelState};
pub use error::ChannelError;
pub use multicast::MulticastConfig;
pub use presence::{PresenceConfig, PresenceState, PresenceTracker, PresenceTransition};
pub use reliable::{ReliableDelivery, RetryPolicy};
