/// Magic prefix of every Skynet datagram.
pub const WIRE_MAGIC: &[u8; 4] = b"SK32";

/// Wire format version carried after the magic.
pub const WIRE_VERSION: u8 = 1;

/// Length of the datagram header (magic + version).
pub const HEADER_LEN: usize = WIRE_MAGIC.len() + 1;

/// Maximum UDP payload over IPv4 (65535 - 8 byte UDP header - 20 byte IP header)
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// First two octets of the administratively scoped multicast range used for topics
pub const DEFAULT_GROUP_PREFIX: [u8; 2] = [239, 255];

/// Topic channel id is added to this base to form the UDP port
pub const DEFAULT_PORT_BASE: u16 = 32_000;

/// Multicast TTL (link-local: do not leave the subnet)
pub const DEFAULT_MULTICAST_TTL: u32 = 1;

/// A participant is online while its last announcement is younger than this
pub const ONLINE_THRESHOLD_SECS: u64 = 300;

/// Stale participants are evicted once their last announcement is older than this
pub const PRESENCE_GRACE_SECS: u64 = 600;

/// Presence sweep period
pub const PRESENCE_SWEEP_SECS: u64 = 30;

/// Local presence announcement period
pub const ANNOUNCE_INTERVAL_SECS: u64 = 60;

/// Reliable send: first backoff delay
pub const RETRY_BASE_MS: u64 = 500;

/// Reliable send: maximum backoff delay
pub const RETRY_CAP_MS: u64 = 8_000;

/// Reliable send: transmissions before giving up
pub const RETRY_MAX_ATTEMPTS: u32 = 5;

/// Domain separation context for deterministic direct conversation ids (BLAKE3)
pub const KDF_CONTEXT_DIRECT_CONVERSATION: &str = "skynet-direct-conversation-v1";
