//! Client configuration loaded from environment variables.
//!
//! Every setting has a default so a node can start with zero configuration
//! on a single subnet.

use std::net::Ipv4Addr;
use std::time::Duration;

use skynet_net::{MulticastConfig, PresenceConfig, RetryPolicy};
use skynet_shared::constants::ANNOUNCE_INTERVAL_SECS;
use skynet_shared::{DeliveryPolicy, LocalIdentity, Topic};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Vendor / device identifier, first half of the participant id.
    /// Env: `SKYNET_DEVICE_ID`
    /// Default: empty (participant id is the hostname alone).
    pub device_id: String,

    /// Env: `SKYNET_HOSTNAME`, then `HOSTNAME`
    /// Default: `localhost`
    pub hostname: String,

    /// Env: `SKYNET_DISPLAY_NAME`
    pub display_name: Option<String>,

    /// Avatar reference announced to peers.
    /// Env: `SKYNET_AVATAR`
    pub avatar: Option<String>,

    /// Topics to open a channel for. Control is always added.
    /// Env: `SKYNET_TOPICS` (comma separated, e.g. `chat,npg.tactical`)
    /// Default: every topic.
    pub topics: Vec<Topic>,

    /// Topic used for group conversations opened without an explicit one.
    /// Env: `SKYNET_GROUP_TOPIC`
    /// Default: `npg.tactical`
    pub group_topic: Topic,

    /// Env: `SKYNET_PORT_BASE`, `SKYNET_INTERFACE`, `SKYNET_GROUP_OVERRIDE`,
    /// `SKYNET_TTL`, `SKYNET_LOOPBACK`
    pub multicast: MulticastConfig,

    /// Env: `SKYNET_ONLINE_SECS`, `SKYNET_GRACE_SECS`, `SKYNET_SWEEP_SECS`
    pub presence: PresenceConfig,

    /// Period of the local presence announcement.
    /// Env: `SKYNET_ANNOUNCE_SECS`
    /// Default: 60 s
    pub announce_interval: Duration,

    /// Env: `SKYNET_RETRY_BASE_MS`, `SKYNET_RETRY_CAP_MS`, `SKYNET_RETRY_ATTEMPTS`
    pub retry: RetryPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            device_id: String::new(),
            hostname: "localhost".to_string(),
            display_name: None,
            avatar: None,
            topics: Topic::ALL.to_vec(),
            group_topic: Topic::Tactical,
            multicast: MulticastConfig::default(),
            presence: PresenceConfig::default(),
            announce_interval: Duration::from_secs(ANNOUNCE_INTERVAL_SECS),
            retry: RetryPolicy::default(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`ClientConfig::from_env`] with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        // -- Identity --

        if let Some(id) = lookup("SKYNET_DEVICE_ID") {
            config.device_id = id.trim().to_string();
        }

        if let Some(host) = lookup("SKYNET_HOSTNAME").or_else(|| lookup("HOSTNAME")) {
            if !host.trim().is_empty() {
                config.hostname = host.trim().to_string();
            }
        }

        config.display_name = lookup("SKYNET_DISPLAY_NAME").filter(|n| !n.trim().is_empty());
        config.avatar = lookup("SKYNET_AVATAR").filter(|a| !a.trim().is_empty());

        // -- Topics --

        if let Some(list) = lookup("SKYNET_TOPICS") {
            let mut topics = Vec::new();
            for name in list.split(',').map(str::trim).filter(|n| !n.is_empty()) {
                match Topic::from_name(name) {
                    Ok(topic) => topics.push(topic),
                    Err(e) => tracing::warn!(value = %name, error = %e, "Ignoring topic in SKYNET_TOPICS"),
                }
            }
            config.topics = topics;
        }

        if let Some(name) = lookup("SKYNET_GROUP_TOPIC") {
            match Topic::from_name(name.trim()) {
                Ok(topic) if topic.policy() == DeliveryPolicy::Group => config.group_topic = topic,
                _ => tracing::warn!(value = %name, "Invalid SKYNET_GROUP_TOPIC, using default"),
            }
        }

        // -- Multicast --

        if let Some(base) = parse_var::<u16>(&lookup, "SKYNET_PORT_BASE") {
            config.multicast.port_base = base;
        }
        if let Some(addr) = parse_var::<Ipv4Addr>(&lookup, "SKYNET_INTERFACE") {
            config.multicast.interface = addr;
        }
        if let Some(addr) = parse_var::<Ipv4Addr>(&lookup, "SKYNET_GROUP_OVERRIDE") {
            config.multicast.group_override = Some(addr);
        }
        if let Some(ttl) = parse_var::<u32>(&lookup, "SKYNET_TTL") {
            config.multicast.ttl = ttl;
        }
        if let Some(val) = lookup("SKYNET_LOOPBACK") {
            config.multicast.loopback = val != "false" && val != "0";
        }

        // -- Presence --

        if let Some(d) = parse_secs(&lookup, "SKYNET_ONLINE_SECS") {
            config.presence.online_threshold = d;
        }
        if let Some(d) = parse_secs(&lookup, "SKYNET_GRACE_SECS") {
            config.presence.grace = d;
        }
        if let Some(d) = parse_secs(&lookup, "SKYNET_SWEEP_SECS") {
            config.presence.sweep_interval = d;
        }
        if let Some(d) = parse_secs(&lookup, "SKYNET_ANNOUNCE_SECS") {
            config.announce_interval = d;
        }

        // -- Reliable delivery --

        if let Some(ms) = parse_positive(&lookup, "SKYNET_RETRY_BASE_MS") {
            config.retry.base = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_positive(&lookup, "SKYNET_RETRY_CAP_MS") {
            config.retry.cap = Duration::from_millis(ms);
        }
        if let Some(n) = parse_positive(&lookup, "SKYNET_RETRY_ATTEMPTS") {
            config.retry.max_attempts = u32::try_from(n).unwrap_or(u32::MAX);
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter.

        config
    }

    pub fn identity(&self) -> LocalIdentity {
        let identity = LocalIdentity::new(&self.device_id, &self.hostname, self.display_name.clone());
        match &self.avatar {
            Some(avatar) => identity.with_avatar(avatar.clone()),
            None => identity,
        }
    }

    /// Topics a channel is opened for: the configured set plus Control,
    /// deduplicated and in catalog order.
    pub fn subscribed_topics(&self) -> Vec<Topic> {
        Topic::ALL
            .into_iter()
            .filter(|t| *t == Topic::Control || self.topics.contains(t))
            .collect()
    }
}

fn parse_var<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Invalid value, using default");
            None
        }
    }
}

/// Zero is rejected: intervals and retry budgets must be positive.
fn parse_positive(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<u64> {
    match parse_var::<u64>(lookup, key)? {
        0 => {
            tracing::warn!(key, "Zero is not allowed, using default");
            None
        }
        n => Some(n),
    }
}

fn parse_secs(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<Duration> {
    parse_positive(lookup, key).map(Duration::from_secs)
}
