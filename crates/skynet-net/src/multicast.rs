//! Multicast socket setup for topic channels.
//!
//! Each topic gets its own group address and port derived from the channel
//! id. Sockets are created through `socket2` so that several processes on
//! the same host can share a topic port (SO_REUSEADDR / SO_REUSEPORT).

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use skynet_shared::constants::{DEFAULT_GROUP_PREFIX, DEFAULT_MULTICAST_TTL, DEFAULT_PORT_BASE};
use skynet_shared::Topic;

/// Addressing and socket options shared by all topic channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MulticastConfig {
    /// First two octets of every topic group address.
    pub group_prefix: [u8; 2],
    /// Topic port is `port_base + channel id`.
    pub port_base: u16,
    /// Interface to join groups on and send from. `0.0.0.0` lets the OS pick.
    pub interface: Ipv4Addr,
    pub ttl: u32,
    /// Receive our own datagrams (needed when several nodes share a host).
    pub loopback: bool,
    /// Send to this address instead of the topic group. A non-multicast
    /// address (e.g. `127.0.0.1`) turns the channel into a plain UDP socket.
    pub group_override: Option<Ipv4Addr>,
}

impl Default for MulticastConfig {
    fn default() -> Self {
        Self {
            group_prefix: DEFAULT_GROUP_PREFIX,
            port_base: DEFAULT_PORT_BASE,
            interface: Ipv4Addr::UNSPECIFIED,
            ttl: DEFAULT_MULTICAST_TTL,
            loopback: true,
            group_override: None,
        }
    }
}

impl MulticastConfig {
    /// Destination of every datagram published on `topic`.
    pub fn endpoint(&self, topic: Topic) -> io::Result<SocketAddrV4> {
        let port = topic.port(self.port_base).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "port base {} + channel {} overflows",
                    self.port_base,
                    topic.channel_id()
                ),
            )
        })?;
        let group = self
            .group_override
            .unwrap_or_else(|| topic.group_addr(self.group_prefix));
        Ok(SocketAddrV4::new(group, port))
    }
}

/// Bind a non-blocking socket for `topic` and join its multicast group.
///
/// Returns the socket together with the destination address datagrams
/// should be sent to.
pub fn bind_topic_socket(
    topic: Topic,
    config: &MulticastConfig,
) -> io::Result<(UdpSocket, SocketAddrV4)> {
    let dest = config.endpoint(topic)?;
    let group = *dest.ip();

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true)?;

    // Multicast receivers bind the wildcard address so that datagrams sent to
    // the group are delivered; plain UDP endpoints bind the exact address.
    let bind_addr = if group.is_multicast() {
        SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, dest.port())
    } else {
        dest
    };
    socket.bind(&SocketAddr::V4(bind_addr).into())?;
    socket.set_nonblocking(true)?;

    if group.is_multicast() {
        socket.join_multicast_v4(&group, &config.interface)?;
        socket.set_multicast_loop_v4(config.loopback)?;
        socket.set_multicast_ttl_v4(config.ttl)?;
        if !config.interface.is_unspecified() {
            if let Err(e) = socket.set_multicast_if_v4(&config.interface) {
                warn!(
                    topic = %topic,
                    interface = %config.interface,
                    error = %e,
                    "Could not select multicast interface, using default route"
                );
            }
        }
        debug!(
            topic = %topic,
            group = %group,
            port = dest.port(),
            interface = %config.interface,
            "Joined multicast group"
        );
    } else {
        debug!(topic = %topic, addr = %dest, "Bound unicast topic socket");
    }

    let std_socket: std::net::UdpSocket = socket.into();
    let socket = UdpSocket::from_std(std_socket)?;
    Ok((socket, dest))
}
