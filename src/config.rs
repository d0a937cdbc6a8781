use std::net::SocketAddr;
use std::time::Duration;
use anyhow::bail;
use crate::packet::{FIXED_HEADER_LEN, MAX_MESSAGE_LEN, MAX_MISSED_LEN, MAX_PACKET_SIZE};

#[derive(Debug, Clone)]
pub struct AirhookConfig {
    pub self_addr: SocketAddr,

    /// Upper bound for the size of a datagram sent by this end point. Airhook does no MTU
    ///  discovery, and the packet builder stops adding messages before exceeding this size.
    ///
    /// Peers must be able to receive datagrams of this size, so this should be the same on all
    ///  nodes.
    pub max_packet_size: usize,

    /// If nothing was sent for this long, a packet is sent anyway to keep the peer informed
    ///  about our receive state. This is also the retry interval during the handshake.
    pub keep_alive_interval: Duration,

    /// Connections that neither received nor sent anything for this long are discarded
    pub connection_idle_timeout: Duration,
    pub sweep_interval: Duration,

    /// Upper bound for the number of peers with connection state. When a new peer shows up and
    ///  the limit is reached, the connection with the oldest activity is discarded.
    pub max_connections: usize,
}

impl AirhookConfig {
    /// fixed header, both session fields, NEXT, a full MISSED list and one maximum-size message
    pub const MIN_PACKET_SIZE: usize = FIXED_HEADER_LEN + 4 + 4 + 1 + 1 + MAX_MISSED_LEN + 1 + MAX_MESSAGE_LEN;
    pub const MAX_UDP_PAYLOAD: usize = 65_507;

    pub fn default_for(self_addr: SocketAddr) -> AirhookConfig {
        AirhookConfig {
            self_addr,
            max_packet_size: MAX_PACKET_SIZE,
            keep_alive_interval: Duration::from_secs(1),
            connection_idle_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(30),
            max_connections: 4096,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_packet_size < Self::MIN_PACKET_SIZE {
            bail!("max packet size {} is too small, must be at least {}", self.max_packet_size, Self::MIN_PACKET_SIZE);
        }
        if self.max_packet_size > Self::MAX_UDP_PAYLOAD {
            bail!("max packet size {} does not fit into a UDP datagram", self.max_packet_size);
        }
        if self.keep_alive_interval.is_zero() {
            bail!("keep-alive interval must not be zero");
        }
        if self.connection_idle_timeout <= self.keep_alive_interval {
            bail!("connection idle timeout must be longer than the keep-alive interval");
        }
        if self.sweep_interval.is_zero() {
            bail!("sweep interval must not be zero");
        }
        if self.max_connections == 0 {
            bail!("max connections must be at least 1");
        }
        Ok(())
    }
}
