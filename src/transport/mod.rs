//! The concrete transports a connection can run over.

pub mod relay;
pub mod udp;

use std::net::SocketAddr;

use crate::{
    Result,
    traits::{Capabilities, TransportSender},
};

pub use relay::{LocalRelayHub, LocalRelayPeer, RelayOpts, RelayTransport};
pub use udp::UdpTransport;

/// Every transport family there is. Picked once, when the connection is set up.
#[derive(Debug)]
pub enum Transport {
    /// Plain or hole-punched UDP inside a secure channel.
    Udp(UdpTransport),
    Relay(RelayTransport),
}

impl Transport {
    pub fn capabilities(&self) -> Capabilities {
        match self {
            Transport::Udp(t) => t.capabilities(),
            Transport::Relay(t) => t.capabilities(),
        }
    }

    pub fn send(&self, buf: &[u8]) -> Result<()> {
        match self {
            Transport::Udp(t) => t.send(buf),
            Transport::Relay(t) => t.send_with(buf, false),
        }
    }

    pub fn send_reliable(&self, buf: &[u8]) -> Result<()> {
        match self {
            Transport::Udp(t) => t.send(buf),
            Transport::Relay(t) => t.send_with(buf, true),
        }
    }

    /// None for relayed transports, which have no socket address.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Transport::Udp(t) => t.local_addr().ok(),
            Transport::Relay(_) => None,
        }
    }

    pub async fn disconnect(&self) {
        match self {
            Transport::Udp(t) => t.disconnect().await,
            Transport::Relay(t) => t.disconnect().await,
        }
    }
}

impl From<UdpTransport> for Transport {
    fn from(t: UdpTransport) -> Self {
        Transport::Udp(t)
    }
}

impl From<RelayTransport> for Transport {
    fn from(t: RelayTransport) -> Self {
        Transport::Relay(t)
    }
}

impl TransportSender for Transport {
    fn capabilities(&self) -> Capabilities {
        Transport::capabilities(self)
    }

    fn send(&self, buf: &[u8]) -> Result<()> {
        Transport::send(self, buf)
    }

    fn send_reliable(&self, buf: &[u8]) -> Result<()> {
        Transport::send_reliable(self, buf)
    }
}
