use futures::future::BoxFuture;
use tokio::net::UdpSocket;

use crate::{Payload, Result};

/// What the application layer has to provide itself on top of a transport.
///
/// Snapshotted once when a transport gets bound to a scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    pub requires_sequencing: bool,
    pub requires_reliability: bool,
    pub requires_congestion_management: bool,
}

impl Capabilities {
    /// Raw datagrams: nothing is provided by the channel.
    pub const ALL: Capabilities = Capabilities {
        requires_sequencing: true,
        requires_reliability: true,
        requires_congestion_management: true,
    };

    /// The channel orders, retransmits and paces by itself.
    pub const NONE: Capabilities = Capabilities {
        requires_sequencing: false,
        requires_reliability: false,
        requires_congestion_management: false,
    };

    pub fn needs_rtt(&self) -> bool {
        self.requires_sequencing
    }

    pub fn needs_congestion(&self) -> bool {
        self.requires_sequencing && self.requires_congestion_management
    }

    pub fn needs_ledger(&self) -> bool {
        self.requires_sequencing && self.requires_reliability
    }
}

/// The only surface of a transport the update scheduler sees.
pub trait TransportSender: Send + Sync + 'static {
    fn capabilities(&self) -> Capabilities;

    fn send(&self, buf: &[u8]) -> Result<()>;

    /// For channels that distinguish reliable sends. Others just send.
    fn send_reliable(&self, buf: &[u8]) -> Result<()> {
        self.send(buf)
    }
}

/// Secure datagram channel on top of a connected UDP socket. Treated as opaque.
pub trait SecureChannel: Send + Sync + 'static {
    fn handshake<'a>(&'a self, socket: &'a UdpSocket) -> BoxFuture<'a, Result<()>>;

    fn seal(&self, plaintext: &[u8]) -> Result<Payload>;

    fn open(&self, ciphertext: &[u8]) -> Result<Payload>;
}

/// Identity channel: no handshake, bytes pass through unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainChannel;

impl SecureChannel for PlainChannel {
    fn handshake<'a>(&'a self, _socket: &'a UdpSocket) -> BoxFuture<'a, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn seal(&self, plaintext: &[u8]) -> Result<Payload> {
        Ok(plaintext.to_vec())
    }

    fn open(&self, ciphertext: &[u8]) -> Result<Payload> {
        Ok(ciphertext.to_vec())
    }
}

pub type PeerId = u64;

/// A relayed peer to peer network with its own ordering, reliability and pacing.
/// Received messages can only be polled for.
pub trait RelayNetwork: Send + Sync + 'static {
    fn local_peer(&self) -> PeerId;

    fn send_to_peer(&self, peer: PeerId, data: &[u8], reliable: bool) -> Result<()>;

    /// Next message received from `peer`, if any.
    fn poll_recv(&self, peer: PeerId) -> Option<Payload>;

    /// False once the relay layer has shut down.
    fn is_running(&self) -> bool;
}
