use std::{
    net::{Ipv4Addr, SocketAddr},
    time::Duration,
};

use tokio::net::UdpSocket;
use tracing::{debug, trace};

use crate::{
    Error, Payload, Result,
    constants::{DEFAULT_PUNCH_INTERVAL, DEFAULT_PUNCH_PACKETS, PUNCH_MARKER},
};

#[derive(Debug, Clone, Default)]
pub struct HolePunchOpts {
    /// How many marker datagrams to send.
    pub packets: Option<usize>,
    pub interval: Option<Duration>,
    /// Payload of each marker datagram. A transport connected with these opts drops
    /// incoming datagrams equal to it, so both peers should use the same marker.
    pub marker: Option<Payload>,
}

#[derive(Debug, Clone)]
pub(crate) struct ValidatedHolePunchOpts {
    pub packets: usize,
    pub interval: Duration,
    pub marker: Payload,
}

impl HolePunchOpts {
    pub(crate) fn validate(&self) -> Result<ValidatedHolePunchOpts> {
        let marker = self
            .marker
            .clone()
            .unwrap_or_else(|| PUNCH_MARKER.to_vec());
        if marker.is_empty() {
            return Err(Error::InvalidConfig("empty hole punch marker"));
        }
        Ok(ValidatedHolePunchOpts {
            packets: self.packets.unwrap_or(DEFAULT_PUNCH_PACKETS),
            interval: self.interval.unwrap_or(DEFAULT_PUNCH_INTERVAL),
            marker,
        })
    }
}

/// True when the "remote" is this host, e.g. a host joining its own lobby.
pub fn is_self_connect(remote: SocketAddr, own_public: Option<SocketAddr>) -> bool {
    remote.ip().is_loopback() || own_public == Some(remote)
}

/// Where to connect instead when [`is_self_connect`] holds.
pub fn loopback_for(remote: SocketAddr) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, remote.port()))
}

/// Opens the local NAT mapping towards `remote` with a burst of marker datagrams, then
/// connects `socket` to it.
///
/// `socket` must be the one STUN discovery ran on, so that the mapping is reused.
#[tracing::instrument(skip(socket, opts))]
pub async fn punch(socket: &UdpSocket, remote: SocketAddr, opts: &HolePunchOpts) -> Result<()> {
    let opts = opts.validate()?;
    let mut interval = tokio::time::interval(opts.interval);
    for i in 0..opts.packets {
        interval.tick().await;
        if let Err(e) = socket.send_to(&opts.marker, remote).await {
            // The remote side may not have opened its mapping yet.
            trace!(i, "error sending punch marker: {e:#}");
        }
    }
    socket.connect(remote).await?;
    debug!(packets = opts.packets, "hole punch finished, socket connected");
    Ok(())
}
