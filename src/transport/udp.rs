use std::{
    net::SocketAddr,
    sync::{Arc, OnceLock},
    time::Duration,
};

use dontfrag::UdpSocketExt;
use parking_lot::Mutex;
use tokio::{
    net::UdpSocket,
    sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, debug_span, trace, warn};

use crate::{
    Error, Payload, Result,
    metrics::METRICS,
    nat::holepunch::{self, HolePunchOpts},
    constants::PUNCH_MARKER,
    traits::{Capabilities, SecureChannel, TransportSender},
};

// Enough for a few seconds of updates from a handful of peers.
const UDP_RCVBUF: usize = 1024 * 1024;

const RECV_TASK_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

fn try_set_udp_rcvbuf(sock: &UdpSocket, bufsize: usize) {
    let sock = socket2::SockRef::from(sock);
    let prev = sock.recv_buffer_size().map(|v| v as isize).unwrap_or(-1);
    match sock.set_recv_buffer_size(bufsize) {
        Ok(()) => match sock.recv_buffer_size() {
            Ok(value) if value >= bufsize => {
                trace!(prev, current = value, "set UDP rcv buf size");
            }
            Ok(value) => {
                debug!(
                    prev,
                    current = value,
                    expected = bufsize,
                    "couldn't set UDP rcv buf size to requested value"
                );
            }
            Err(e) => debug!(prev, "error reading UDP rcv buf size: {e:#}"),
        },
        Err(e) => debug!(current = prev, "error setting UDP rcv buf size: {e:#}"),
    }
}

/// UDP socket wrapped in a secure channel. Everything above has to be provided by the
/// application: sequencing, reliability and pacing.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    channel: Arc<dyn SecureChannel>,
    remote: OnceLock<SocketAddr>,
    incoming: UnboundedSender<Payload>,
    cancel: CancellationToken,
    recv_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for UdpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpTransport")
            .field("local", &self.socket.local_addr().ok())
            .field("remote", &self.remote.get())
            .finish_non_exhaustive()
    }
}

impl UdpTransport {
    pub async fn bind(
        addr: SocketAddr,
        channel: Arc<dyn SecureChannel>,
    ) -> Result<(Self, UnboundedReceiver<Payload>)> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self::from_socket(socket, channel))
    }

    /// Wraps an existing socket, e.g. the one used for STUN discovery.
    pub fn from_socket(
        socket: UdpSocket,
        channel: Arc<dyn SecureChannel>,
    ) -> (Self, UnboundedReceiver<Payload>) {
        match socket.local_addr() {
            Ok(a) if a.is_ipv4() => {
                if let Err(e) = socket.set_dontfrag_v4(true) {
                    warn!("error setting IPV4_DONTFRAG: {e:#}");
                }
            }
            Ok(_) => {
                if let Err(e) = socket.set_dontfrag_v6(true) {
                    debug!("error setting IPV6_DONTFRAG: {e:#}");
                }
            }
            Err(_) => {}
        }
        try_set_udp_rcvbuf(&socket, UDP_RCVBUF);

        let (tx, rx) = unbounded_channel();
        let transport = Self {
            socket: Arc::new(socket),
            channel,
            remote: OnceLock::new(),
            incoming: tx,
            cancel: CancellationToken::new(),
            recv_task: Mutex::new(None),
        };
        (transport, rx)
    }

    pub fn socket(&self) -> &UdpSocket {
        &self.socket
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote.get().copied()
    }

    pub fn is_connected(&self) -> bool {
        self.remote.get().is_some()
    }

    /// Connects the socket, runs the secure channel handshake and starts receiving.
    #[tracing::instrument(skip(self))]
    pub async fn connect(&self, remote: SocketAddr) -> Result<()> {
        self.connect_with_marker(remote, PUNCH_MARKER.to_vec()).await
    }

    async fn connect_with_marker(&self, remote: SocketAddr, marker: Payload) -> Result<()> {
        if self.remote.get().is_some() {
            return Err(Error::Text("already connected"));
        }
        self.socket.connect(remote).await?;
        self.finish_connect(remote, marker).await
    }

    /// Like [`Self::connect`], but punches through the NAT first. Connecting to this
    /// host's own public endpoint goes straight to loopback.
    #[tracing::instrument(skip(self, opts))]
    pub async fn connect_hole_punched(
        &self,
        remote: SocketAddr,
        own_public: Option<SocketAddr>,
        opts: &HolePunchOpts,
    ) -> Result<()> {
        if self.remote.get().is_some() {
            return Err(Error::Text("already connected"));
        }
        let marker = opts.validate()?.marker;
        if holepunch::is_self_connect(remote, own_public) {
            let loopback = holepunch::loopback_for(remote);
            debug!(?loopback, "connecting to self, skipping hole punch");
            return self.connect_with_marker(loopback, marker).await;
        }
        holepunch::punch(&self.socket, remote, opts).await?;
        self.finish_connect(remote, marker).await
    }

    // `marker` is what the peer punches with; datagrams equal to it are dropped.
    async fn finish_connect(&self, remote: SocketAddr, marker: Payload) -> Result<()> {
        self.channel.handshake(&self.socket).await?;
        // Sends are synchronous and only see readiness tokio already observed.
        self.socket.writable().await?;
        if self.remote.set(remote).is_err() {
            return Err(Error::Text("already connected"));
        }

        let handle = tokio::spawn(
            recv_loop(
                self.socket.clone(),
                self.channel.clone(),
                marker,
                self.incoming.clone(),
                self.cancel.clone(),
            )
            .instrument(debug_span!("udp_recv", ?remote)),
        );
        *self.recv_task.lock() = Some(handle);
        debug!("connected");
        Ok(())
    }

    pub fn send(&self, buf: &[u8]) -> Result<()> {
        let remote = *self.remote.get().ok_or(Error::NotConnected)?;
        let sealed = self.channel.seal(buf)?;
        let sent = match self.socket.try_send(&sealed) {
            // tokio's readiness can lag behind the socket's. Ask the socket itself.
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                socket2::SockRef::from(&*self.socket).send(&sealed)
            }
            r => r,
        };
        match sent {
            Ok(_) => Ok(()),
            Err(e) => {
                METRICS.send_errors.increment(1);
                Err(Error::Send {
                    addr: Some(remote),
                    source: e,
                })
            }
        }
    }

    /// Stops receiving. The socket itself closes once dropped.
    pub async fn disconnect(&self) {
        self.cancel.cancel();
        let handle = self.recv_task.lock().take();
        if let Some(handle) = handle {
            if tokio::time::timeout(RECV_TASK_JOIN_TIMEOUT, handle)
                .await
                .is_err()
            {
                warn!("udp receive task didn't stop in time");
            }
        }
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl TransportSender for UdpTransport {
    fn capabilities(&self) -> Capabilities {
        Capabilities::ALL
    }

    fn send(&self, buf: &[u8]) -> Result<()> {
        UdpTransport::send(self, buf)
    }
}

async fn recv_loop(
    socket: Arc<UdpSocket>,
    channel: Arc<dyn SecureChannel>,
    marker: Payload,
    incoming: UnboundedSender<Payload>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; 65536];
    loop {
        let len = tokio::select! {
            _ = cancel.cancelled() => {
                trace!("receive loop cancelled");
                return;
            }
            r = socket.recv(&mut buf) => match r {
                Ok(len) => len,
                Err(e) => {
                    // ICMP errors of connected sockets show up here. Not fatal.
                    debug_every_ms!(1000, "error receiving: {e:#}");
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    continue;
                }
            }
        };
        let data = &buf[..len];
        if data == marker.as_slice() {
            trace!("dropping hole punch marker");
            continue;
        }
        let plain = match channel.open(data) {
            Ok(p) => p,
            Err(e) => {
                debug_every_ms!(1000, "error opening datagram: {e:#}");
                continue;
            }
        };
        if incoming.send(plain).is_err() {
            trace!("nobody is reading incoming datagrams");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::traits::PlainChannel;

    use super::*;

    async fn plain() -> (UdpTransport, UnboundedReceiver<Payload>) {
        UdpTransport::bind("127.0.0.1:0".parse().unwrap(), Arc::new(PlainChannel))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_send_before_connect() {
        let (t, _rx) = plain().await;
        assert!(matches!(t.send(b"x"), Err(Error::NotConnected)));
        assert!(!t.is_connected());
    }

    #[tokio::test]
    async fn test_exchange_and_marker_filtering() {
        let (a, mut a_rx) = plain().await;
        let (b, mut b_rx) = plain().await;
        a.connect(b.local_addr().unwrap()).await.unwrap();
        b.connect(a.local_addr().unwrap()).await.unwrap();

        a.socket().send(PUNCH_MARKER).await.unwrap();
        a.send(b"hello").unwrap();
        b.send(b"world").unwrap();

        assert_eq!(b_rx.recv().await.unwrap(), b"hello");
        assert_eq!(a_rx.recv().await.unwrap(), b"world");
        assert!(b_rx.try_recv().is_err());

        a.disconnect().await;
        b.disconnect().await;
    }

    #[tokio::test]
    async fn test_self_connect_goes_to_loopback() {
        let (a, _a_rx) = plain().await;
        let (b, mut b_rx) = plain().await;
        let b_port = b.local_addr().unwrap().port();
        let public: SocketAddr = SocketAddr::from(([198, 51, 100, 1], b_port));

        a.connect_hole_punched(public, Some(public), &HolePunchOpts::default())
            .await
            .unwrap();
        assert_eq!(
            a.remote_addr(),
            Some(SocketAddr::from(([127, 0, 0, 1], b_port)))
        );
        b.connect(a.local_addr().unwrap()).await.unwrap();
        a.send(b"self").unwrap();
        assert_eq!(b_rx.recv().await.unwrap(), b"self");
    }

    #[tokio::test]
    async fn test_hole_punched_connect_on_loopback() {
        let (a, mut a_rx) = plain().await;
        let (b, mut b_rx) = plain().await;
        let opts = HolePunchOpts {
            packets: Some(3),
            interval: Some(Duration::from_millis(1)),
            marker: None,
        };
        let (ra, rb) = tokio::join!(
            a.connect_hole_punched(b.local_addr().unwrap(), None, &opts),
            b.connect_hole_punched(a.local_addr().unwrap(), None, &opts),
        );
        ra.unwrap();
        rb.unwrap();

        a.send(b"ping").unwrap();
        assert_eq!(b_rx.recv().await.unwrap(), b"ping");
        b.send(b"pong").unwrap();
        assert_eq!(a_rx.recv().await.unwrap(), b"pong");
    }

    #[tokio::test]
    async fn test_custom_marker_filtered() {
        let (a, mut a_rx) = plain().await;
        let (b, mut b_rx) = plain().await;
        let opts = HolePunchOpts {
            packets: Some(3),
            interval: Some(Duration::from_millis(1)),
            marker: Some(b"MYMARK".to_vec()),
        };
        let (ra, rb) = tokio::join!(
            a.connect_hole_punched(b.local_addr().unwrap(), None, &opts),
            b.connect_hole_punched(a.local_addr().unwrap(), None, &opts),
        );
        ra.unwrap();
        rb.unwrap();

        a.socket().send(b"MYMARK").await.unwrap();
        a.send(b"data").unwrap();
        b.send(b"back").unwrap();
        assert_eq!(b_rx.recv().await.unwrap(), b"data");
        assert_eq!(a_rx.recv().await.unwrap(), b"back");
        assert!(b_rx.try_recv().is_err());

        a.disconnect().await;
        b.disconnect().await;
    }

    #[tokio::test]
    async fn test_first_send_right_after_connect() {
        let (a, _a_rx) = plain().await;
        let (b, mut b_rx) = plain().await;
        b.connect(a.local_addr().unwrap()).await.unwrap();
        a.connect(b.local_addr().unwrap()).await.unwrap();
        a.send(b"first").unwrap();
        assert_eq!(b_rx.recv().await.unwrap(), b"first");
    }
}
