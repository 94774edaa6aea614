use std::{collections::VecDeque, sync::Arc, time::Duration};

use parking_lot::Mutex;
use rustc_hash::FxHashMap as HashMap;
use tokio::{
    sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, trace, warn};

use crate::{
    Error, Payload, Result,
    constants::{DEFAULT_RELAY_JOIN_TIMEOUT, DEFAULT_RELAY_POLL_INTERVAL},
    metrics::METRICS,
    traits::{Capabilities, PeerId, RelayNetwork, TransportSender},
    utils::spawn_with_cancel,
};

#[derive(Debug, Clone, Default)]
pub struct RelayOpts {
    /// How often to poll the relay for received messages.
    pub poll_interval: Option<Duration>,

    /// How long `disconnect` waits for the poll loop to finish.
    pub join_timeout: Option<Duration>,

    /// The parent span for the poll loop.
    pub parent_span: Option<tracing::Id>,
}

enum Path {
    Network {
        network: Arc<dyn RelayNetwork>,
    },
    // Both ends live in this process. Sends are handed straight to the other end.
    Loopback {
        other_end: UnboundedSender<Payload>,
    },
}

/// Transport over a relay network, which orders, retransmits and paces by itself.
pub struct RelayTransport {
    path: Path,
    local: PeerId,
    remote: PeerId,
    cancel: CancellationToken,
    poll_task: Mutex<Option<JoinHandle<()>>>,
    join_timeout: Duration,
}

impl std::fmt::Debug for RelayTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayTransport")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("loopback", &self.is_loopback())
            .finish_non_exhaustive()
    }
}

impl RelayTransport {
    /// Starts polling `network` for messages from `remote`.
    pub fn connect(
        network: Arc<dyn RelayNetwork>,
        remote: PeerId,
        opts: RelayOpts,
    ) -> Result<(Self, UnboundedReceiver<Payload>)> {
        let local = network.local_peer();
        if remote == local {
            return Err(Error::InvalidConfig(
                "remote is the local peer, use RelayTransport::loopback_pair",
            ));
        }
        if !network.is_running() {
            return Err(Error::RelayStopped);
        }
        let poll_interval = opts.poll_interval.unwrap_or(DEFAULT_RELAY_POLL_INTERVAL);
        if poll_interval.is_zero() {
            return Err(Error::InvalidConfig("relay poll_interval = 0"));
        }

        let (tx, rx) = unbounded_channel();
        let cancel = CancellationToken::new();
        let handle = spawn_with_cancel(
            debug_span!(parent: opts.parent_span.clone(), "relay_poll", local, remote),
            cancel.clone(),
            poll_loop(network.clone(), remote, tx, poll_interval),
        );

        let transport = Self {
            path: Path::Network { network },
            local,
            remote,
            cancel,
            poll_task: Mutex::new(Some(handle)),
            join_timeout: opts.join_timeout.unwrap_or(DEFAULT_RELAY_JOIN_TIMEOUT),
        };
        Ok((transport, rx))
    }

    /// Two connected ends for a host talking to itself. No relay round trip, no tasks.
    pub fn loopback_pair(
        local: PeerId,
    ) -> (
        (Self, UnboundedReceiver<Payload>),
        (Self, UnboundedReceiver<Payload>),
    ) {
        let (a_tx, a_rx) = unbounded_channel();
        let (b_tx, b_rx) = unbounded_channel();
        let make = |other_end| Self {
            path: Path::Loopback { other_end },
            local,
            remote: local,
            cancel: CancellationToken::new(),
            poll_task: Mutex::new(None),
            join_timeout: DEFAULT_RELAY_JOIN_TIMEOUT,
        };
        ((make(b_tx), a_rx), (make(a_tx), b_rx))
    }

    pub fn is_loopback(&self) -> bool {
        matches!(self.path, Path::Loopback { .. })
    }

    pub fn local_peer(&self) -> PeerId {
        self.local
    }

    pub fn remote_peer(&self) -> PeerId {
        self.remote
    }

    pub fn send_with(&self, buf: &[u8], reliable: bool) -> Result<()> {
        match &self.path {
            Path::Network { network } => network.send_to_peer(self.remote, buf, reliable),
            Path::Loopback { other_end } => other_end
                .send(buf.to_vec())
                .map_err(|_| Error::NotConnected),
        }
    }

    /// Stops the poll loop, waiting for it at most the configured join timeout.
    pub async fn disconnect(&self) {
        self.cancel.cancel();
        let handle = self.poll_task.lock().take();
        let Some(handle) = handle else {
            return;
        };
        let abort = handle.abort_handle();
        if tokio::time::timeout(self.join_timeout, handle).await.is_err() {
            warn!(timeout = ?self.join_timeout, "relay poll loop didn't stop in time, aborting");
            abort.abort();
        }
    }
}

impl Drop for RelayTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl TransportSender for RelayTransport {
    fn capabilities(&self) -> Capabilities {
        Capabilities::NONE
    }

    fn send(&self, buf: &[u8]) -> Result<()> {
        self.send_with(buf, false)
    }

    fn send_reliable(&self, buf: &[u8]) -> Result<()> {
        self.send_with(buf, true)
    }
}

async fn poll_loop(
    network: Arc<dyn RelayNetwork>,
    remote: PeerId,
    incoming: UnboundedSender<Payload>,
    poll_interval: Duration,
) -> Result<()> {
    let mut interval = tokio::time::interval(poll_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        if !network.is_running() {
            debug!("relay stopped, exiting poll loop");
            return Err(Error::RelayStopped);
        }
        while let Some(data) = network.poll_recv(remote) {
            METRICS.relay_packets_received.increment(1);
            if incoming.send(data).is_err() {
                trace!("nobody is reading relayed messages");
                return Ok(());
            }
        }
    }
}

#[derive(Default)]
struct HubInner {
    stopped: bool,
    // (to, from) -> queue
    inboxes: HashMap<(PeerId, PeerId), VecDeque<Payload>>,
}

/// In-process relay network. Every peer obtained from the same hub can reach the others.
#[derive(Default)]
pub struct LocalRelayHub {
    inner: Mutex<HubInner>,
}

impl LocalRelayHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn peer(self: &Arc<Self>, id: PeerId) -> Arc<LocalRelayPeer> {
        Arc::new(LocalRelayPeer {
            hub: self.clone(),
            id,
        })
    }

    pub fn shutdown(&self) {
        let mut g = self.inner.lock();
        g.stopped = true;
        g.inboxes.clear();
    }
}

pub struct LocalRelayPeer {
    hub: Arc<LocalRelayHub>,
    id: PeerId,
}

impl RelayNetwork for LocalRelayPeer {
    fn local_peer(&self) -> PeerId {
        self.id
    }

    fn send_to_peer(&self, peer: PeerId, data: &[u8], _reliable: bool) -> Result<()> {
        let mut g = self.hub.inner.lock();
        if g.stopped {
            return Err(Error::RelayStopped);
        }
        g.inboxes
            .entry((peer, self.id))
            .or_default()
            .push_back(data.to_vec());
        Ok(())
    }

    fn poll_recv(&self, peer: PeerId) -> Option<Payload> {
        self.hub
            .inner
            .lock()
            .inboxes
            .get_mut(&(self.id, peer))?
            .pop_front()
    }

    fn is_running(&self) -> bool {
        !self.hub.inner.lock().stopped
    }
}
