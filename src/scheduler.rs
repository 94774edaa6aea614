use std::{
    sync::{Arc, OnceLock, Weak},
    time::Duration,
};

use parking_lot::{Mutex, RwLock};
use tokio::{
    sync::{
        Notify,
        mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
    },
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, trace, warn};

use crate::{
    Error, Payload, Result,
    ack::{AckBitfield, ReceivedWindow},
    congestion::{CongestionConfig, CongestionController, SendRate},
    constants::{
        ACK_WINDOW, DEFAULT_FIXED_SEND_INTERVAL, DEFAULT_LIVENESS_TIMEOUT,
        DEFAULT_MIN_RESEND_TIMEOUT, DEFAULT_RESEND_RTT_FACTOR, MTU,
    },
    framing::{encode_frame, fragment},
    metrics::METRICS,
    packet::{AddonId, AddonValue, FieldId, PacketId, UpdatePacket},
    reliability::ReliabilityLedger,
    rtt::RttTracker,
    seq_nr::SeqNr,
    traits::{Capabilities, TransportSender},
    utils::spawn_with_cancel,
};

#[derive(Debug, Clone, Default)]
pub struct SchedulerOpts {
    /// Largest single transport send. Bigger packets are split.
    pub mtu: Option<usize>,

    /// Without any received packet for this long a [`SchedulerEvent::TimedOut`] is emitted.
    /// Repeats for as long as the silence lasts.
    pub liveness_timeout: Option<Duration>,

    /// Send period when the transport paces by itself.
    pub fixed_send_interval: Option<Duration>,

    /// Lower bound for considering unacknowledged reliable data lost.
    pub min_resend_timeout: Option<Duration>,

    /// Reliable data is considered lost after `average_rtt * resend_rtt_factor`.
    pub resend_rtt_factor: Option<f64>,

    pub congestion: CongestionConfig,

    /// The parent span for spawned timer tasks.
    pub parent_span: Option<tracing::Id>,

    /// If provided, this can be used to abruptly terminate all spawned tasks.
    pub cancellation_token: CancellationToken,
}

impl SchedulerOpts {
    fn validate(&self) -> Result<ValidatedSchedulerOpts> {
        let mtu = self.mtu.unwrap_or(MTU);
        if mtu == 0 {
            return Err(Error::InvalidConfig("mtu = 0"));
        }
        let liveness_timeout = self.liveness_timeout.unwrap_or(DEFAULT_LIVENESS_TIMEOUT);
        if liveness_timeout.is_zero() {
            return Err(Error::InvalidConfig("liveness_timeout = 0"));
        }
        let fixed_send_interval = self
            .fixed_send_interval
            .unwrap_or(DEFAULT_FIXED_SEND_INTERVAL);
        if fixed_send_interval.is_zero() {
            return Err(Error::InvalidConfig("fixed_send_interval = 0"));
        }
        let resend_rtt_factor = self.resend_rtt_factor.unwrap_or(DEFAULT_RESEND_RTT_FACTOR);
        if !resend_rtt_factor.is_finite() || resend_rtt_factor < 1. {
            return Err(Error::InvalidConfig("resend_rtt_factor must be >= 1"));
        }
        self.congestion.validate()?;

        Ok(ValidatedSchedulerOpts {
            mtu,
            liveness_timeout,
            fixed_send_interval,
            min_resend_timeout: self
                .min_resend_timeout
                .unwrap_or(DEFAULT_MIN_RESEND_TIMEOUT),
            resend_rtt_factor,
            congestion: self.congestion,
            parent_span: self.parent_span.clone(),
            cancellation_token: self.cancellation_token.clone(),
        })
    }
}

#[derive(Debug)]
pub(crate) struct ValidatedSchedulerOpts {
    mtu: usize,
    liveness_timeout: Duration,
    fixed_send_interval: Duration,
    min_resend_timeout: Duration,
    resend_rtt_factor: f64,
    congestion: CongestionConfig,
    parent_span: Option<tracing::Id>,
    cancellation_token: CancellationToken,
}

/// Per-connection customization of packet assembly.
#[allow(unused_variables)]
pub trait ConnectionHooks: Send + Sync + 'static {
    /// Writes the current game state into the packet about to be sent. An error skips
    /// this send cycle.
    fn populate(&self, packet: &mut UpdatePacket) -> Result<()> {
        Ok(())
    }

    /// Moves the reliable data of a presumed lost packet into the next outgoing one.
    fn resend_reliable_data(&self, next: &mut UpdatePacket, lost: &UpdatePacket) {
        next.merge_resend(lost)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHooks;

impl ConnectionHooks for DefaultHooks {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    Received(UpdatePacket),
    /// Nothing was received for the liveness timeout. The owner decides what to do.
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Updating,
}

// Created on first bind, from that transport's capabilities, and kept from then on.
#[derive(Debug)]
struct Components {
    capabilities: Capabilities,
    rtt: Option<RttTracker>,
    ledger: Option<ReliabilityLedger>,
}

struct SequenceState {
    local_seq: SeqNr,
    remote_seq: Option<SeqNr>,
    received: ReceivedWindow,
    // Sequence numbers whose reliable payload reached the application through a resend block.
    delivered_resends: ReceivedWindow,
}

#[derive(Default)]
struct Locked {
    current: UpdatePacket,
    seq: Option<SequenceState>,
    congestion: Option<Box<dyn CongestionController>>,
}

/// Owns the outgoing packet cadence of one connection and ingests its incoming packets.
pub struct UpdateScheduler {
    opts: ValidatedSchedulerOpts,
    hooks: Arc<dyn ConnectionHooks>,
    events: UnboundedSender<SchedulerEvent>,
    transport: RwLock<Option<Arc<dyn TransportSender>>>,
    components: OnceLock<Components>,
    locked: Mutex<Locked>,
    // Some while updating.
    timers: Mutex<Option<CancellationToken>>,
    liveness_reset: Arc<Notify>,
}

impl std::fmt::Debug for UpdateScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateScheduler")
            .field("components", &self.components.get())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl UpdateScheduler {
    pub fn new(
        opts: SchedulerOpts,
        hooks: Arc<dyn ConnectionHooks>,
    ) -> Result<(Arc<Self>, UnboundedReceiver<SchedulerEvent>)> {
        let opts = opts.validate()?;
        let (tx, rx) = unbounded_channel();
        let this = Arc::new(Self {
            opts,
            hooks,
            events: tx,
            transport: RwLock::new(None),
            components: OnceLock::new(),
            locked: Mutex::new(Locked::default()),
            timers: Mutex::new(None),
            liveness_reset: Arc::new(Notify::new()),
        });
        Ok((this, rx))
    }

    /// Binds the transport all sends go to. The first bind decides which components
    /// exist; later binds must have the same capabilities.
    pub fn bind_transport(&self, transport: Arc<dyn TransportSender>) -> Result<()> {
        let caps = transport.capabilities();
        {
            let mut g = self.locked.lock();
            match self.components.get() {
                Some(c) if c.capabilities != caps => {
                    debug!(old=?c.capabilities, new=?caps, "refusing to rebind");
                    return Err(Error::CapabilityMismatch);
                }
                Some(_) => {}
                None => {
                    let components = Components {
                        capabilities: caps,
                        rtt: caps.needs_rtt().then(RttTracker::new),
                        ledger: caps.needs_ledger().then(ReliabilityLedger::new),
                    };
                    if caps.requires_sequencing {
                        g.seq = Some(SequenceState {
                            local_seq: SeqNr::default(),
                            remote_seq: None,
                            received: ReceivedWindow::new(ACK_WINDOW),
                            delivered_resends: ReceivedWindow::new(ACK_WINDOW * 4),
                        });
                    }
                    if caps.needs_congestion() {
                        g.congestion = Some(self.opts.congestion.create(Instant::now()));
                    }
                    debug!(?caps, "components created");
                    let _ = self.components.set(components);
                }
            }
        }
        *self.transport.write() = Some(transport);
        Ok(())
    }

    /// Sends are skipped until another transport is bound.
    pub fn unbind_transport(&self) {
        *self.transport.write() = None;
    }

    pub fn capabilities(&self) -> Result<Capabilities> {
        if self.transport.read().is_none() {
            return Err(Error::TransportNotBound);
        }
        self.components
            .get()
            .map(|c| c.capabilities)
            .ok_or(Error::TransportNotBound)
    }

    pub fn mtu(&self) -> usize {
        self.opts.mtu
    }

    pub fn state(&self) -> SchedulerState {
        if self.timers.lock().is_some() {
            SchedulerState::Updating
        } else {
            SchedulerState::Idle
        }
    }

    /// Arms the send timer and the liveness timer.
    pub fn start(self: &Arc<Self>) {
        let mut timers = self.timers.lock();
        if timers.is_some() {
            return;
        }
        let token = self.opts.cancellation_token.child_token();

        spawn_with_cancel(
            debug_span!(parent: self.opts.parent_span.clone(), "send_timer"),
            token.clone(),
            send_loop(Arc::downgrade(self)),
        );
        spawn_with_cancel(
            debug_span!(parent: self.opts.parent_span.clone(), "liveness_timer"),
            token.clone(),
            liveness_loop(
                Arc::downgrade(self),
                self.liveness_reset.clone(),
                self.opts.liveness_timeout,
            ),
        );

        *timers = Some(token);
        debug!("started");
    }

    /// Sends one final packet and disarms both timers. Does nothing when idle.
    pub fn stop(&self) {
        let Some(token) = self.timers.lock().take() else {
            return;
        };
        self.create_and_send_packet();
        token.cancel();
        debug!("stopped");
    }

    pub fn set_field(&self, id: PacketId, value: Payload) {
        self.locked.lock().current.set_field(id, value);
    }

    pub fn set_addon_data(&self, addon: AddonId, field: FieldId, value: AddonValue) {
        self.locked.lock().current.set_addon_data(addon, field, value);
    }

    /// Queues a payload that is resent until the peer ACKs a packet carrying it.
    pub fn push_reliable(&self, payload: Payload) {
        self.locked.lock().current.push_reliable(payload);
    }

    /// Smoothed RTT in milliseconds. None if the transport doesn't need sequencing.
    pub fn average_rtt(&self) -> Option<f64> {
        Some(self.components.get()?.rtt.as_ref()?.average_rtt())
    }

    pub fn send_rate(&self) -> Option<SendRate> {
        self.locked.lock().congestion.as_ref().map(|c| c.rate())
    }

    pub fn send_interval(&self) -> Duration {
        self.locked
            .lock()
            .congestion
            .as_ref()
            .map(|c| c.send_interval())
            .unwrap_or(self.opts.fixed_send_interval)
    }

    pub fn local_seq(&self) -> Option<SeqNr> {
        self.locked.lock().seq.as_ref().map(|s| s.local_seq)
    }

    pub fn remote_seq(&self) -> Option<SeqNr> {
        self.locked.lock().seq.as_ref()?.remote_seq
    }

    /// Packets with reliable data that are neither ACKed nor considered lost yet.
    pub fn reliable_in_flight(&self) -> usize {
        self.components
            .get()
            .and_then(|c| c.ledger.as_ref())
            .map(|l| l.len())
            .unwrap_or(0)
    }

    #[tracing::instrument(level = "trace", skip_all, fields(seq = ?packet.seq))]
    pub fn on_receive_packet(&self, mut packet: UpdatePacket) {
        self.liveness_reset.notify_one();
        METRICS.packets_received.increment(1);

        let components = match self.components.get() {
            Some(c) if c.capabilities.requires_sequencing => c,
            _ => {
                let _ = self.events.send(SchedulerEvent::Received(packet));
                return;
            }
        };

        let now = Instant::now();
        let mut newly_acked = Vec::new();
        if let Some(ack) = packet.ack {
            for seq in std::iter::once(ack).chain(packet.ack_bits.acked_seqs(ack)) {
                if let Some(rtt) = components.rtt.as_ref() {
                    if rtt.on_ack_received(seq, now).is_some() {
                        newly_acked.push(seq);
                    }
                }
                if let Some(ledger) = components.ledger.as_ref() {
                    ledger.on_ack_received(seq);
                }
            }
        }
        let average_rtt = components
            .rtt
            .as_ref()
            .map(|r| r.average_rtt())
            .unwrap_or_default();

        {
            let mut g = self.locked.lock();
            if let Some(c) = g.congestion.as_mut() {
                for seq in newly_acked {
                    c.on_ack(now, seq);
                }
                c.on_receive_packet(now, average_rtt);
            }

            if let Some(s) = g.seq.as_mut() {
                let duplicate = s.received.contains(packet.seq);
                if duplicate {
                    trace!("duplicate packet, dropping its reliable data");
                    packet.reliable.clear();
                } else {
                    s.received.push(packet.seq);
                    // Late original whose payload already arrived in a later packet's resend.
                    if s.delivered_resends.contains(packet.seq) && !packet.reliable.is_empty() {
                        trace!("reliable data already delivered as a resend, dropping");
                        METRICS.duplicate_resends_dropped.increment(1);
                        packet.reliable.clear();
                    }
                }

                let dropped = packet.drop_resends(|seq| {
                    s.received.contains(seq) || s.delivered_resends.contains(seq)
                });
                if dropped > 0 {
                    trace!(dropped, "dropped already delivered resends");
                    METRICS.duplicate_resends_dropped.increment(dropped as u64);
                }
                for block in packet.resend.iter() {
                    s.delivered_resends.push(block.seq);
                }

                match s.remote_seq {
                    Some(remote) if !packet.seq.is_greater_than(remote) => {}
                    _ => s.remote_seq = Some(packet.seq),
                }
            }
        }

        let _ = self.events.send(SchedulerEvent::Received(packet));
    }

    fn resend_timeout(&self, rtt: &RttTracker) -> Duration {
        let by_rtt = rtt
            .average_rtt_duration()
            .mul_f64(self.opts.resend_rtt_factor);
        by_rtt.max(self.opts.min_resend_timeout)
    }

    /// Assembles the pending packet and sends it. Called by the send timer, and once by
    /// [`Self::stop`].
    pub fn create_and_send_packet(&self) {
        let Some(transport) = self.transport.read().clone() else {
            warn_every_ms!(5000, "no transport bound, skipping send");
            return;
        };
        let now = Instant::now();
        let components = self.components.get();
        let rtt = components.and_then(|c| c.rtt.as_ref());
        let ledger = components.and_then(|c| c.ledger.as_ref());

        let (bytes, packet) = {
            let mut g = self.locked.lock();

            if let (Some(ledger), Some(rtt)) = (ledger, rtt) {
                let lost = ledger.take_lost(now, self.resend_timeout(rtt));
                for lost in lost.iter() {
                    trace!(seq = ?lost.seq, "reliable data presumed lost, resending");
                    METRICS.reliable_resends.increment(1);
                    self.hooks.resend_reliable_data(&mut g.current, lost);
                }
            }

            let mut packet = std::mem::take(&mut g.current);
            if let Some(s) = g.seq.as_ref() {
                packet.seq = s.local_seq;
                packet.ack = s.remote_seq;
                packet.ack_bits = match s.remote_seq {
                    Some(ack) => AckBitfield::build(ack, &s.received),
                    None => AckBitfield::default(),
                };
            }

            let bytes = match self
                .hooks
                .populate(&mut packet)
                .and_then(|_| packet.serialize())
            {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn_every_ms!(1000, error = %e, "error creating packet, skipping this send");
                    METRICS.serialize_errors.increment(1);
                    packet.carry_over_into(&mut g.current);
                    return;
                }
            };

            let average_rtt = rtt.map(|r| r.average_rtt()).unwrap_or_default();
            let seq = packet.seq;
            if let Some(c) = g.congestion.as_mut() {
                c.tick(now, average_rtt);
                c.on_send_packet(now, seq);
            }
            if let Some(s) = g.seq.as_mut() {
                s.local_seq += 1;
            }
            (bytes, packet)
        };

        if let Some(rtt) = rtt {
            rtt.on_send_packet(packet.seq, now);
        }
        let reliable = match ledger {
            Some(ledger) => ledger.on_send_packet(packet.seq, &packet, now),
            None => packet.has_reliable_data(),
        };

        let framed = match encode_frame(&bytes) {
            Ok(f) => f,
            Err(e) => {
                warn!(error = %e, "error framing packet");
                return;
            }
        };

        let mut fragments = 0;
        for chunk in fragment(&framed, self.opts.mtu) {
            let res = if reliable {
                transport.send_reliable(chunk)
            } else {
                transport.send(chunk)
            };
            if let Err(e) = res {
                METRICS.send_errors.increment(1);
                warn_every_ms!(1000, error = %e, "error sending packet");
                return;
            }
            fragments += 1;
        }

        METRICS.packets_sent.increment(1);
        METRICS.bytes_sent.increment(framed.len() as u64);
        if fragments > 1 {
            METRICS.fragments_sent.increment(fragments);
        }
        trace!(seq = ?packet.seq, len = framed.len(), fragments, reliable, "sent");
    }

    fn on_liveness_timeout(&self) {
        debug!(timeout = ?self.opts.liveness_timeout, "nothing received, timed out");
        METRICS.timeouts.increment(1);
        let _ = self.events.send(SchedulerEvent::TimedOut);
    }

    #[cfg(test)]
    pub(crate) fn has_sequence_state(&self) -> bool {
        let g = self.locked.lock();
        g.seq.is_some() || g.congestion.is_some()
    }
}

impl Drop for UpdateScheduler {
    fn drop(&mut self) {
        if let Some(token) = self.timers.get_mut().take() {
            token.cancel();
        }
    }
}

async fn send_loop(this: Weak<UpdateScheduler>) -> Result<()> {
    let mut applied = match this.upgrade() {
        Some(this) => this.send_interval(),
        None => return Ok(()),
    };
    let mut interval = tokio::time::interval_at(Instant::now() + applied, applied);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        let Some(this) = this.upgrade() else {
            return Ok(());
        };
        this.create_and_send_packet();

        let wanted = this.send_interval();
        if wanted != applied {
            debug!(?applied, ?wanted, "send interval changed");
            applied = wanted;
            interval = tokio::time::interval_at(Instant::now() + applied, applied);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }
    }
}

async fn liveness_loop(
    this: Weak<UpdateScheduler>,
    reset: Arc<Notify>,
    timeout: Duration,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = reset.notified() => continue,
            _ = tokio::time::sleep(timeout) => {
                let Some(this) = this.upgrade() else {
                    return Ok(());
                };
                this.on_liveness_timeout();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::{
        framing::FrameDecoder,
        packet::ResendBlock,
        test_util::{MockSender, setup_test_logging},
    };

    use super::*;

    fn new_scheduler() -> (Arc<UpdateScheduler>, UnboundedReceiver<SchedulerEvent>) {
        UpdateScheduler::new(SchedulerOpts::default(), Arc::new(DefaultHooks)).unwrap()
    }

    fn decode_all(sender: &MockSender) -> Vec<UpdatePacket> {
        let mut d = FrameDecoder::default();
        sender
            .take_sent()
            .into_iter()
            .flat_map(|(chunk, _)| d.feed(&chunk))
            .map(|b| UpdatePacket::deserialize(&b).unwrap())
            .collect()
    }

    fn received(rx: &mut UnboundedReceiver<SchedulerEvent>) -> Vec<UpdatePacket> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            if let SchedulerEvent::Received(p) = ev {
                out.push(p);
            }
        }
        out
    }

    #[test]
    fn test_capabilities_before_bind() {
        let (s, _rx) = new_scheduler();
        assert!(matches!(s.capabilities(), Err(Error::TransportNotBound)));
    }

    #[tokio::test]
    async fn test_no_transport_skips_send() {
        setup_test_logging();
        let (s, _rx) = new_scheduler();
        s.push_reliable(b"x".to_vec());
        s.create_and_send_packet();
        // Nothing was consumed.
        s.bind_transport(MockSender::new(Capabilities::ALL)).unwrap();
        s.create_and_send_packet();
    }

    #[tokio::test]
    async fn test_capability_gating() {
        let (s, mut rx) = new_scheduler();
        let sender = MockSender::new(Capabilities {
            requires_sequencing: false,
            ..Capabilities::ALL
        });
        s.bind_transport(sender.clone()).unwrap();
        assert!(!s.has_sequence_state());
        assert_eq!(s.average_rtt(), None);
        assert_eq!(s.send_rate(), None);
        assert_eq!(s.send_interval(), DEFAULT_FIXED_SEND_INTERVAL);

        let packet = UpdatePacket {
            seq: 9.into(),
            ack: Some(3.into()),
            resend: vec![ResendBlock {
                seq: 1.into(),
                payloads: vec![b"r".to_vec()],
            }],
            ..Default::default()
        };
        s.on_receive_packet(packet.clone());
        assert_eq!(received(&mut rx), vec![packet]);
        assert_eq!(s.remote_seq(), None);
        assert_eq!(s.local_seq(), None);

        s.create_and_send_packet();
        let sent = decode_all(&sender);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].seq, SeqNr::default());
        assert_eq!(sent[0].ack, None);
    }

    #[tokio::test]
    async fn test_rebind_with_other_capabilities() {
        let (s, _rx) = new_scheduler();
        s.bind_transport(MockSender::new(Capabilities::ALL)).unwrap();
        s.bind_transport(MockSender::new(Capabilities::ALL)).unwrap();
        assert!(matches!(
            s.bind_transport(MockSender::new(Capabilities::NONE)),
            Err(Error::CapabilityMismatch)
        ));
        s.unbind_transport();
        assert!(matches!(s.capabilities(), Err(Error::TransportNotBound)));
    }

    #[tokio::test]
    async fn test_stamps_seq_ack_and_bits() {
        let (s, _rx) = new_scheduler();
        let sender = MockSender::new(Capabilities::ALL);
        s.bind_transport(sender.clone()).unwrap();

        for seq in [10u16, 12, 13, 15] {
            s.on_receive_packet(UpdatePacket {
                seq: seq.into(),
                ..Default::default()
            });
        }
        // Stale, must not regress the remote sequence.
        s.on_receive_packet(UpdatePacket {
            seq: 14.into(),
            ..Default::default()
        });
        assert_eq!(s.remote_seq(), Some(15.into()));

        s.create_and_send_packet();
        s.create_and_send_packet();
        let sent = decode_all(&sender);
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].seq, 0.into());
        assert_eq!(sent[1].seq, 1.into());
        assert_eq!(sent[0].ack, Some(15.into()));
        let mut acked: Vec<u16> = sent[0].ack_bits.acked_seqs(15.into()).map(|s| *s).collect();
        acked.sort();
        assert_eq!(acked, vec![10, 12, 13, 14]);
        assert_eq!(s.local_seq(), Some(2.into()));
    }

    #[tokio::test]
    async fn test_duplicate_resend_suppressed() {
        let (s, mut rx) = new_scheduler();
        s.bind_transport(MockSender::new(Capabilities::ALL)).unwrap();

        let mut original = UpdatePacket {
            seq: 7.into(),
            ..Default::default()
        };
        original.push_reliable(b"once".to_vec());
        s.on_receive_packet(original);

        let later = UpdatePacket {
            seq: 8.into(),
            resend: vec![
                ResendBlock {
                    seq: 7.into(),
                    payloads: vec![b"once".to_vec()],
                },
                ResendBlock {
                    seq: 5.into(),
                    payloads: vec![b"lost".to_vec()],
                },
            ],
            ..Default::default()
        };
        s.on_receive_packet(later.clone());
        // The same resend of 5 arriving again through another packet.
        s.on_receive_packet(UpdatePacket {
            seq: 9.into(),
            ..later
        });

        let got = received(&mut rx);
        assert_eq!(got.len(), 3);
        assert_eq!(got[0].reliable, vec![b"once".to_vec()]);
        assert_eq!(
            got[1].resend,
            vec![ResendBlock {
                seq: 5.into(),
                payloads: vec![b"lost".to_vec()]
            }]
        );
        assert!(got[2].resend.is_empty());
    }

    #[tokio::test]
    async fn test_late_original_after_its_resend() {
        let (s, mut rx) = new_scheduler();
        s.bind_transport(MockSender::new(Capabilities::ALL)).unwrap();

        s.on_receive_packet(UpdatePacket {
            seq: 8.into(),
            resend: vec![ResendBlock {
                seq: 7.into(),
                payloads: vec![b"x".to_vec()],
            }],
            ..Default::default()
        });
        let mut late = UpdatePacket {
            seq: 7.into(),
            ..Default::default()
        };
        late.push_reliable(b"x".to_vec());
        s.on_receive_packet(late);

        let got = received(&mut rx);
        assert_eq!(got.len(), 2);
        let deliveries = got
            .iter()
            .flat_map(|p| {
                p.reliable
                    .iter()
                    .chain(p.resend.iter().flat_map(|b| b.payloads.iter()))
            })
            .filter(|payload| payload.as_slice() == b"x")
            .count();
        assert_eq!(deliveries, 1);
        assert!(got[1].reliable.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_packet_reliable_dropped() {
        let (s, mut rx) = new_scheduler();
        s.bind_transport(MockSender::new(Capabilities::ALL)).unwrap();
        let mut p = UpdatePacket {
            seq: 3.into(),
            ..Default::default()
        };
        p.push_reliable(b"a".to_vec());
        s.on_receive_packet(p.clone());
        s.on_receive_packet(p);
        let got = received(&mut rx);
        assert_eq!(got[0].reliable.len(), 1);
        assert!(got[1].reliable.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_reliable_rides_next_packet() {
        let (s, _rx) = new_scheduler();
        let sender = MockSender::new(Capabilities::ALL);
        s.bind_transport(sender.clone()).unwrap();

        s.push_reliable(b"important".to_vec());
        s.create_and_send_packet();
        assert_eq!(s.reliable_in_flight(), 1);
        let first = decode_all(&sender);
        assert_eq!(first[0].reliable, vec![b"important".to_vec()]);

        tokio::time::advance(DEFAULT_MIN_RESEND_TIMEOUT + Duration::from_millis(1)).await;
        s.create_and_send_packet();
        let second = decode_all(&sender);
        assert_eq!(second[0].seq, 1.into());
        assert!(second[0].reliable.is_empty());
        assert_eq!(
            second[0].resend,
            vec![ResendBlock {
                seq: 0.into(),
                payloads: vec![b"important".to_vec()]
            }]
        );
        // The packet carrying the resend is tracked itself.
        assert_eq!(s.reliable_in_flight(), 1);

        // ACK of packet 1 settles everything.
        s.on_receive_packet(UpdatePacket {
            seq: 0.into(),
            ack: Some(1.into()),
            ..Default::default()
        });
        assert_eq!(s.reliable_in_flight(), 0);
    }

    #[tokio::test]
    async fn test_acked_reliable_is_not_resent() {
        let (s, _rx) = new_scheduler();
        let sender = MockSender::new(Capabilities::ALL);
        s.bind_transport(sender.clone()).unwrap();
        s.push_reliable(b"x".to_vec());
        s.create_and_send_packet();
        s.on_receive_packet(UpdatePacket {
            seq: 0.into(),
            ack: Some(0.into()),
            ..Default::default()
        });
        assert_eq!(s.reliable_in_flight(), 0);
        assert!(s.average_rtt().is_some());
    }

    #[tokio::test]
    async fn test_large_packet_is_fragmented_reliably() {
        let (s, _rx) = new_scheduler();
        let sender = MockSender::new(Capabilities::ALL);
        s.bind_transport(sender.clone()).unwrap();
        s.push_reliable(vec![0xab; 3000]);
        s.create_and_send_packet();

        let sent = sender.take_sent();
        assert_eq!(sent.len(), 3);
        assert!(sent.iter().all(|(_, reliable)| *reliable));
        assert!(sent.iter().take(2).all(|(chunk, _)| chunk.len() == MTU));

        let mut d = FrameDecoder::default();
        let frames: Vec<_> = sent.iter().flat_map(|(c, _)| d.feed(c)).collect();
        assert_eq!(frames.len(), 1);
        let p = UpdatePacket::deserialize(&frames[0]).unwrap();
        assert_eq!(p.reliable, vec![vec![0xab; 3000]]);
    }

    struct FailingHooks;

    impl ConnectionHooks for FailingHooks {
        fn populate(&self, _packet: &mut UpdatePacket) -> Result<()> {
            Err(Error::Encode("game state unavailable"))
        }
    }

    #[tokio::test]
    async fn test_populate_failure_keeps_addons() {
        let (s, _rx) =
            UpdateScheduler::new(SchedulerOpts::default(), Arc::new(FailingHooks)).unwrap();
        let sender = MockSender::new(Capabilities::ALL);
        s.bind_transport(sender.clone()).unwrap();

        s.set_addon_data(1, 1, AddonValue::Collection(vec![b"a".to_vec()]));
        s.push_reliable(b"r".to_vec());
        s.create_and_send_packet();
        assert!(sender.take_sent().is_empty());
        assert_eq!(s.local_seq(), Some(0.into()));

        s.set_addon_data(1, 1, AddonValue::Bytes(b"b".to_vec()));
        let g = s.locked.lock();
        assert_eq!(
            g.current.addons[&1][&1],
            AddonValue::Collection(vec![b"a".to_vec(), b"b".to_vec()])
        );
        assert_eq!(g.current.reliable, vec![b"r".to_vec()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timers() {
        setup_test_logging();
        let (s, mut rx) = new_scheduler();
        let sender = MockSender::new(Capabilities::ALL);
        s.bind_transport(sender.clone()).unwrap();
        assert_eq!(s.state(), SchedulerState::Idle);

        s.start();
        s.start();
        assert_eq!(s.state(), SchedulerState::Updating);

        tokio::time::sleep(Duration::from_millis(1020)).await;
        let sent = decode_all(&sender).len();
        assert!((18..=21).contains(&sent), "sent={sent}");

        // Keep it alive for a while, then go silent.
        for _ in 0..10 {
            s.on_receive_packet(UpdatePacket::default());
            tokio::time::sleep(Duration::from_millis(1000)).await;
        }
        assert!(received(&mut rx).len() == 10);

        tokio::time::sleep(DEFAULT_LIVENESS_TIMEOUT * 2 + Duration::from_millis(100)).await;
        let mut timeouts = 0;
        while let Ok(ev) = rx.try_recv() {
            if ev == SchedulerEvent::TimedOut {
                timeouts += 1;
            }
        }
        assert_eq!(timeouts, 2);

        s.stop();
        assert_eq!(s.state(), SchedulerState::Idle);
        // The final flush.
        assert!(!sender.take_sent().is_empty());
        s.stop();
        assert!(sender.take_sent().is_empty());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(sender.take_sent().is_empty());
    }
}
