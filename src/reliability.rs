use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap as HashMap;
use tokio::time::Instant;
use tracing::trace;

use crate::{packet::UpdatePacket, seq_nr::SeqNr};

#[derive(Debug)]
struct InFlight {
    sent_at: Instant,
    packet: UpdatePacket,
}

/// Sent packets that carried reliable data and were not ACKed yet.
#[derive(Debug, Default)]
pub struct ReliabilityLedger {
    in_flight: Mutex<HashMap<SeqNr, InFlight>>,
}

impl ReliabilityLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false (and keeps nothing) if the packet has no reliable data.
    pub fn on_send_packet(&self, seq: SeqNr, packet: &UpdatePacket, now: Instant) -> bool {
        if !packet.has_reliable_data() {
            return false;
        }
        self.in_flight.lock().insert(
            seq,
            InFlight {
                sent_at: now,
                packet: packet.clone(),
            },
        );
        true
    }

    pub fn on_ack_received(&self, seq: SeqNr) -> bool {
        let removed = self.in_flight.lock().remove(&seq).is_some();
        if removed {
            trace!(?seq, "reliable packet acked");
        }
        removed
    }

    /// Removes and returns packets that stayed unacknowledged for `timeout`, oldest first.
    pub fn take_lost(&self, now: Instant, timeout: Duration) -> Vec<UpdatePacket> {
        let mut g = self.in_flight.lock();
        let mut lost: Vec<InFlight> = Vec::new();
        g.retain(|_, f| {
            if now.saturating_duration_since(f.sent_at) >= timeout {
                lost.push(InFlight {
                    sent_at: f.sent_at,
                    packet: std::mem::take(&mut f.packet),
                });
                false
            } else {
                true
            }
        });
        lost.sort_by_key(|f| f.sent_at);
        lost.into_iter().map(|f| f.packet).collect()
    }

    pub fn len(&self) -> usize {
        self.in_flight.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
