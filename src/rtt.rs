use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap as HashMap;
use tokio::time::Instant;
use tracing::trace;

use crate::{
    constants::{RTT_ALPHA, RTT_SAMPLE_MAX_AGE},
    metrics::METRICS,
    seq_nr::SeqNr,
};

#[derive(Debug, Default)]
struct RttTrackerInner {
    // Send time of every outstanding sequence number.
    sent: HashMap<SeqNr, Instant>,
    // Milliseconds.
    average_rtt: f64,
    samples: u64,
}

/// Exponential moving average of round trip times, fed by send/ACK timestamp pairs.
///
/// Internally locked so that ACK processing does not need the scheduler's lock.
#[derive(Debug, Default)]
pub struct RttTracker {
    inner: Mutex<RttTrackerInner>,
}

impl RttTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_send_packet(&self, seq: SeqNr, now: Instant) {
        let mut g = self.inner.lock();
        g.sent
            .retain(|_, sent_at| now.saturating_duration_since(*sent_at) < RTT_SAMPLE_MAX_AGE);
        g.sent.insert(seq, now);
    }

    /// Returns the sample if `seq` was outstanding. Late, duplicate and evicted ACKs are ignored.
    pub fn on_ack_received(&self, seq: SeqNr, now: Instant) -> Option<Duration> {
        let mut g = self.inner.lock();
        let sent_at = g.sent.remove(&seq)?;
        let sample = now.saturating_duration_since(sent_at);
        let sample_ms = sample.as_secs_f64() * 1000.;
        g.average_rtt += RTT_ALPHA * (sample_ms - g.average_rtt);
        g.samples += 1;
        METRICS.rtt.record(sample_ms);
        trace!(?seq, ?sample, average_rtt = g.average_rtt, "rtt sample");
        Some(sample)
    }

    /// Smoothed RTT in milliseconds. 0 until the first sample.
    pub fn average_rtt(&self) -> f64 {
        self.inner.lock().average_rtt
    }

    pub fn average_rtt_duration(&self) -> Duration {
        Duration::from_secs_f64(self.average_rtt() / 1000.)
    }

    pub fn samples(&self) -> u64 {
        self.inner.lock().samples
    }

    pub fn outstanding(&self) -> usize {
        self.inner.lock().sent.len()
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;

    #[test]
    fn test_first_sample_moves_by_alpha() {
        let rtt = RttTracker::new();
        let start = Instant::now();
        rtt.on_send_packet(1.into(), start);
        let sample = rtt.on_ack_received(1.into(), start + Duration::from_millis(100));
        assert_eq!(sample, Some(Duration::from_millis(100)));
        assert_abs_diff_eq!(rtt.average_rtt(), 10., epsilon = 1e-9);
    }

    #[test]
    fn test_converges() {
        let rtt = RttTracker::new();
        let mut now = Instant::now();
        for seq in 0..50u16 {
            rtt.on_send_packet(seq.into(), now);
            now += Duration::from_millis(100);
            rtt.on_ack_received(seq.into(), now);
        }
        assert!((rtt.average_rtt() - 100.).abs() < 1., "{}", rtt.average_rtt());
        assert_eq!(rtt.samples(), 50);
        assert_eq!(rtt.outstanding(), 0);
    }

    #[test]
    fn test_unknown_and_duplicate_acks_are_noop() {
        let rtt = RttTracker::new();
        let now = Instant::now();
        assert_eq!(rtt.on_ack_received(7.into(), now), None);

        rtt.on_send_packet(7.into(), now);
        assert!(
            rtt.on_ack_received(7.into(), now + Duration::from_millis(50))
                .is_some()
        );
        let avg = rtt.average_rtt();
        assert_eq!(
            rtt.on_ack_received(7.into(), now + Duration::from_millis(500)),
            None
        );
        assert_eq!(rtt.average_rtt(), avg);
    }

    #[test]
    fn test_old_samples_are_pruned() {
        let rtt = RttTracker::new();
        let now = Instant::now();
        rtt.on_send_packet(1.into(), now);
        rtt.on_send_packet(2.into(), now + RTT_SAMPLE_MAX_AGE + Duration::from_millis(1));
        assert_eq!(rtt.outstanding(), 1);
        assert_eq!(
            rtt.on_ack_received(1.into(), now + RTT_SAMPLE_MAX_AGE * 2),
            None
        );
    }
}
