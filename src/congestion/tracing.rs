use std::time::Duration;

use tokio::time::Instant;

use crate::{constants::CONGESTION_TRACING_LOG_LEVEL, seq_nr::SeqNr};

use super::{CongestionController, SendRate};

/// Logs every send rate change of the wrapped controller.
#[derive(Debug)]
pub struct TracingController<I> {
    inner: I,
}

impl<I> TracingController<I> {
    pub fn new(inner: I) -> Self {
        Self { inner }
    }
}

impl<I> CongestionController for TracingController<I>
where
    I: CongestionController + 'static,
{
    fn rate(&self) -> SendRate {
        self.inner.rate()
    }

    fn send_interval(&self) -> Duration {
        self.inner.send_interval()
    }

    fn on_send_packet(&mut self, now: Instant, seq: SeqNr) {
        log_if_changed!(
            CONGESTION_TRACING_LOG_LEVEL,
            "on_send_packet",
            self,
            |s| s.inner.rate(),
            |s| s.inner.on_send_packet(now, seq)
        );
    }

    fn on_ack(&mut self, now: Instant, seq: SeqNr) {
        self.inner.on_ack(now, seq);
    }

    fn on_receive_packet(&mut self, now: Instant, average_rtt_ms: f64) {
        log_if_changed!(
            CONGESTION_TRACING_LOG_LEVEL,
            "on_receive_packet",
            self,
            |s| s.inner.rate(),
            |s| s.inner.on_receive_packet(now, average_rtt_ms)
        );
    }

    fn tick(&mut self, now: Instant, average_rtt_ms: f64) {
        log_if_changed!(
            CONGESTION_TRACING_LOG_LEVEL,
            "tick",
            self,
            |s| s.inner.rate(),
            |s| s.inner.tick(now, average_rtt_ms)
        );
    }
}
