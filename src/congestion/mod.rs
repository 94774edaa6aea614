pub mod discrete;
pub mod tracing;

use std::time::Duration;

use tokio::time::Instant;

use crate::{
    Error, Result,
    constants::{
        DEFAULT_BAD_RTT, DEFAULT_CONGESTION_EVALUATION_INTERVAL, DEFAULT_GOOD_RTT,
        DEFAULT_HIGH_RATE_INTERVAL, DEFAULT_LOW_RATE_INTERVAL, DEFAULT_MEDIUM_RATE_INTERVAL,
    },
    seq_nr::SeqNr,
};

/// The named send rates a connection can be in. There is nothing in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SendRate {
    Low,
    Medium,
    High,
}

impl SendRate {
    pub fn step_up(self) -> Self {
        match self {
            SendRate::Low => SendRate::Medium,
            SendRate::Medium | SendRate::High => SendRate::High,
        }
    }

    pub fn step_down(self) -> Self {
        match self {
            SendRate::High => SendRate::Medium,
            SendRate::Medium | SendRate::Low => SendRate::Low,
        }
    }
}

#[allow(unused_variables)]
pub trait CongestionController: Send + Sync + core::fmt::Debug {
    fn rate(&self) -> SendRate;

    /// Period of the send timer for the current rate.
    fn send_interval(&self) -> Duration;

    fn on_send_packet(&mut self, now: Instant, seq: SeqNr);

    /// Called once per newly ACKed sequence number.
    fn on_ack(&mut self, now: Instant, seq: SeqNr);

    fn on_receive_packet(&mut self, now: Instant, average_rtt_ms: f64);

    /// Called by the send timer so that silence is noticed too.
    fn tick(&mut self, now: Instant, average_rtt_ms: f64) {}
}

/// Thresholds of the discrete rate policy. These are tuning knobs, not protocol.
#[derive(Debug, Clone, Copy)]
pub struct CongestionConfig {
    pub high_rate_interval: Duration,
    pub medium_rate_interval: Duration,
    pub low_rate_interval: Duration,
    pub initial_rate: SendRate,

    /// RTT at or below which the link counts as healthy.
    pub good_rtt: Duration,
    /// RTT at or above which the link counts as congested.
    pub bad_rtt: Duration,

    /// Share of sent packets that must be ACKed in an evaluation to count as healthy.
    pub healthy_ack_ratio: f64,
    /// Below this share the rate steps down.
    pub congested_ack_ratio: f64,

    pub evaluation_interval: Duration,
    /// Evaluations with fewer sent packets than this are skipped.
    pub min_samples: u32,
    /// Consecutive healthy evaluations needed before stepping up.
    pub healthy_evaluations_before_step_up: u32,

    /// Log every rate change.
    pub tracing: bool,
}

impl Default for CongestionConfig {
    fn default() -> Self {
        Self {
            high_rate_interval: DEFAULT_HIGH_RATE_INTERVAL,
            medium_rate_interval: DEFAULT_MEDIUM_RATE_INTERVAL,
            low_rate_interval: DEFAULT_LOW_RATE_INTERVAL,
            initial_rate: SendRate::Medium,
            good_rtt: DEFAULT_GOOD_RTT,
            bad_rtt: DEFAULT_BAD_RTT,
            healthy_ack_ratio: 0.9,
            congested_ack_ratio: 0.75,
            evaluation_interval: DEFAULT_CONGESTION_EVALUATION_INTERVAL,
            min_samples: 5,
            healthy_evaluations_before_step_up: 3,
            tracing: true,
        }
    }
}

impl CongestionConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.high_rate_interval.is_zero() {
            return Err(Error::InvalidConfig("high_rate_interval = 0"));
        }
        if !(self.high_rate_interval <= self.medium_rate_interval
            && self.medium_rate_interval <= self.low_rate_interval)
        {
            return Err(Error::InvalidConfig(
                "rate intervals must satisfy high <= medium <= low",
            ));
        }
        if self.good_rtt > self.bad_rtt {
            return Err(Error::InvalidConfig("good_rtt > bad_rtt"));
        }
        if !(0. ..=1.).contains(&self.healthy_ack_ratio)
            || !(0. ..=1.).contains(&self.congested_ack_ratio)
            || self.congested_ack_ratio > self.healthy_ack_ratio
        {
            return Err(Error::InvalidConfig(
                "ack ratios must be within 0..=1 and congested <= healthy",
            ));
        }
        if self.evaluation_interval.is_zero() {
            return Err(Error::InvalidConfig("evaluation_interval = 0"));
        }
        Ok(())
    }

    pub fn interval_for(&self, rate: SendRate) -> Duration {
        match rate {
            SendRate::High => self.high_rate_interval,
            SendRate::Medium => self.medium_rate_interval,
            SendRate::Low => self.low_rate_interval,
        }
    }

    pub(crate) fn create(&self, now: Instant) -> Box<dyn CongestionController> {
        use self::discrete::DiscreteRateController;
        use self::tracing::TracingController;

        let controller = DiscreteRateController::new(*self, now);
        if self.tracing {
            ::tracing::debug!("enabling congestion tracing");
            Box::new(TracingController::new(controller))
        } else {
            Box::new(controller)
        }
    }
}
