use std::time::Duration;

use tokio::time::Instant;

use crate::{metrics::METRICS, seq_nr::SeqNr};

use super::{CongestionConfig, CongestionController, SendRate};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Congested,
    Healthy,
    Neutral,
}

/// Picks one of three send rates from RTT and the share of packets that got ACKed.
///
/// Steps down as soon as one evaluation looks congested, steps up only after several
/// healthy evaluations in a row. Never skips a rate.
#[derive(Debug)]
pub struct DiscreteRateController {
    config: CongestionConfig,
    rate: SendRate,
    window_start: Instant,
    sent_in_window: u32,
    acked_in_window: u32,
    healthy_streak: u32,
    average_rtt_ms: f64,
}

impl DiscreteRateController {
    pub fn new(config: CongestionConfig, now: Instant) -> Self {
        Self {
            rate: config.initial_rate,
            config,
            window_start: now,
            sent_in_window: 0,
            acked_in_window: 0,
            healthy_streak: 0,
            average_rtt_ms: 0.,
        }
    }

    fn verdict(&self) -> Verdict {
        let ack_ratio = (self.acked_in_window as f64 / self.sent_in_window as f64).min(1.);
        let rtt = Duration::from_secs_f64(self.average_rtt_ms.max(0.) / 1000.);
        if rtt >= self.config.bad_rtt || ack_ratio < self.config.congested_ack_ratio {
            Verdict::Congested
        } else if rtt <= self.config.good_rtt && ack_ratio >= self.config.healthy_ack_ratio {
            Verdict::Healthy
        } else {
            Verdict::Neutral
        }
    }

    fn maybe_evaluate(&mut self, now: Instant) {
        if now.saturating_duration_since(self.window_start) < self.config.evaluation_interval {
            return;
        }

        if self.sent_in_window >= self.config.min_samples.max(1) {
            let before = self.rate;
            match self.verdict() {
                Verdict::Congested => {
                    self.healthy_streak = 0;
                    self.rate = self.rate.step_down();
                }
                Verdict::Healthy => {
                    self.healthy_streak += 1;
                    if self.healthy_streak >= self.config.healthy_evaluations_before_step_up {
                        self.healthy_streak = 0;
                        self.rate = self.rate.step_up();
                    }
                }
                Verdict::Neutral => self.healthy_streak = 0,
            }
            if before != self.rate {
                METRICS.send_rate_changes.increment(1);
            }
        }

        self.window_start = now;
        self.sent_in_window = 0;
        self.acked_in_window = 0;
    }
}

impl CongestionController for DiscreteRateController {
    fn rate(&self) -> SendRate {
        self.rate
    }

    fn send_interval(&self) -> Duration {
        self.config.interval_for(self.rate)
    }

    fn on_send_packet(&mut self, now: Instant, _seq: SeqNr) {
        self.maybe_evaluate(now);
        self.sent_in_window += 1;
    }

    fn on_ack(&mut self, _now: Instant, _seq: SeqNr) {
        self.acked_in_window += 1;
    }

    fn on_receive_packet(&mut self, now: Instant, average_rtt_ms: f64) {
        self.average_rtt_ms = average_rtt_ms;
        self.maybe_evaluate(now);
    }

    fn tick(&mut self, now: Instant, average_rtt_ms: f64) {
        self.average_rtt_ms = average_rtt_ms;
        self.maybe_evaluate(now);
    }
}
