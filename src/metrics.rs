use lazy_static::lazy_static;
use metrics::{Counter, Gauge, Histogram, counter, gauge, histogram};

pub struct Metrics {
    pub bytes_sent: Counter,
    pub connections: Gauge,
    pub duplicate_resends_dropped: Counter,
    pub fragments_sent: Counter,
    pub heartbeat_failures: Counter,
    pub packets_received: Counter,
    pub packets_sent: Counter,
    pub relay_packets_received: Counter,
    pub reliable_resends: Counter,
    pub rtt: Histogram,
    pub send_errors: Counter,
    pub send_rate_changes: Counter,
    pub serialize_errors: Counter,
    pub stun_failures: Counter,
    pub timeouts: Counter,
    pub undecodable_packets: Counter,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            bytes_sent: counter!("gamelink_bytes_sent"),
            connections: gauge!("gamelink_connections"),
            duplicate_resends_dropped: counter!("gamelink_duplicate_resends_dropped"),
            fragments_sent: counter!("gamelink_fragments_sent"),
            heartbeat_failures: counter!("gamelink_heartbeat_failures"),
            packets_received: counter!("gamelink_packets_received"),
            packets_sent: counter!("gamelink_packets_sent"),
            relay_packets_received: counter!("gamelink_relay_packets_received"),
            reliable_resends: counter!("gamelink_reliable_resends"),
            rtt: histogram!("gamelink_rtt_ms"),
            send_errors: counter!("gamelink_send_errors"),
            send_rate_changes: counter!("gamelink_send_rate_changes"),
            serialize_errors: counter!("gamelink_serialize_errors"),
            stun_failures: counter!("gamelink_stun_failures"),
            timeouts: counter!("gamelink_timeouts"),
            undecodable_packets: counter!("gamelink_undecodable_packets"),
        }
    }
}

lazy_static! {
    pub static ref METRICS: Metrics = Metrics::new();
}
