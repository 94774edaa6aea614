use std::time::Duration;

use tracing::Level;

// Largest application-level send. Kept below common path MTU and below the secure
// channel's own record limit so that splitting happens here and never in IP or DTLS.
pub const MTU: usize = 1200;

// How many received sequence numbers are remembered, and how many bits the ACK field has.
pub const ACK_WINDOW: usize = 64;

// u16 sequence numbers wrap around. Half the space decides which of two numbers is newer.
pub const WRAP_HALF: u16 = 32768;

// Smoothing factor of the RTT moving average.
pub const RTT_ALPHA: f64 = 0.1;

// Outstanding RTT samples older than this can never produce a useful sample.
pub const RTT_SAMPLE_MAX_AGE: Duration = Duration::from_secs(10);

// No packet for this long and the owner gets a timeout event.
pub const DEFAULT_LIVENESS_TIMEOUT: Duration = Duration::from_millis(5000);

// Send period for transports that manage congestion themselves.
pub const DEFAULT_FIXED_SEND_INTERVAL: Duration = Duration::from_millis(50);

pub const DEFAULT_HIGH_RATE_INTERVAL: Duration = Duration::from_millis(33);
pub const DEFAULT_MEDIUM_RATE_INTERVAL: Duration = Duration::from_millis(50);
pub const DEFAULT_LOW_RATE_INTERVAL: Duration = Duration::from_millis(100);

pub const DEFAULT_GOOD_RTT: Duration = Duration::from_millis(150);
pub const DEFAULT_BAD_RTT: Duration = Duration::from_millis(300);
pub const DEFAULT_CONGESTION_EVALUATION_INTERVAL: Duration = Duration::from_secs(1);

// Reliable data not ACKed within max(MIN_RESEND_TIMEOUT, avg_rtt * factor) is resent.
pub const DEFAULT_MIN_RESEND_TIMEOUT: Duration = Duration::from_millis(200);
pub const DEFAULT_RESEND_RTT_FACTOR: f64 = 2.0;

// Frame lengths above this are treated as stream desync.
pub const MAX_FRAME_LEN: usize = 10 * 1024 * 1024;

pub const STUN_MAGIC_COOKIE: u32 = 0x2112_A442;
pub const STUN_HEADER_LEN: usize = 20;
pub const DEFAULT_STUN_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun.l.google.com:19302",
    "stun1.l.google.com:19302",
    "stun.cloudflare.com:3478",
];

pub const DEFAULT_PUNCH_PACKETS: usize = 100;
pub const DEFAULT_PUNCH_INTERVAL: Duration = Duration::from_millis(50);
pub const PUNCH_MARKER: &[u8] = b"GLPUNCH";

// ~58Hz, relay layers usually only offer a poll API.
pub const DEFAULT_RELAY_POLL_INTERVAL: Duration = Duration::from_millis(17);
pub const DEFAULT_RELAY_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_PENDING_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub const LOBBY_TTL: Duration = Duration::from_secs(60);
pub const PENDING_CLIENT_MAX_AGE: Duration = Duration::from_secs(30);
pub const LOBBY_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

pub const CONGESTION_TRACING_LOG_LEVEL: Level = Level::DEBUG;
