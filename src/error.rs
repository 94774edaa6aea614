use std::net::SocketAddr;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Text(&'static str),

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("transport is not connected")]
    NotConnected,

    #[error("no transport bound to the update scheduler")]
    TransportNotBound,

    #[error("transport capabilities differ from the ones components were created for")]
    CapabilityMismatch,

    #[error("serialized packet too large: {len} bytes (max {max})")]
    PacketTooLarge { len: usize, max: usize },

    #[error("error encoding packet: {0}")]
    Encode(&'static str),

    #[error("error decoding packet: {0}")]
    Decode(&'static str),

    #[error("error sending to {addr:?}: {source}")]
    Send {
        addr: Option<SocketAddr>,
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("timed out: {0}")]
    Timeout(&'static str),

    #[error("relay is not running")]
    RelayStopped,

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("matchmaking service returned {status}: {message}")]
    Matchmaking { status: u16, message: String },

    #[error("unexpected matchmaking response: missing {0}")]
    UnexpectedResponse(&'static str),

    #[error("matchmaking client is in the wrong state: {0}")]
    WrongState(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;

/// The closed set of reasons a connection ends, as shown to players.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    TimedOut,
    InternalError,
    InvalidConfiguration,
    Unknown,
}

impl Error {
    pub fn disconnect_reason(&self) -> DisconnectReason {
        match self {
            Error::Timeout(_) => DisconnectReason::TimedOut,
            Error::InvalidConfig(_) | Error::CapabilityMismatch => {
                DisconnectReason::InvalidConfiguration
            }
            Error::Io(_)
            | Error::Send { .. }
            | Error::RelayStopped
            | Error::NotConnected
            | Error::TransportNotBound => DisconnectReason::InternalError,
            _ => DisconnectReason::Unknown,
        }
    }
}

pub(crate) trait OptionContext<T>: Sized {
    fn context(self, msg: &'static str) -> Result<T>;
}

impl<T> OptionContext<T> for Option<T> {
    fn context(self, msg: &'static str) -> Result<T> {
        self.ok_or(Error::Text(msg))
    }
}
