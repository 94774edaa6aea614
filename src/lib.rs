//! Peer-to-peer transport for game state updates.
//!
//! An [`UpdateScheduler`] sends one [`UpdatePacket`] per tick over whatever transport it is
//! bound to, and adds sequencing, selective reliability and congestion control only when
//! that transport doesn't provide them itself. Around it: NAT traversal (STUN and hole
//! punching) and a matchmaking client and service to find the peer in the first place.

#[macro_use]
mod macros;

mod ack;
mod congestion;
mod connection;
mod constants;
#[cfg(test)]
mod e2e_tests;
mod error;
pub mod framing;
mod id_alloc;
mod manager;
pub mod matchmaking;
mod metrics;
pub mod nat;
mod packet;
mod reliability;
mod rtt;
mod scheduler;
mod seq_nr;
#[cfg(test)]
mod test_util;
mod traits;
pub mod transport;
mod utils;

pub use ack::{AckBitfield, ReceivedWindow};
pub use congestion::{
    CongestionConfig, CongestionController, SendRate, discrete::DiscreteRateController,
};
pub use connection::Connection;
pub use constants::{ACK_WINDOW, MTU};
pub use error::{DisconnectReason, Error, Result};
pub use id_alloc::{ClientId, ClientIdAllocator};
pub use manager::{ConnectionManager, ManagerEvent};
pub use packet::{AddonId, AddonValue, FieldId, PacketId, ResendBlock, UpdatePacket};
pub use reliability::ReliabilityLedger;
pub use rtt::RttTracker;
pub use scheduler::{
    ConnectionHooks, DefaultHooks, SchedulerEvent, SchedulerOpts, SchedulerState, UpdateScheduler,
};
pub use seq_nr::{SeqNr, is_greater};
pub use traits::{
    Capabilities, PeerId, PlainChannel, RelayNetwork, SecureChannel, TransportSender,
};
pub use transport::Transport;

pub type Payload = Vec<u8>;
