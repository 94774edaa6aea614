//! Public endpoint discovery and NAT hole punching.

pub mod holepunch;
pub mod stun;

pub use holepunch::{HolePunchOpts, is_self_connect, punch};
pub use stun::{StunClient, StunOpts};
