//! Lobby matchmaking: the client a host or joiner runs, and the service it talks to.

pub mod api;
mod client;
pub mod json;
mod lobby_table;
#[cfg(feature = "service")]
mod service;

pub use api::{JoinLobbyResponse, LobbyInfo, PendingPeer};
pub use client::{
    HostState, HostedLobby, JoinState, LobbySettings, MatchmakingClient, MatchmakingOpts,
};
pub use lobby_table::{LobbyTable, ServiceOpts};
#[cfg(feature = "service")]
pub use service::{MatchmakingService, router};
