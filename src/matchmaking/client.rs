use std::{net::SocketAddr, time::Duration};

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::{
    net::UdpSocket,
    sync::mpsc::UnboundedSender,
    time::{Instant, MissedTickBehavior},
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, trace, warn};

use super::api::{
    self, CreateLobbyRequest, CreateLobbyResponse, JoinLobbyRequest, JoinLobbyResponse,
    LobbyInfo, PendingPeer,
};
use crate::{
    Error, Result,
    constants::{DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_HTTP_TIMEOUT, DEFAULT_PENDING_POLL_INTERVAL},
    metrics::METRICS,
    nat::{StunClient, StunOpts},
    utils::{FnDropGuard, spawn_with_cancel},
};

#[derive(Debug, Clone, Default)]
pub struct MatchmakingOpts {
    /// Request timeout of every HTTP call, and of opening the push channel.
    pub request_timeout: Option<Duration>,

    pub heartbeat_interval: Option<Duration>,

    /// How often pending joiners are polled for when the push channel isn't used.
    pub pending_poll_interval: Option<Duration>,

    /// Use the `/ws/{token}` push channel for pending joiners. Polling is the fallback.
    /// Defaults to true.
    pub push: Option<bool>,

    /// Sent along when creating a lobby.
    pub game_version: Option<String>,

    pub stun: StunOpts,

    /// The parent span for the heartbeat and pending-delivery tasks.
    pub parent_span: Option<tracing::Id>,
}

#[derive(Debug, Clone)]
struct ValidatedMatchmakingOpts {
    request_timeout: Duration,
    heartbeat_interval: Duration,
    pending_poll_interval: Duration,
    push: bool,
    game_version: String,
    parent_span: Option<tracing::Id>,
}

impl MatchmakingOpts {
    fn validate(&self) -> Result<ValidatedMatchmakingOpts> {
        let opts = ValidatedMatchmakingOpts {
            request_timeout: self.request_timeout.unwrap_or(DEFAULT_HTTP_TIMEOUT),
            heartbeat_interval: self.heartbeat_interval.unwrap_or(DEFAULT_HEARTBEAT_INTERVAL),
            pending_poll_interval: self
                .pending_poll_interval
                .unwrap_or(DEFAULT_PENDING_POLL_INTERVAL),
            push: self.push.unwrap_or(true),
            game_version: self.game_version.clone().unwrap_or_default(),
            parent_span: self.parent_span.clone(),
        };
        if opts.request_timeout.is_zero() {
            return Err(Error::InvalidConfig("request_timeout = 0"));
        }
        if opts.heartbeat_interval.is_zero() {
            return Err(Error::InvalidConfig("heartbeat_interval = 0"));
        }
        if opts.pending_poll_interval.is_zero() {
            return Err(Error::InvalidConfig("pending_poll_interval = 0"));
        }
        Ok(opts)
    }
}

/// What the host advertises about its lobby.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LobbySettings {
    pub name: String,
    pub public: bool,
    pub lobby_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HostState {
    #[default]
    Idle,
    /// Heartbeats and pending-joiner delivery are running.
    Hosting,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JoinState {
    #[default]
    Idle,
    Joining,
    Joined,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostedLobby {
    pub lobby_id: String,
    pub lobby_code: String,
    pub host_token: String,
    /// As discovered through STUN. None if no server answered.
    pub public_addr: Option<SocketAddr>,
}

#[derive(Default)]
struct HostSession {
    state: HostState,
    // A create_lobby call is between its state check and registering the lobby.
    creating: bool,
    lobby: Option<HostedLobby>,
    tasks: Option<CancellationToken>,
}

/// Client of the matchmaking service.
///
/// Joiners of a hosted lobby are published into the channel given at construction, once
/// or more than once each. Punching the same peer twice is harmless.
pub struct MatchmakingClient {
    http: reqwest::Client,
    base_url: String,
    opts: ValidatedMatchmakingOpts,
    stun: StunClient,
    pending_tx: UnboundedSender<PendingPeer>,
    host: Mutex<HostSession>,
    join_state: Mutex<JoinState>,
}

async fn read_body(resp: reqwest::Response) -> Result<String> {
    let status = resp.status();
    let body = resp.text().await?;
    if !status.is_success() {
        return Err(Error::Matchmaking {
            status: status.as_u16(),
            message: api::error_message(&body),
        });
    }
    Ok(body)
}

fn ws_url(base_url: &str, token: &str) -> String {
    let base = if let Some(rest) = base_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base_url.to_owned()
    };
    format!("{base}/ws/{token}")
}

impl MatchmakingClient {
    pub fn new(
        base_url: impl Into<String>,
        opts: MatchmakingOpts,
        pending_tx: UnboundedSender<PendingPeer>,
    ) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_owned();
        if base_url.is_empty() {
            return Err(Error::InvalidConfig("empty matchmaking base url"));
        }
        let stun = StunClient::new(opts.stun.clone())?;
        let opts = opts.validate()?;
        let http = reqwest::Client::builder()
            .timeout(opts.request_timeout)
            .build()?;
        Ok(Self {
            http,
            base_url,
            opts,
            stun,
            pending_tx,
            host: Mutex::new(HostSession::default()),
            join_state: Mutex::new(JoinState::Idle),
        })
    }

    pub fn host_state(&self) -> HostState {
        self.host.lock().state
    }

    pub fn join_state(&self) -> JoinState {
        *self.join_state.lock()
    }

    pub fn hosted_lobby(&self) -> Option<HostedLobby> {
        self.host.lock().lobby.clone()
    }

    /// Registers a lobby hosted on `socket` and starts heartbeats and joiner delivery.
    ///
    /// The public endpoint is discovered with STUN on `socket` itself. If that fails the
    /// lobby is registered with the local port only, and the service fills in the address
    /// it sees the request coming from.
    #[tracing::instrument(skip(self, socket))]
    pub async fn create_lobby(
        &self,
        socket: &UdpSocket,
        settings: &LobbySettings,
    ) -> Result<HostedLobby> {
        {
            let mut g = self.host.lock();
            if g.state == HostState::Hosting || g.creating {
                return Err(Error::WrongState("already hosting a lobby"));
            }
            g.creating = true;
        }
        let _creating = FnDropGuard::new(|| self.host.lock().creating = false);

        let public_addr = self.stun.discover(socket).await;
        let local_port = socket.local_addr()?.port();
        let req = CreateLobbyRequest {
            host_ip: public_addr.map(|a| a.ip()),
            host_port: public_addr.map(|a| a.port()).unwrap_or(local_port),
            name: settings.name.clone(),
            public: settings.public,
            game_version: self.opts.game_version.clone(),
            lobby_type: settings.lobby_type.clone(),
        };
        let resp = self
            .http
            .post(format!("{}/lobby", self.base_url))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(req.to_json())
            .send()
            .await?;
        let created = CreateLobbyResponse::from_json(&read_body(resp).await?)?;
        let lobby = HostedLobby {
            lobby_id: created.lobby_id,
            lobby_code: created.lobby_code,
            host_token: created.host_token,
            public_addr,
        };

        let mut g = self.host.lock();
        let cancel = CancellationToken::new();
        self.spawn_host_tasks(&lobby.host_token, cancel.clone());
        debug!(lobby_id = lobby.lobby_id, code = lobby.lobby_code, "hosting");
        g.state = HostState::Hosting;
        g.lobby = Some(lobby.clone());
        g.tasks = Some(cancel);
        Ok(lobby)
    }

    fn spawn_host_tasks(&self, token: &str, cancel: CancellationToken) {
        let parent = self.opts.parent_span.clone();
        spawn_with_cancel(
            debug_span!(parent: parent.clone(), "lobby_heartbeat"),
            cancel.clone(),
            heartbeat_loop(
                self.http.clone(),
                format!("{}/lobby/heartbeat/{token}", self.base_url),
                self.opts.heartbeat_interval,
            ),
        );
        spawn_with_cancel(
            debug_span!(parent: parent, "pending_clients"),
            cancel,
            pending_loop(
                self.http.clone(),
                format!("{}/lobby/pending/{token}", self.base_url),
                self.opts
                    .push
                    .then(|| ws_url(&self.base_url, token)),
                self.opts.pending_poll_interval,
                self.opts.request_timeout,
                self.pending_tx.clone(),
            ),
        );
    }

    /// Asks to join the lobby with id or code `key`. The service queues this client for the
    /// host to punch towards `client_port`.
    #[tracing::instrument(skip(self))]
    pub async fn join_lobby(&self, key: &str, client_port: u16) -> Result<JoinLobbyResponse> {
        {
            let mut s = self.join_state.lock();
            if *s == JoinState::Joining {
                return Err(Error::WrongState("join already in progress"));
            }
            *s = JoinState::Joining;
        }
        let mut reset = FnDropGuard::new(|| *self.join_state.lock() = JoinState::Idle);

        let resp = self
            .http
            .post(format!("{}/lobby/{key}/join", self.base_url))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(JoinLobbyRequest { client_port }.to_json())
            .send()
            .await?;
        let joined = JoinLobbyResponse::from_json(&read_body(resp).await?)?;

        reset.disarm();
        *self.join_state.lock() = JoinState::Joined;
        debug!(host = ?joined.host, lobby_type = joined.lobby_type, "joined");
        Ok(joined)
    }

    /// Stops heartbeats and joiner delivery, then deletes the lobby. Failing to delete is
    /// only logged, the service drops lobbies without heartbeats on its own.
    pub async fn close_lobby(&self) {
        let (lobby, tasks) = {
            let mut g = self.host.lock();
            if g.state != HostState::Hosting {
                return;
            }
            g.state = HostState::Closed;
            (g.lobby.take(), g.tasks.take())
        };
        if let Some(tasks) = tasks {
            tasks.cancel();
        }
        let Some(lobby) = lobby else {
            return;
        };
        let r = async {
            let resp = self
                .http
                .delete(format!("{}/lobby/{}", self.base_url, lobby.host_token))
                .send()
                .await?;
            read_body(resp).await
        }
        .await;
        match r {
            Ok(_) => debug!(lobby_id = lobby.lobby_id, "lobby closed"),
            Err(e) => warn!(lobby_id = lobby.lobby_id, "error closing lobby: {e:#}"),
        }
    }

    /// Public lobbies, optionally only of `lobby_type`.
    pub async fn list_lobbies(&self, lobby_type: Option<&str>) -> Result<Vec<LobbyInfo>> {
        let base = format!("{}/lobbies", self.base_url);
        let url = match lobby_type {
            Some(t) => reqwest::Url::parse_with_params(&base, &[("type", t)]),
            None => reqwest::Url::parse(&base),
        }
        .map_err(|_| Error::InvalidConfig("invalid matchmaking base url"))?;
        let resp = self.http.get(url).send().await?;
        Ok(LobbyInfo::list_from_json(&read_body(resp).await?))
    }

    /// Fetches pending joiners once and publishes them. Returns how many there were.
    pub async fn poll_pending_once(&self) -> Result<usize> {
        let token = self
            .host
            .lock()
            .lobby
            .as_ref()
            .map(|l| l.host_token.clone())
            .ok_or(Error::WrongState("not hosting a lobby"))?;
        let url = format!("{}/lobby/pending/{token}", self.base_url);
        let peers = fetch_pending(&self.http, &url).await?;
        let count = peers.len();
        for peer in peers {
            let _ = self.pending_tx.send(peer);
        }
        Ok(count)
    }
}

impl Drop for MatchmakingClient {
    fn drop(&mut self) {
        if let Some(tasks) = self.host.get_mut().tasks.take() {
            tasks.cancel();
        }
    }
}

async fn heartbeat_loop(http: reqwest::Client, url: String, period: Duration) -> Result<()> {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let r = async { read_body(http.post(&url).send().await?).await }.await;
        match r {
            Ok(_) => trace!("heartbeat sent"),
            Err(e) => {
                METRICS.heartbeat_failures.increment(1);
                warn!("heartbeat failed: {e:#}");
            }
        }
    }
}

async fn fetch_pending(http: &reqwest::Client, url: &str) -> Result<Vec<PendingPeer>> {
    let body = read_body(http.get(url).send().await?).await?;
    Ok(PendingPeer::list_from_json(&body))
}

async fn pending_loop(
    http: reqwest::Client,
    poll_url: String,
    push_url: Option<String>,
    poll_interval: Duration,
    connect_timeout: Duration,
    tx: UnboundedSender<PendingPeer>,
) -> Result<()> {
    if let Some(push_url) = push_url {
        match receive_pushed(&push_url, connect_timeout, &tx).await {
            Ok(()) => return Ok(()),
            Err(e) => debug!("push channel unavailable, polling instead: {e:#}"),
        }
    }

    let mut interval = tokio::time::interval(poll_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        match fetch_pending(&http, &poll_url).await {
            Ok(peers) => {
                for peer in peers {
                    if tx.send(peer).is_err() {
                        trace!("nobody is reading pending clients");
                        return Ok(());
                    }
                }
            }
            Err(e) => {
                debug_every_ms!(5000, "error polling pending clients: {e:#}");
            }
        }
    }
}

// Returns Ok only when nobody listens for joiners anymore.
async fn receive_pushed(
    url: &str,
    connect_timeout: Duration,
    tx: &UnboundedSender<PendingPeer>,
) -> Result<()> {
    let (mut ws, _) = tokio::time::timeout(connect_timeout, connect_async(url))
        .await
        .map_err(|_| Error::Timeout("push channel connect"))??;
    debug!("push channel open");
    while let Some(msg) = ws.next().await {
        match msg? {
            Message::Text(text) => match PendingPeer::from_json(text.as_str()) {
                Some(peer) => {
                    if tx.send(peer).is_err() {
                        let _ = ws.close(None).await;
                        return Ok(());
                    }
                }
                None => debug!(text = text.as_str(), "ignoring malformed push message"),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }
    Err(Error::Text("push channel closed by the service"))
}
