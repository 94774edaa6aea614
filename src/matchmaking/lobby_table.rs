use std::{
    collections::VecDeque,
    net::{IpAddr, SocketAddr},
    time::Duration,
};

use parking_lot::Mutex;
use rand::Rng;
use rustc_hash::FxHashMap as HashMap;
use tokio::{
    sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
    time::Instant,
};
use tracing::{debug, trace};

use super::api::{
    CreateLobbyRequest, CreateLobbyResponse, JoinLobbyResponse, LobbyInfo, PendingPeer,
};
use crate::{
    Error, Result,
    constants::{LOBBY_SWEEP_INTERVAL, LOBBY_TTL, PENDING_CLIENT_MAX_AGE},
};

// No 0/O or 1/I, codes get read out loud.
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const CODE_LEN: usize = 6;

#[derive(Debug, Clone, Default)]
pub struct ServiceOpts {
    /// A lobby without a heartbeat for this long is removed.
    pub lobby_ttl: Option<Duration>,

    /// Pending joiners the host didn't pick up within this are dropped.
    pub pending_max_age: Option<Duration>,

    /// How often dead lobbies are swept.
    pub sweep_interval: Option<Duration>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct ValidatedServiceOpts {
    pub lobby_ttl: Duration,
    pub pending_max_age: Duration,
    pub sweep_interval: Duration,
}

impl ServiceOpts {
    pub(crate) fn validate(&self) -> Result<ValidatedServiceOpts> {
        let opts = ValidatedServiceOpts {
            lobby_ttl: self.lobby_ttl.unwrap_or(LOBBY_TTL),
            pending_max_age: self.pending_max_age.unwrap_or(PENDING_CLIENT_MAX_AGE),
            sweep_interval: self.sweep_interval.unwrap_or(LOBBY_SWEEP_INTERVAL),
        };
        if opts.lobby_ttl.is_zero() {
            return Err(Error::InvalidConfig("lobby_ttl = 0"));
        }
        if opts.sweep_interval.is_zero() {
            return Err(Error::InvalidConfig("sweep_interval = 0"));
        }
        Ok(opts)
    }
}

struct Lobby {
    id: String,
    code: String,
    host: SocketAddr,
    name: String,
    public: bool,
    game_version: String,
    lobby_type: String,
    last_heartbeat: Instant,
    pending: VecDeque<(PendingPeer, Instant)>,
    subscribers: Vec<UnboundedSender<PendingPeer>>,
}

impl Lobby {
    fn info(&self) -> LobbyInfo {
        LobbyInfo {
            lobby_id: self.id.clone(),
            lobby_code: self.code.clone(),
            name: self.name.clone(),
            lobby_type: self.lobby_type.clone(),
            game_version: self.game_version.clone(),
        }
    }

    // Pushes to live subscribers. Queues for polling if nobody took it.
    fn notify(&mut self, peer: PendingPeer, now: Instant) {
        self.subscribers.retain(|s| s.send(peer).is_ok());
        if self.subscribers.is_empty() {
            self.pending.push_back((peer, now));
        }
    }
}

#[derive(Default)]
struct Inner {
    // Keyed by host token.
    lobbies: HashMap<String, Lobby>,
    // Lobby id and lobby code -> host token.
    keys: HashMap<String, String>,
}

impl Inner {
    fn remove(&mut self, token: &str) -> Option<Lobby> {
        let lobby = self.lobbies.remove(token)?;
        self.keys.remove(&lobby.id);
        self.keys.remove(&lobby.code);
        Some(lobby)
    }

    fn by_key_mut(&mut self, key: &str) -> Option<&mut Lobby> {
        let token = self.keys.get(key)?;
        self.lobbies.get_mut(token)
    }
}

/// Server-side table of live lobbies. Safe to share between request handlers.
pub struct LobbyTable {
    opts: ValidatedServiceOpts,
    inner: Mutex<Inner>,
}

fn random_hex<const BYTES: usize>() -> String {
    let bytes: [u8; BYTES] = rand::rng().random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn random_code() -> String {
    let mut rng = rand::rng();
    (0..CODE_LEN)
        .map(|_| CODE_ALPHABET[rng.random_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

impl LobbyTable {
    pub fn new(opts: ServiceOpts) -> Result<Self> {
        Ok(Self {
            opts: opts.validate()?,
            inner: Mutex::new(Inner::default()),
        })
    }

    #[cfg(feature = "service")]
    pub(crate) fn opts(&self) -> &ValidatedServiceOpts {
        &self.opts
    }

    /// `observed_ip` is where the request came from, used when the host couldn't tell
    /// its own public address.
    pub fn create(
        &self,
        req: CreateLobbyRequest,
        observed_ip: IpAddr,
        now: Instant,
    ) -> CreateLobbyResponse {
        let mut g = self.inner.lock();
        let id = random_hex::<8>();
        let token = random_hex::<16>();
        let code = loop {
            let code = random_code();
            if !g.keys.contains_key(&code) {
                break code;
            }
        };
        let host = SocketAddr::new(req.host_ip.unwrap_or(observed_ip), req.host_port);
        debug!(lobby_id = id, code, ?host, name = req.name, "lobby created");

        g.keys.insert(id.clone(), token.clone());
        g.keys.insert(code.clone(), token.clone());
        g.lobbies.insert(
            token.clone(),
            Lobby {
                id: id.clone(),
                code: code.clone(),
                host,
                name: req.name,
                public: req.public,
                game_version: req.game_version,
                lobby_type: req.lobby_type,
                last_heartbeat: now,
                pending: VecDeque::new(),
                subscribers: Vec::new(),
            },
        );
        CreateLobbyResponse {
            lobby_id: id,
            lobby_code: code,
            host_token: token,
        }
    }

    /// Queues `client` for the host of the lobby with id or code `key`.
    pub fn join(&self, key: &str, client: SocketAddr, now: Instant) -> Option<JoinLobbyResponse> {
        let mut g = self.inner.lock();
        let lobby = g.by_key_mut(key)?;
        debug!(lobby_id = lobby.id, ?client, "client joining");
        lobby.notify(PendingPeer { addr: client }, now);
        Some(JoinLobbyResponse {
            host: lobby.host,
            lobby_type: lobby.lobby_type.clone(),
        })
    }

    pub fn heartbeat(&self, token: &str, now: Instant) -> bool {
        match self.inner.lock().lobbies.get_mut(token) {
            Some(lobby) => {
                trace!(lobby_id = lobby.id, "heartbeat");
                lobby.last_heartbeat = now;
                true
            }
            None => false,
        }
    }

    pub fn close(&self, token: &str) -> bool {
        match self.inner.lock().remove(token) {
            Some(lobby) => {
                debug!(lobby_id = lobby.id, "lobby closed");
                true
            }
            None => false,
        }
    }

    /// Drains the pending joiners of the lobby. Entries older than the max age are dropped.
    pub fn take_pending(&self, token: &str, now: Instant) -> Option<Vec<PendingPeer>> {
        let mut g = self.inner.lock();
        let lobby = g.lobbies.get_mut(token)?;
        let max_age = self.opts.pending_max_age;
        Some(
            lobby
                .pending
                .drain(..)
                .filter(|(_, at)| now.saturating_duration_since(*at) <= max_age)
                .map(|(peer, _)| peer)
                .collect(),
        )
    }

    /// Push channel for the lobby's joiners. Whatever is already queued is sent first.
    pub fn subscribe(&self, token: &str, now: Instant) -> Option<UnboundedReceiver<PendingPeer>> {
        let mut g = self.inner.lock();
        let lobby = g.lobbies.get_mut(token)?;
        let (tx, rx) = unbounded_channel();
        let max_age = self.opts.pending_max_age;
        for (peer, _) in lobby
            .pending
            .drain(..)
            .filter(|(_, at)| now.saturating_duration_since(*at) <= max_age)
        {
            let _ = tx.send(peer);
        }
        lobby.subscribers.push(tx);
        Some(rx)
    }

    /// Public lobbies, optionally of one type only.
    pub fn list(&self, lobby_type: Option<&str>) -> Vec<LobbyInfo> {
        let g = self.inner.lock();
        let mut out: Vec<LobbyInfo> = g
            .lobbies
            .values()
            .filter(|l| l.public)
            .filter(|l| lobby_type.is_none_or(|t| l.lobby_type == t))
            .map(Lobby::info)
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.lobby_id.cmp(&b.lobby_id)));
        out
    }

    /// Removes lobbies whose host stopped sending heartbeats. Returns how many.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut g = self.inner.lock();
        let ttl = self.opts.lobby_ttl;
        let dead: Vec<String> = g
            .lobbies
            .iter()
            .filter(|(_, l)| now.saturating_duration_since(l.last_heartbeat) > ttl)
            .map(|(token, _)| token.clone())
            .collect();
        for token in dead.iter() {
            if let Some(lobby) = g.remove(token) {
                debug!(lobby_id = lobby.id, "lobby expired");
            }
        }
        dead.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().lobbies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(name: &str, public: bool, lobby_type: &str) -> CreateLobbyRequest {
        CreateLobbyRequest {
            host_ip: None,
            host_port: 7777,
            name: name.into(),
            public,
            game_version: "1.0".into(),
            lobby_type: lobby_type.into(),
        }
    }

    fn table() -> LobbyTable {
        LobbyTable::new(Default::default()).unwrap()
    }

    const OBSERVED: IpAddr = IpAddr::V4(std::net::Ipv4Addr::new(198, 51, 100, 1));

    #[test]
    fn test_create_and_join_by_id_or_code() {
        let t = table();
        let now = Instant::now();
        let created = t.create(request("a", true, "coop"), OBSERVED, now);
        assert_eq!(created.lobby_code.len(), CODE_LEN);
        assert_eq!(created.host_token.len(), 32);

        let c1: SocketAddr = "10.0.0.2:4000".parse().unwrap();
        let c2: SocketAddr = "10.0.0.3:4001".parse().unwrap();
        let joined = t.join(&created.lobby_id, c1, now).unwrap();
        assert_eq!(joined.host, SocketAddr::new(OBSERVED, 7777));
        assert_eq!(joined.lobby_type, "coop");
        t.join(&created.lobby_code, c2, now).unwrap();
        assert!(t.join("nope", c1, now).is_none());

        let pending = t.take_pending(&created.host_token, now).unwrap();
        assert_eq!(
            pending,
            vec![PendingPeer { addr: c1 }, PendingPeer { addr: c2 }]
        );
        assert!(t.take_pending(&created.host_token, now).unwrap().is_empty());
        // Lobby id is not a host token.
        assert!(t.take_pending(&created.lobby_id, now).is_none());
    }

    #[test]
    fn test_explicit_host_ip_wins() {
        let t = table();
        let mut req = request("a", true, "coop");
        req.host_ip = Some("203.0.113.7".parse().unwrap());
        let created = t.create(req, OBSERVED, Instant::now());
        let joined = t
            .join(&created.lobby_id, "10.0.0.2:1".parse().unwrap(), Instant::now())
            .unwrap();
        assert_eq!(joined.host, "203.0.113.7:7777".parse().unwrap());
    }

    #[test]
    fn test_stale_pending_dropped() {
        let t = table();
        let start = Instant::now();
        let created = t.create(request("a", true, "coop"), OBSERVED, start);
        t.join(&created.lobby_id, "10.0.0.2:1".parse().unwrap(), start)
            .unwrap();
        let later = start + PENDING_CLIENT_MAX_AGE + Duration::from_secs(1);
        t.join(&created.lobby_id, "10.0.0.3:1".parse().unwrap(), later)
            .unwrap();
        let pending = t.take_pending(&created.host_token, later).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].addr, "10.0.0.3:1".parse().unwrap());
    }

    #[test]
    fn test_sweep_respects_heartbeat() {
        let t = table();
        let start = Instant::now();
        let kept = t.create(request("kept", true, "coop"), OBSERVED, start);
        let dead = t.create(request("dead", true, "coop"), OBSERVED, start);

        let mid = start + Duration::from_secs(40);
        assert!(t.heartbeat(&kept.host_token, mid));
        assert_eq!(t.sweep(mid), 0);

        let end = start + Duration::from_secs(70);
        assert_eq!(t.sweep(end), 1);
        assert_eq!(t.len(), 1);
        assert!(!t.heartbeat(&dead.host_token, end));
        assert!(t.join(&dead.lobby_code, "10.0.0.2:1".parse().unwrap(), end).is_none());
    }

    #[test]
    fn test_list_filters_private_and_type() {
        let t = table();
        let now = Instant::now();
        t.create(request("b", true, "coop"), OBSERVED, now);
        t.create(request("a", true, "versus"), OBSERVED, now);
        t.create(request("hidden", false, "coop"), OBSERVED, now);

        let names = |v: Vec<LobbyInfo>| v.into_iter().map(|l| l.name).collect::<Vec<_>>();
        assert_eq!(names(t.list(None)), vec!["a", "b"]);
        assert_eq!(names(t.list(Some("coop"))), vec!["b"]);
        assert!(t.list(Some("race")).is_empty());
    }

    #[test]
    fn test_close() {
        let t = table();
        let created = t.create(request("a", true, "coop"), OBSERVED, Instant::now());
        assert!(t.close(&created.host_token));
        assert!(!t.close(&created.host_token));
        assert!(t.is_empty());
    }

    #[test]
    fn test_subscribers_get_queued_then_live_joiners() {
        let t = table();
        let now = Instant::now();
        let created = t.create(request("a", true, "coop"), OBSERVED, now);
        let c1: SocketAddr = "10.0.0.2:1".parse().unwrap();
        let c2: SocketAddr = "10.0.0.3:1".parse().unwrap();
        t.join(&created.lobby_id, c1, now).unwrap();

        let mut rx = t.subscribe(&created.host_token, now).unwrap();
        assert_eq!(rx.try_recv().unwrap().addr, c1);
        t.join(&created.lobby_id, c2, now).unwrap();
        assert_eq!(rx.try_recv().unwrap().addr, c2);
        // Pushed joiners aren't queued for polling again.
        assert!(t.take_pending(&created.host_token, now).unwrap().is_empty());

        // Once the subscriber is gone, joiners are queued again.
        drop(rx);
        t.join(&created.lobby_id, c1, now).unwrap();
        assert_eq!(t.take_pending(&created.host_token, now).unwrap().len(), 1);
    }

    #[test]
    fn test_invalid_opts() {
        assert!(
            LobbyTable::new(ServiceOpts {
                lobby_ttl: Some(Duration::ZERO),
                ..Default::default()
            })
            .is_err()
        );
    }
}
