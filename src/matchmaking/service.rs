//! HTTP and WebSocket front of the [`LobbyTable`].

use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    Router,
    extract::{
        ConnectInfo, Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use serde::Deserialize;
use tokio::{
    net::TcpListener,
    sync::mpsc::UnboundedReceiver,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, debug_span, trace, warn};

use super::{
    api::{self, CreateLobbyRequest, JoinLobbyRequest, LobbyInfo, PendingPeer},
    lobby_table::{LobbyTable, ServiceOpts},
};
use crate::{Result, utils::spawn_with_cancel};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

fn json(status: StatusCode, body: String) -> Response {
    (status, [(header::CONTENT_TYPE, "application/json")], body).into_response()
}

fn not_found() -> Response {
    json(StatusCode::NOT_FOUND, api::error_json("lobby not found"))
}

fn bad_request(e: impl std::fmt::Display) -> Response {
    json(StatusCode::BAD_REQUEST, api::error_json(&e.to_string()))
}

async fn create_lobby(
    State(table): State<Arc<LobbyTable>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    body: String,
) -> Response {
    match CreateLobbyRequest::from_json(&body) {
        Ok(req) => {
            let created = table.create(req, remote.ip(), Instant::now());
            json(StatusCode::OK, created.to_json())
        }
        Err(e) => bad_request(e),
    }
}

async fn join_lobby(
    State(table): State<Arc<LobbyTable>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Path(key): Path<String>,
    body: String,
) -> Response {
    let req = match JoinLobbyRequest::from_json(&body) {
        Ok(req) => req,
        Err(e) => return bad_request(e),
    };
    let client = SocketAddr::new(remote.ip(), req.client_port);
    match table.join(&key, client, Instant::now()) {
        Some(joined) => json(StatusCode::OK, joined.to_json()),
        None => not_found(),
    }
}

async fn heartbeat(State(table): State<Arc<LobbyTable>>, Path(token): Path<String>) -> Response {
    if table.heartbeat(&token, Instant::now()) {
        json(StatusCode::OK, "{}".to_owned())
    } else {
        not_found()
    }
}

async fn close_lobby(State(table): State<Arc<LobbyTable>>, Path(token): Path<String>) -> Response {
    if table.close(&token) {
        json(StatusCode::OK, "{}".to_owned())
    } else {
        not_found()
    }
}

async fn pending(State(table): State<Arc<LobbyTable>>, Path(token): Path<String>) -> Response {
    match table.take_pending(&token, Instant::now()) {
        Some(peers) => json(StatusCode::OK, PendingPeer::list_to_json(&peers)),
        None => not_found(),
    }
}

#[derive(Debug, Default, Deserialize)]
struct ListParams {
    #[serde(rename = "type")]
    lobby_type: Option<String>,
}

impl ListParams {
    fn type_filter(&self) -> Option<&str> {
        self.lobby_type.as_deref().filter(|t| !t.is_empty())
    }
}

async fn list_lobbies(
    State(table): State<Arc<LobbyTable>>,
    Query(params): Query<ListParams>,
) -> Response {
    let lobby_type = params.type_filter();
    json(
        StatusCode::OK,
        LobbyInfo::list_to_json(&table.list(lobby_type)),
    )
}

async fn subscribe(
    State(table): State<Arc<LobbyTable>>,
    Path(token): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    match table.subscribe(&token, Instant::now()) {
        Some(rx) => ws.on_upgrade(move |socket| {
            push_pending(socket, rx).instrument(debug_span!("ws_push"))
        }),
        None => not_found(),
    }
}

// Ends when the lobby goes away (its senders are dropped) or the host hangs up.
async fn push_pending(mut socket: WebSocket, mut rx: UnboundedReceiver<PendingPeer>) {
    loop {
        tokio::select! {
            peer = rx.recv() => {
                let Some(peer) = peer else {
                    trace!("lobby gone, closing push channel");
                    let _ = socket.send(Message::Close(None)).await;
                    return;
                };
                if let Err(e) = socket.send(Message::Text(peer.to_json().into())).await {
                    debug!("error pushing pending client: {e:#}");
                    return;
                }
            }
            msg = socket.recv() => match msg {
                Some(Ok(Message::Close(_))) | None => {
                    trace!("host closed push channel");
                    return;
                }
                Some(Err(e)) => {
                    debug!("push channel error: {e:#}");
                    return;
                }
                Some(Ok(_)) => {}
            }
        }
    }
}

pub fn router(table: Arc<LobbyTable>) -> Router {
    Router::new()
        .route("/lobby", post(create_lobby))
        .route("/lobby/{key}/join", post(join_lobby))
        .route("/lobby/heartbeat/{token}", post(heartbeat))
        .route("/lobby/pending/{token}", get(pending))
        .route("/lobby/{token}", delete(close_lobby))
        .route("/lobbies", get(list_lobbies))
        .route("/ws/{token}", get(subscribe))
        .with_state(table)
}

async fn sweep_loop(table: Arc<LobbyTable>) -> Result<()> {
    let mut interval = tokio::time::interval(table.opts().sweep_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let removed = table.sweep(Instant::now());
        if removed > 0 {
            debug!(removed, remaining = table.len(), "swept dead lobbies");
        }
    }
}

/// A running matchmaking service.
pub struct MatchmakingService {
    table: Arc<LobbyTable>,
    local_addr: SocketAddr,
    cancel: CancellationToken,
    server: Option<JoinHandle<()>>,
}

impl MatchmakingService {
    pub async fn bind(addr: SocketAddr, opts: ServiceOpts) -> Result<Self> {
        let table = Arc::new(LobbyTable::new(opts)?);
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let cancel = CancellationToken::new();

        spawn_with_cancel(
            debug_span!("lobby_sweep"),
            cancel.clone(),
            sweep_loop(table.clone()),
        );

        let app = router(table.clone()).into_make_service_with_connect_info::<SocketAddr>();
        let shutdown = cancel.clone();
        let server = tokio::spawn(
            async move {
                let r = axum::serve(listener, app)
                    .with_graceful_shutdown(async move { shutdown.cancelled().await })
                    .await;
                if let Err(e) = r {
                    warn!("matchmaking service error: {e:#}");
                }
            }
            .instrument(debug_span!("matchmaking_service", %local_addr)),
        );
        debug!(%local_addr, "matchmaking service listening");

        Ok(Self {
            table,
            local_addr,
            cancel,
            server: Some(server),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn table(&self) -> &Arc<LobbyTable> {
        &self.table
    }

    /// Stops accepting requests and waits a bit for open requests to finish.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        let Some(server) = self.server.take() else {
            return;
        };
        let abort = server.abort_handle();
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, server).await.is_err() {
            warn!("matchmaking service didn't stop in time, aborting");
            abort.abort();
        }
    }
}

impl Drop for MatchmakingService {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
