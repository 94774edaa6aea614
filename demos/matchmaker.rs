use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use clap::{Parser, Subcommand};
use gamelink::{
    Connection, DefaultHooks, Payload, PlainChannel, SchedulerEvent,
    matchmaking::{
        LobbySettings, MatchmakingClient, MatchmakingOpts, MatchmakingService, ServiceOpts,
    },
    nat::HolePunchOpts,
    transport::UdpTransport,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::{
    net::UdpSocket,
    sync::mpsc::{UnboundedReceiver, unbounded_channel},
};
use tracing::{info, warn};

#[derive(Debug, Parser)]
struct Args {
    /// Expose metrics for Prometheus on this address.
    #[arg(long)]
    prometheus_listen_addr: Option<SocketAddr>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the matchmaking service.
    Serve {
        #[arg(long, default_value = "0.0.0.0:8080")]
        listen_addr: SocketAddr,

        #[arg(long, default_value_t = 60)]
        lobby_ttl_secs: u64,
    },
    /// Host a lobby and accept whoever joins.
    Host {
        #[arg(long, default_value = "http://127.0.0.1:8080")]
        url: String,

        #[arg(long, default_value = "0.0.0.0:0")]
        bind_addr: SocketAddr,

        #[arg(long, default_value = "demo lobby")]
        name: String,

        #[arg(long, default_value = "coop")]
        lobby_type: String,
    },
    /// Join a lobby by id or code and exchange a few messages with the host.
    Join {
        #[arg(long, default_value = "http://127.0.0.1:8080")]
        url: String,

        #[arg(long, default_value = "0.0.0.0:0")]
        bind_addr: SocketAddr,

        lobby: String,
    },
}

async fn serve(listen_addr: SocketAddr, lobby_ttl: Duration) -> anyhow::Result<()> {
    let service = MatchmakingService::bind(
        listen_addr,
        ServiceOpts {
            lobby_ttl: Some(lobby_ttl),
            ..Default::default()
        },
    )
    .await
    .context("error starting matchmaking service")?;
    info!(addr = %service.local_addr(), "matchmaking service running");
    tokio::signal::ctrl_c().await?;
    service.shutdown().await;
    Ok(())
}

// One-on-one: the first joiner gets punched towards from the socket the lobby was
// registered with, then the lobby is closed.
async fn host(url: String, bind_addr: SocketAddr, settings: LobbySettings) -> anyhow::Result<()> {
    let (pending_tx, mut pending_rx) = unbounded_channel();
    let client = MatchmakingClient::new(url, MatchmakingOpts::default(), pending_tx)?;
    let socket = UdpSocket::bind(bind_addr).await?;
    let lobby = client.create_lobby(&socket, &settings).await?;
    info!(id = lobby.lobby_id, code = lobby.lobby_code, public = ?lobby.public_addr, "lobby created");

    let peer = tokio::select! {
        _ = tokio::signal::ctrl_c() => None,
        peer = pending_rx.recv() => peer,
    };
    client.close_lobby().await;
    let Some(peer) = peer else {
        return Ok(());
    };

    info!(peer = %peer.addr, "punching towards joiner");
    let (transport, incoming) = UdpTransport::from_socket(socket, Arc::new(PlainChannel));
    let connection = connect(transport, incoming, peer.addr, lobby.public_addr).await?;
    tokio::signal::ctrl_c().await?;
    connection.disconnect().await;
    Ok(())
}

async fn connect(
    transport: UdpTransport,
    incoming: UnboundedReceiver<Payload>,
    remote: SocketAddr,
    own_public: Option<SocketAddr>,
) -> anyhow::Result<Connection> {
    transport
        .connect_hole_punched(remote, own_public, &HolePunchOpts::default())
        .await
        .context("hole punch failed")?;
    let (connection, mut events) = Connection::start(
        transport.into(),
        incoming,
        Default::default(),
        Arc::new(DefaultHooks),
    )?;
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                SchedulerEvent::Received(p) => {
                    for msg in p.reliable.iter() {
                        info!(%remote, "{}", String::from_utf8_lossy(msg));
                    }
                }
                SchedulerEvent::TimedOut => warn!(%remote, "peer went silent"),
            }
        }
    });
    Ok(connection)
}

async fn join(url: String, bind_addr: SocketAddr, lobby: String) -> anyhow::Result<()> {
    let (pending_tx, _pending_rx) = unbounded_channel();
    let client = MatchmakingClient::new(url, MatchmakingOpts::default(), pending_tx)?;
    let (transport, incoming) = UdpTransport::bind(bind_addr, Arc::new(PlainChannel)).await?;
    let local_port = transport.local_addr()?.port();

    let joined = client.join_lobby(&lobby, local_port).await?;
    info!(host = %joined.host, lobby_type = joined.lobby_type, "joined");

    let connection = connect(transport, incoming, joined.host, None).await?;
    for i in 0..10 {
        connection
            .scheduler()
            .push_reliable(format!("hello #{i}").into_bytes());
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    connection.disconnect().await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    if let Some(addr) = args.prometheus_listen_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("error installing prometheus exporter")?;
    }

    match args.command {
        Command::Serve {
            listen_addr,
            lobby_ttl_secs,
        } => serve(listen_addr, Duration::from_secs(lobby_ttl_secs)).await,
        Command::Host {
            url,
            bind_addr,
            name,
            lobby_type,
        } => {
            host(
                url,
                bind_addr,
                LobbySettings {
                    name,
                    public: true,
                    lobby_type,
                },
            )
            .await
        }
        Command::Join {
            url,
            bind_addr,
            lobby,
        } => join(url, bind_addr, lobby).await,
    }
}
