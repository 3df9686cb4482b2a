//! Process-level entry points: the accept loops and the client session.
//!
//! The server accepts peers repeatedly and gives each one its own interface
//! and link, served either by a pump per peer ([`serve_threaded`]) or by one
//! shared reactor ([`serve_multiplexed`]). A failing peer is logged and
//! dropped; only startup errors end the server.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::acceptor::{Acceptor, Connector, PeerTargets};
use crate::config::{Config, ConfigError, EngineConfig, EngineMode, Role};
use crate::device::{DeviceOpener, FrameDevice};
use crate::error::TunnelResult;
use crate::link::{FrameObserver, LinkId, NoopObserver, StatsSnapshot};
use crate::pump::{spawn_pump, PeerLink};

#[cfg(target_os = "linux")]
use crate::device::{AsyncOpener, RawDevice, TapOpener};
#[cfg(target_os = "linux")]
use crate::reactor::{Reactor, ReactorHandle};

/// Pause after a failed `accept` (e.g. descriptor exhaustion).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Cancel `token` when the process receives Ctrl-C.
pub fn cancel_on_ctrl_c(token: &CancellationToken) {
    let token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
            token.cancel();
        }
    });
}

/// Wait for the next peer, or `None` once `shutdown` is cancelled.
/// Transient accept failures are logged and retried.
async fn next_peer(
    acceptor: &Acceptor,
    shutdown: &CancellationToken,
) -> Option<(TcpStream, std::net::SocketAddr)> {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return None,
            accepted = acceptor.accept() => match accepted {
                Ok(pair) => return Some(pair),
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
        }
    }
}

/// Accept peers until `shutdown` is cancelled, running one pump per peer.
///
/// On shutdown every running link is stopped and awaited before returning.
pub async fn serve_threaded<O>(
    acceptor: Acceptor,
    opener: O,
    observer: Arc<dyn FrameObserver>,
    shutdown: CancellationToken,
) -> TunnelResult<()>
where
    O: DeviceOpener,
    O::Device: FrameDevice,
{
    info!(addr = %acceptor.local_addr(), "Serving peers (threaded)");
    let mut links = JoinSet::new();
    let mut next_id = 1u64;

    while let Some((stream, peer)) = next_peer(&acceptor, &shutdown).await {
        // Reap links that have already finished
        while links.try_join_next().is_some() {}

        let device = match opener.open() {
            Ok(device) => device,
            Err(e) if e.is_link_local() => {
                warn!(%peer, error = %e, "Failed to open interface for peer");
                continue;
            }
            Err(e) => {
                error!(%peer, error = %e, "Interface subsystem unavailable");
                shutdown.cancel();
                drain(&mut links).await;
                return Err(e);
            }
        };

        let id = LinkId(next_id);
        next_id += 1;
        let pump = spawn_pump(
            PeerLink::new(id, Some(peer), device, stream),
            Arc::clone(&observer),
            &shutdown,
        );
        links.spawn(pump.wait());
    }

    info!(links = links.len(), "Shutting down");
    drain(&mut links).await;
    Ok(())
}

async fn drain(links: &mut JoinSet<TunnelResult<StatsSnapshot>>) {
    while let Some(result) = links.join_next().await {
        if let Err(e) = result {
            debug!(error = %e, "Link task ended abnormally");
        }
    }
}

/// Accept peers until `shutdown` is cancelled, serving all of them from one
/// reactor thread.
#[cfg(target_os = "linux")]
pub async fn serve_multiplexed<O>(
    acceptor: Acceptor,
    opener: O,
    observer: Arc<dyn FrameObserver>,
    engine: &EngineConfig,
    shutdown: CancellationToken,
) -> TunnelResult<()>
where
    O: DeviceOpener,
    O::Device: RawDevice,
{
    info!(addr = %acceptor.local_addr(), max_events = engine.max_events, "Serving peers (multiplexed)");
    let reactor =
        Reactor::new(engine.max_events, observer)?.with_backlog_limit(engine.max_backlog_bytes);
    let reactor = ReactorHandle::spawn(reactor, &shutdown, engine.poll_interval());

    let mut result = Ok(());
    while let Some((stream, peer)) = next_peer(&acceptor, &shutdown).await {
        let device = match opener.open() {
            Ok(device) => device,
            Err(e) if e.is_link_local() => {
                warn!(%peer, error = %e, "Failed to open interface for peer");
                continue;
            }
            Err(e) => {
                error!(%peer, error = %e, "Interface subsystem unavailable");
                result = Err(e);
                break;
            }
        };

        // Stays non-blocking; the reactor never waits on a peer
        let stream = match stream.into_std() {
            Ok(stream) => stream,
            Err(e) => {
                warn!(%peer, error = %e, "Failed to prepare transport");
                continue;
            }
        };

        match reactor.attach(Some(peer), device, stream) {
            Ok(id) => debug!(link = %id, %peer, "Handed link to reactor"),
            Err(e) => {
                error!(error = %e, "Reactor is gone");
                result = Err(e);
                break;
            }
        }
    }

    reactor.shutdown().await;
    result
}

/// Dial the connector's current target once and forward until the link
/// ends. Cancelling `shutdown` stops the link.
pub async fn connect_once<O>(
    connector: &mut Connector,
    opener: &O,
    observer: Arc<dyn FrameObserver>,
    shutdown: &CancellationToken,
) -> TunnelResult<StatsSnapshot>
where
    O: DeviceOpener,
    O::Device: FrameDevice,
{
    let (stream, addr) = connector.connect_next().await?;
    let peer = stream.peer_addr().ok();
    let device = opener.open()?;
    debug!(peer = %addr, device = %device.name(), "Starting client link");

    let pump = spawn_pump(PeerLink::new(LinkId(0), peer, device, stream), observer, shutdown);
    pump.wait().await
}

/// Run a server from `config` until interrupted.
#[cfg(target_os = "linux")]
pub async fn serve(config: &Config) -> TunnelResult<()> {
    let mut config = config.clone();
    config.role = Role::Server;
    config.validate()?;

    let acceptor = Acceptor::bind(config.network.listen_addr()?, config.network.backlog)?;
    let opener = TapOpener::new(config.device.name.clone(), config.device.kind);
    let observer: Arc<dyn FrameObserver> = Arc::new(NoopObserver);

    let shutdown = CancellationToken::new();
    cancel_on_ctrl_c(&shutdown);

    match config.engine.mode {
        EngineMode::Threaded => {
            serve_threaded(acceptor, AsyncOpener::new(opener), observer, shutdown).await
        }
        EngineMode::Multiplexed => {
            serve_multiplexed(acceptor, opener, observer, &config.engine, shutdown).await
        }
    }
}

/// Connect to the peer named in `config` and forward until the link ends or
/// the process is interrupted. Never retries.
#[cfg(target_os = "linux")]
pub async fn connect(config: &Config) -> TunnelResult<StatsSnapshot> {
    let mut config = config.clone();
    config.role = Role::Client;
    config.validate()?;

    let addr = config
        .client
        .peer_address(config.network.port)
        .ok_or_else(|| ConfigError::MissingValue("client.server_address".to_string()))?;
    let targets = PeerTargets::new(addr);
    let mut connector = targets.connector();
    let opener = AsyncOpener::new(TapOpener::new(config.device.name.clone(), config.device.kind));

    let shutdown = CancellationToken::new();
    cancel_on_ctrl_c(&shutdown);

    connect_once(&mut connector, &opener, Arc::new(NoopObserver), &shutdown).await
}

/// Serve on `port` with every other setting at its default.
#[cfg(target_os = "linux")]
pub async fn run_server(port: u16) -> TunnelResult<()> {
    let mut config = Config {
        role: Role::Server,
        ..Default::default()
    };
    config.network.port = port;
    serve(&config).await
}

/// Connect to `address:port` with every other setting at its default.
#[cfg(target_os = "linux")]
pub async fn run_client(address: &str, port: u16) -> TunnelResult<StatsSnapshot> {
    let mut config = Config::default();
    config.client.server_address = Some(address.to_string());
    config.network.port = port;
    connect(&config).await
}
