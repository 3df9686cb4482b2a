//! Establishing peer transports: listening, accepting and dialing.
//!
//! The listening socket is built with `socket2` so that a failed `bind` and a
//! failed `listen` surface as different errors; both are fatal at startup.
//! Dialing never retries here. Reconnect policy belongs to the caller, which
//! can publish new addresses through [`PeerTargets`].

use std::net::SocketAddr;
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, instrument};

use crate::error::{TunnelError, TunnelResult};

/// Default listen backlog.
pub const DEFAULT_BACKLOG: u32 = 128;

/// A bound, listening TCP socket.
#[derive(Debug)]
pub struct Acceptor {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Acceptor {
    /// Bind and listen on `addr`. Must be called inside a tokio runtime.
    pub fn bind(addr: SocketAddr, backlog: u32) -> TunnelResult<Self> {
        let bind_err = |source| TunnelError::Bind { addr, source };
        let listen_err = |source| TunnelError::Listen { addr, source };

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(bind_err)?;
        socket.set_reuse_address(true).map_err(bind_err)?;
        socket.set_nonblocking(true).map_err(bind_err)?;
        socket.bind(&addr.into()).map_err(bind_err)?;

        let backlog = i32::try_from(backlog).unwrap_or(i32::MAX);
        socket.listen(backlog).map_err(listen_err)?;

        let listener = TcpListener::from_std(socket.into()).map_err(listen_err)?;
        let local_addr = listener.local_addr().map_err(listen_err)?;
        info!(%local_addr, backlog, "Listening for peers");

        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Address actually bound (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the next peer.
    pub async fn accept(&self) -> TunnelResult<(TcpStream, SocketAddr)> {
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        info!(%peer, "Accepted peer");
        Ok((stream, peer))
    }
}

/// Dial `addr` once.
#[instrument(level = "debug")]
pub async fn connect(addr: &str) -> TunnelResult<TcpStream> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|source| TunnelError::Connect {
            addr: addr.to_string(),
            source,
        })?;
    stream.set_nodelay(true)?;
    info!(peer = %addr, "Connected to peer");
    Ok(stream)
}

/// Publisher side of the peer-address feed.
///
/// An external component (discovery, a control plane, the CLI) sets the
/// address to dial; every [`Connector`] created from it sees the latest value.
#[derive(Debug, Clone)]
pub struct PeerTargets {
    tx: Arc<watch::Sender<String>>,
}

impl PeerTargets {
    pub fn new(initial: impl Into<String>) -> Self {
        let (tx, _rx) = watch::channel(initial.into());
        Self { tx: Arc::new(tx) }
    }

    /// Replace the current target. Connections already established are not
    /// affected.
    pub fn update(&self, addr: impl Into<String>) {
        let addr = addr.into();
        debug!(target_addr = %addr, "Peer target updated");
        self.tx.send_replace(addr);
    }

    pub fn current(&self) -> String {
        self.tx.borrow().clone()
    }

    pub fn connector(&self) -> Connector {
        Connector {
            rx: self.tx.subscribe(),
        }
    }
}

/// Dials whatever address [`PeerTargets`] currently holds.
#[derive(Debug, Clone)]
pub struct Connector {
    rx: watch::Receiver<String>,
}

impl Connector {
    /// The address the next call to [`Connector::connect_next`] will use.
    pub fn target(&self) -> String {
        self.rx.borrow().clone()
    }

    /// Dial the most recent target once.
    pub async fn connect_next(&mut self) -> TunnelResult<(TcpStream, String)> {
        let addr = self.rx.borrow_and_update().clone();
        let stream = connect(&addr).await?;
        Ok((stream, addr))
    }

    /// Wait until the target differs from the one last dialed. Returns
    /// `false` once every [`PeerTargets`] has been dropped.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}
