//! Task-per-direction forwarding between one device and one transport.
//!
//! A [`PeerLink`] pairs an interface with a byte stream. [`spawn_pump`] runs
//! two tasks over it:
//!
//! - uplink: decode frames from the transport and write them to the device
//! - downlink: read frames from the device and encode them onto the transport
//!
//! Both tasks watch one [`CancellationToken`]. Whichever direction finishes
//! first (error, end of stream, or an external [`PumpHandle::stop`]) cancels
//! it, the other direction leaves its pending read or write, and the
//! supervising task releases the device and both transport halves.
//!
//! All three tasks run inside a `link` span carrying the link id and peer.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::device::FrameDevice;
use crate::error::{TunnelError, TunnelResult};
use crate::link::{Direction, FrameObserver, LinkId, LinkInfo, LinkStats, StatsSnapshot};
use crate::proto::framing::{self, MAX_FRAME_SIZE};

/// One device bound to one transport.
pub struct PeerLink<D, T> {
    info: LinkInfo,
    device: D,
    transport: T,
}

impl<D, T> PeerLink<D, T>
where
    D: FrameDevice,
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(id: LinkId, peer: Option<SocketAddr>, device: D, transport: T) -> Self {
        let info = LinkInfo {
            id,
            peer,
            device: device.name().to_string(),
        };
        Self {
            info,
            device,
            transport,
        }
    }

    pub fn info(&self) -> &LinkInfo {
        &self.info
    }
}

/// Handle to a running pump.
pub struct PumpHandle {
    info: LinkInfo,
    token: CancellationToken,
    stats: Arc<LinkStats>,
    join: JoinHandle<TunnelResult<()>>,
}

impl PumpHandle {
    pub fn info(&self) -> &LinkInfo {
        &self.info
    }

    /// Ask both directions to stop. Safe to call repeatedly.
    pub fn stop(&self) {
        self.token.cancel();
    }

    /// Whether neither direction has finished yet.
    pub fn is_alive(&self) -> bool {
        !self.token.is_cancelled()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Wait for teardown to complete.
    ///
    /// Returns the first fatal error seen by either direction, or the final
    /// counters if the link ended cleanly (peer closed, or stopped).
    pub async fn wait(self) -> TunnelResult<StatsSnapshot> {
        let link = self.info.id;
        match self.join.await {
            Ok(Ok(())) => Ok(self.stats.snapshot()),
            Ok(Err(e)) => Err(e),
            Err(join_err) => Err(TunnelError::Transport(io::Error::other(format!(
                "{link} supervisor task failed: {join_err}"
            )))),
        }
    }
}

/// Start forwarding on `link`.
///
/// `shutdown` is a parent token: cancelling it stops this pump along with
/// every other pump spawned from it.
pub fn spawn_pump<D, T>(
    link: PeerLink<D, T>,
    observer: Arc<dyn FrameObserver>,
    shutdown: &CancellationToken,
) -> PumpHandle
where
    D: FrameDevice,
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let token = shutdown.child_token();
    let stats = LinkStats::new();
    let info = link.info.clone();

    let span = info_span!("link", link = %info.id, peer = ?info.peer);
    let join = tokio::spawn(
        supervise(link, observer, token.clone(), Arc::clone(&stats)).instrument(span),
    );

    PumpHandle {
        info,
        token,
        stats,
        join,
    }
}

async fn supervise<D, T>(
    link: PeerLink<D, T>,
    observer: Arc<dyn FrameObserver>,
    token: CancellationToken,
    stats: Arc<LinkStats>,
) -> TunnelResult<()>
where
    D: FrameDevice,
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let PeerLink {
        info,
        device,
        transport,
    } = link;
    info!(link = %info.id, peer = ?info.peer, device = %info.device, "Link up");

    let device = Arc::new(device);
    let (reader, writer) = tokio::io::split(transport);

    let uplink = tokio::spawn(run_uplink(
        info.clone(),
        Arc::clone(&device),
        reader,
        token.clone(),
        Arc::clone(&stats),
        Arc::clone(&observer),
    )
    .in_current_span());
    let downlink = tokio::spawn(run_downlink(
        info.clone(),
        Arc::clone(&device),
        writer,
        token.clone(),
        Arc::clone(&stats),
        observer,
    )
    .in_current_span());

    let (up, down) = tokio::join!(uplink, downlink);

    // Both directions are done; this is the last reference to the device.
    drop(device);
    debug!(link = %info.id, device = %info.device, "Released interface");

    let mut first_err: Option<TunnelError> = None;
    for (direction, result) in [(Direction::Uplink, up), (Direction::Downlink, down)] {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                first_err.get_or_insert(e);
            }
            Err(join_err) => {
                first_err.get_or_insert(TunnelError::Transport(io::Error::other(format!(
                    "{direction} task failed: {join_err}"
                ))));
            }
        }
    }

    let snap = stats.snapshot();
    match first_err {
        Some(err) => {
            warn!(link = %info.id, peer = ?info.peer, error = %err, "Link down");
            Err(err)
        }
        None => {
            info!(
                link = %info.id,
                peer = ?info.peer,
                frames_up = snap.frames_up,
                frames_down = snap.frames_down,
                "Link closed"
            );
            Ok(())
        }
    }
}

async fn run_uplink<D, T>(
    info: LinkInfo,
    device: Arc<D>,
    mut reader: ReadHalf<T>,
    token: CancellationToken,
    stats: Arc<LinkStats>,
    observer: Arc<dyn FrameObserver>,
) -> TunnelResult<()>
where
    D: FrameDevice,
    T: AsyncRead + AsyncWrite,
{
    let result = tokio::select! {
        r = uplink_loop(&info, &*device, &mut reader, &stats, &*observer) => r,
        _ = token.cancelled() => Ok(()),
    };
    token.cancel();
    log_exit(&info, Direction::Uplink, &result);
    result
}

async fn uplink_loop<D, T>(
    info: &LinkInfo,
    device: &D,
    reader: &mut ReadHalf<T>,
    stats: &LinkStats,
    observer: &dyn FrameObserver,
) -> TunnelResult<()>
where
    D: FrameDevice,
    T: AsyncRead + AsyncWrite,
{
    let mut buf = vec![0u8; MAX_FRAME_SIZE];
    loop {
        let Some(len) = framing::read_frame(reader, &mut buf).await? else {
            info!(link = %info.id, peer = ?info.peer, "Peer closed the stream");
            return Ok(());
        };
        let frame = &buf[..len];
        observer.on_frame(info, Direction::Uplink, frame);

        device
            .write_frame(frame)
            .await
            .map_err(|e| TunnelError::device_failure(&info.device, e.to_string()))?;
        stats.record(Direction::Uplink, len);
    }
}

async fn run_downlink<D, T>(
    info: LinkInfo,
    device: Arc<D>,
    mut writer: WriteHalf<T>,
    token: CancellationToken,
    stats: Arc<LinkStats>,
    observer: Arc<dyn FrameObserver>,
) -> TunnelResult<()>
where
    D: FrameDevice,
    T: AsyncRead + AsyncWrite,
{
    let result = tokio::select! {
        r = downlink_loop(&info, &*device, &mut writer, &stats, &*observer) => r,
        _ = token.cancelled() => Ok(()),
    };
    token.cancel();
    let _ = writer.shutdown().await;
    log_exit(&info, Direction::Downlink, &result);
    result
}

async fn downlink_loop<D, T>(
    info: &LinkInfo,
    device: &D,
    writer: &mut WriteHalf<T>,
    stats: &LinkStats,
    observer: &dyn FrameObserver,
) -> TunnelResult<()>
where
    D: FrameDevice,
    T: AsyncRead + AsyncWrite,
{
    let mut buf = vec![0u8; MAX_FRAME_SIZE];
    loop {
        let n = device
            .read_frame(&mut buf)
            .await
            .map_err(|e| TunnelError::device_failure(&info.device, e.to_string()))?;
        if n == 0 {
            return Err(TunnelError::device_failure(&info.device, "zero-length read"));
        }
        let frame = &buf[..n];
        observer.on_frame(info, Direction::Downlink, frame);

        framing::write_frame(writer, frame).await?;
        stats.record(Direction::Downlink, n);
    }
}

fn log_exit(info: &LinkInfo, direction: Direction, result: &TunnelResult<()>) {
    match result {
        Ok(()) => debug!(link = %info.id, %direction, "Direction stopped"),
        Err(e) => warn!(link = %info.id, %direction, error = %e, "Direction failed"),
    }
}
