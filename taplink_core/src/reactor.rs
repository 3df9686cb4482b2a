//! Multiplexed forwarding: one control loop, many links.
//!
//! The [`Reactor`] owns a [`Multiplexer`] and every attached link. Each
//! readiness notification triggers one step for the ready descriptor:
//!
//! - transport ready: queued output is flushed, then one `read`, then every
//!   frame completed by those bytes is written to the link's device
//! - device readable: one frame is read, encoded, queued for the transport
//!   and flushed as far as the socket allows
//!
//! after which the descriptor is re-armed. A failing step tears down only the
//! link it belongs to.
//!
//! Transports are switched to non-blocking mode on attach, so a peer that
//! stops reading never holds up the loop. Whatever its socket will not take
//! stays in the link's outbound queue and the transport is watched for
//! writability until the queue drains. A link whose queue grows past the
//! backlog limit is torn down with [`TunnelError::PeerStalled`].
//!
//! An eventfd registered next to the links lets [`ReactorHandle`] interrupt
//! a wait, so new links and shutdown are picked up at once.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::fd::AsFd;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::eventfd::{EfdFlags, EventFd};
use socket2::SockRef;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::device::RawDevice;
use crate::error::{TunnelError, TunnelResult};
use crate::link::{Direction, FrameObserver, LinkId, LinkInfo, LinkStats, StatsSnapshot};
use crate::mux::Multiplexer;
use crate::proto::framing::{encode_frame, FrameDecoder, HEADER_SIZE, MAX_FRAME_SIZE};
use crate::transfer;

/// Queued output a link may hold for its peer before it is dropped.
pub const DEFAULT_BACKLOG_LIMIT: usize = 256 * 1024;

/// Which half of which link a registration belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Transport(LinkId),
    Device(LinkId),
    Wake,
}

struct Link<D, T> {
    info: LinkInfo,
    device: D,
    transport: T,
    decoder: FrameDecoder,
    /// Encoded frames the transport has not accepted yet
    outbound: Vec<u8>,
    stats: Arc<LinkStats>,
}

/// A link that has left the reactor.
#[derive(Debug)]
pub struct ClosedLink {
    pub info: LinkInfo,
    pub stats: StatsSnapshot,
    /// `None` for an orderly close (peer EOF or explicit detach)
    pub error: Option<TunnelError>,
}

/// Outcome of one step on a link.
enum Step {
    Continue,
    PeerClosed,
}

/// Readiness-driven engine; see the module docs.
pub struct Reactor<D, T> {
    mux: Multiplexer<Source>,
    links: HashMap<LinkId, Link<D, T>>,
    observer: Arc<dyn FrameObserver>,
    max_events: usize,
    backlog_limit: usize,
    wake: Arc<EventFd>,
    read_buf: Vec<u8>,
    frame_buf: Vec<u8>,
}

impl<D, T> Reactor<D, T>
where
    D: RawDevice,
    T: Read + Write + AsFd + AsRawFd + Send + 'static,
{
    pub fn new(max_events: usize, observer: Arc<dyn FrameObserver>) -> io::Result<Self> {
        let mux = Multiplexer::new()?;
        let wake = EventFd::from_value_and_flags(0, EfdFlags::EFD_NONBLOCK | EfdFlags::EFD_CLOEXEC)?;
        mux.register(&wake, Source::Wake)?;

        Ok(Self {
            mux,
            links: HashMap::new(),
            observer,
            max_events: max_events.max(1),
            backlog_limit: DEFAULT_BACKLOG_LIMIT,
            wake: Arc::new(wake),
            read_buf: vec![0u8; HEADER_SIZE + MAX_FRAME_SIZE],
            frame_buf: vec![0u8; MAX_FRAME_SIZE],
        })
    }

    /// Bound on each link's queued output. Never below one encoded frame.
    pub fn with_backlog_limit(mut self, bytes: usize) -> Self {
        self.backlog_limit = bytes.max(HEADER_SIZE + MAX_FRAME_SIZE);
        self
    }

    /// Start serving a link. The transport is made non-blocking and both
    /// descriptors are registered before this returns; on failure the link
    /// is dropped.
    pub fn attach(
        &mut self,
        id: LinkId,
        peer: Option<SocketAddr>,
        device: D,
        transport: T,
    ) -> TunnelResult<()> {
        let info = LinkInfo {
            id,
            peer,
            device: device.name().to_string(),
        };

        SockRef::from(&transport.as_fd())
            .set_nonblocking(true)
            .map_err(TunnelError::Transport)?;

        if let Err(e) = self
            .mux
            .register(&transport, Source::Transport(id))
            .and_then(|_| self.mux.register(&device, Source::Device(id)))
        {
            let _ = self.mux.deregister(&transport);
            let _ = self.mux.deregister(&device);
            return Err(TunnelError::Transport(e));
        }

        info!(link = %id, peer = ?peer, device = %info.device, "Link attached");
        self.links.insert(
            id,
            Link {
                info,
                device,
                transport,
                decoder: FrameDecoder::new(),
                outbound: Vec::new(),
                stats: LinkStats::new(),
            },
        );
        Ok(())
    }

    /// Tear a link down without an error. Unknown ids are ignored.
    pub fn detach(&mut self, id: LinkId) -> Option<ClosedLink> {
        self.teardown(id, None)
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn contains(&self, id: LinkId) -> bool {
        self.links.contains_key(&id)
    }

    pub fn stats(&self, id: LinkId) -> Option<StatsSnapshot> {
        self.links.get(&id).map(|link| link.stats.snapshot())
    }

    /// Bytes waiting for the peer to read them.
    pub fn queued_bytes(&self, id: LinkId) -> Option<usize> {
        self.links.get(&id).map(|link| link.outbound.len())
    }

    /// Wait up to `timeout` for readiness and run one step per ready
    /// descriptor. Returns the links that closed during this round.
    pub fn poll_once(&mut self, timeout: Duration) -> io::Result<Vec<ClosedLink>> {
        let ready = self.mux.wait(self.max_events, timeout)?;
        let mut closed = Vec::new();

        for (_fd, source) in ready {
            let (id, result) = match source {
                Source::Transport(id) => (id, self.on_transport_ready(id)),
                Source::Device(id) => (id, self.on_device_ready(id)),
                Source::Wake => {
                    if let Err(e) = self.on_wake() {
                        warn!(error = %e, "Failed to re-arm wake descriptor");
                    }
                    continue;
                }
            };

            match result {
                Ok(Step::Continue) => self.rearm(id, source),
                Ok(Step::PeerClosed) => closed.extend(self.teardown(id, None)),
                Err(e) => closed.extend(self.teardown(id, Some(e))),
            }
        }

        Ok(closed)
    }

    /// Run until `shutdown` is cancelled, attaching links as they arrive on
    /// `inbox`. All remaining links are torn down on exit.
    pub fn run(
        mut self,
        mut inbox: mpsc::UnboundedReceiver<NewLink<D, T>>,
        shutdown: CancellationToken,
        poll_interval: Duration,
    ) {
        info!("Reactor started");
        while !shutdown.is_cancelled() {
            while let Ok(new) = inbox.try_recv() {
                if let Err(e) = self.attach(new.id, new.peer, new.device, new.transport) {
                    warn!(link = %new.id, error = %e, "Failed to attach link");
                }
            }

            match self.poll_once(poll_interval) {
                Ok(closed) => {
                    for link in closed {
                        report(&link);
                    }
                }
                Err(e) => {
                    error!(error = %e, "Multiplexer wait failed");
                    break;
                }
            }
        }

        let ids: Vec<LinkId> = self.links.keys().copied().collect();
        for id in ids {
            if let Some(link) = self.detach(id) {
                report(&link);
            }
        }
        info!("Reactor stopped");
    }

    fn on_wake(&mut self) -> io::Result<()> {
        match self.wake.read() {
            Ok(_) | Err(Errno::EAGAIN) => {}
            Err(e) => return Err(e.into()),
        }
        self.mux.rearm(&*self.wake)
    }

    /// Re-arm the descriptor that just ran. The transport also wants
    /// writability whenever output is queued, which a device step can cause.
    fn rearm(&mut self, id: LinkId, source: Source) {
        let Some(link) = self.links.get(&id) else {
            return;
        };
        let transport = || {
            if link.outbound.is_empty() {
                self.mux.rearm(&link.transport)
            } else {
                self.mux.rearm_writable(&link.transport)
            }
        };
        let result = match source {
            Source::Transport(_) => transport(),
            Source::Device(_) if link.outbound.is_empty() => self.mux.rearm(&link.device),
            Source::Device(_) => self.mux.rearm(&link.device).and_then(|()| transport()),
            Source::Wake => Ok(()),
        };
        if let Err(e) = result {
            self.teardown(id, Some(TunnelError::Transport(e)))
                .into_iter()
                .for_each(|link| report(&link));
        }
    }

    fn on_transport_ready(&mut self, id: LinkId) -> TunnelResult<Step> {
        let Some(link) = self.links.get_mut(&id) else {
            return Ok(Step::Continue);
        };

        if !link.outbound.is_empty() {
            let n = transfer::blocking::write_pending(&mut link.transport, &mut link.outbound)?;
            trace!(link = %id, n, queued = link.outbound.len(), "Flushed queued output");
        }

        let n = match link.transport.read(&mut self.read_buf) {
            Ok(0) => {
                return match link.decoder.pending_payload() {
                    Some((expected, actual)) => Err(TunnelError::Truncated { expected, actual }),
                    None => Ok(Step::PeerClosed),
                };
            }
            Ok(n) => n,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
                return Ok(Step::Continue)
            }
            Err(e) => return Err(TunnelError::Transport(e)),
        };

        link.decoder.push(&self.read_buf[..n]);
        while let Some(frame) = link.decoder.next_frame()? {
            self.observer.on_frame(&link.info, Direction::Uplink, &frame);
            link.device
                .write_frame(&frame)
                .map_err(|e| TunnelError::device_failure(&link.info.device, e.to_string()))?;
            link.stats.record(Direction::Uplink, frame.len());
        }
        Ok(Step::Continue)
    }

    fn on_device_ready(&mut self, id: LinkId) -> TunnelResult<Step> {
        let Some(link) = self.links.get_mut(&id) else {
            return Ok(Step::Continue);
        };

        let n = match link.device.read_frame(&mut self.frame_buf) {
            Ok(0) => return Err(TunnelError::device_failure(&link.info.device, "zero-length read")),
            Ok(n) => n,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
                return Ok(Step::Continue)
            }
            Err(e) => return Err(TunnelError::device_failure(&link.info.device, e.to_string())),
        };

        let frame = &self.frame_buf[..n];
        self.observer.on_frame(&link.info, Direction::Downlink, frame);
        link.outbound.extend_from_slice(&encode_frame(frame)?);
        link.stats.record(Direction::Downlink, n);

        transfer::blocking::write_pending(&mut link.transport, &mut link.outbound)?;
        if link.outbound.len() > self.backlog_limit {
            return Err(TunnelError::PeerStalled {
                queued: link.outbound.len(),
                limit: self.backlog_limit,
            });
        }
        Ok(Step::Continue)
    }

    fn teardown(&mut self, id: LinkId, error: Option<TunnelError>) -> Option<ClosedLink> {
        let link = self.links.remove(&id)?;
        if let Err(e) = self.mux.deregister(&link.transport) {
            debug!(link = %id, error = %e, "Transport deregistration failed");
        }
        if let Err(e) = self.mux.deregister(&link.device) {
            debug!(link = %id, error = %e, "Device deregistration failed");
        }

        let Link { info, stats, .. } = link;
        Some(ClosedLink {
            info,
            stats: stats.snapshot(),
            error,
        })
    }
}

fn report(link: &ClosedLink) {
    match &link.error {
        None => info!(
            link = %link.info.id,
            peer = ?link.info.peer,
            frames_up = link.stats.frames_up,
            frames_down = link.stats.frames_down,
            "Link closed"
        ),
        Some(e) => warn!(link = %link.info.id, peer = ?link.info.peer, error = %e, "Link down"),
    }
}

/// A link waiting to be attached by a running reactor.
pub struct NewLink<D, T> {
    pub id: LinkId,
    pub peer: Option<SocketAddr>,
    pub device: D,
    pub transport: T,
}

/// Handle for feeding links to a reactor running on a blocking thread.
pub struct ReactorHandle<D, T> {
    inbox: mpsc::UnboundedSender<NewLink<D, T>>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
    wake: Arc<EventFd>,
    join: JoinHandle<()>,
}

impl<D, T> ReactorHandle<D, T>
where
    D: RawDevice,
    T: Read + Write + AsFd + AsRawFd + Send + 'static,
{
    /// Move `reactor` onto a blocking thread.
    pub fn spawn(reactor: Reactor<D, T>, shutdown: &CancellationToken, poll_interval: Duration) -> Self {
        let (inbox, rx) = mpsc::unbounded_channel();
        let shutdown = shutdown.child_token();
        let token = shutdown.clone();
        let wake = Arc::clone(&reactor.wake);
        let join = tokio::task::spawn_blocking(move || reactor.run(rx, token, poll_interval));
        Self {
            inbox,
            next_id: AtomicU64::new(1),
            shutdown,
            wake,
            join,
        }
    }

    fn wake(&self) {
        if let Err(e) = self.wake.write(1) {
            warn!(error = %e, "Failed to wake reactor");
        }
    }

    /// Hand a new link to the reactor and wake it to register the link.
    pub fn attach(&self, peer: Option<SocketAddr>, device: D, transport: T) -> TunnelResult<LinkId> {
        let id = LinkId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.inbox
            .send(NewLink {
                id,
                peer,
                device,
                transport,
            })
            .map_err(|_| TunnelError::Transport(io::Error::other("reactor has stopped")))?;
        self.wake();
        Ok(id)
    }

    /// Stop the reactor and wait for it to release every link.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.wake();
        if let Err(e) = self.join.await {
            error!(error = %e, "Reactor thread failed");
        }
    }
}
