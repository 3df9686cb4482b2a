//! Types shared by both forwarding engines.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Identifier of a peer link within one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub u64);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link-{}", self.0)
    }
}

/// Direction a frame travels through a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Transport to device
    Uplink,
    /// Device to transport
    Downlink,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Uplink => f.write_str("uplink"),
            Direction::Downlink => f.write_str("downlink"),
        }
    }
}

/// Identity of a link as seen by observers.
#[derive(Debug, Clone)]
pub struct LinkInfo {
    pub id: LinkId,
    pub peer: Option<SocketAddr>,
    pub device: String,
}

/// Hook for subsystems that want to see traffic without owning it, such as a
/// liveness tracker. Called once per frame, before the frame is forwarded.
pub trait FrameObserver: Send + Sync + 'static {
    fn on_frame(&self, link: &LinkInfo, direction: Direction, frame: &[u8]);
}

/// Observer that ignores every frame.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl FrameObserver for NoopObserver {
    fn on_frame(&self, _link: &LinkInfo, _direction: Direction, _frame: &[u8]) {}
}

/// Live traffic counters for one link, updated from both directions.
#[derive(Debug)]
pub struct LinkStats {
    created_at: Instant,
    frames_up: AtomicU64,
    bytes_up: AtomicU64,
    frames_down: AtomicU64,
    bytes_down: AtomicU64,
}

impl LinkStats {
    pub fn new() -> Arc<Self> {
        Arc::new(LinkStats {
            created_at: Instant::now(),
            frames_up: AtomicU64::new(0),
            bytes_up: AtomicU64::new(0),
            frames_down: AtomicU64::new(0),
            bytes_down: AtomicU64::new(0),
        })
    }

    pub fn record(&self, direction: Direction, bytes: usize) {
        let (frames, total) = match direction {
            Direction::Uplink => (&self.frames_up, &self.bytes_up),
            Direction::Downlink => (&self.frames_down, &self.bytes_down),
        };
        frames.fetch_add(1, Ordering::Relaxed);
        total.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            uptime: self.created_at.elapsed(),
            frames_up: self.frames_up.load(Ordering::Relaxed),
            bytes_up: self.bytes_up.load(Ordering::Relaxed),
            frames_down: self.frames_down.load(Ordering::Relaxed),
            bytes_down: self.bytes_down.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`LinkStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub uptime: Duration,
    pub frames_up: u64,
    pub bytes_up: u64,
    pub frames_down: u64,
    pub bytes_down: u64,
}
