//! Data plane for bridging a local TUN/TAP interface with a remote peer over
//! TCP, so two hosts exchange raw frames as if they were directly connected.
//!
//! Frames read from the interface are length-prefixed ([`proto::framing`])
//! and written to the peer; frames arriving from the peer are decoded and
//! written back to the interface. Two engines move the frames:
//!
//! - [`pump`]: two tokio tasks per link, torn down together
//! - [`reactor`]: one readiness loop over every link, built on [`mux`]

pub mod acceptor;
pub mod config;
pub mod device;
pub mod error;
pub mod link;
pub mod logging;
#[cfg(target_os = "linux")]
pub mod mux;
pub mod proto;
pub mod pump;
#[cfg(target_os = "linux")]
pub mod reactor;
pub mod server;
pub mod transfer;

// Re-export commonly used items for convenience
pub use acceptor::{Acceptor, Connector, PeerTargets};
pub use config::{Config, ConfigError, ConfigManager, EngineMode, Role};
pub use device::{DeviceKind, DeviceOpener, FrameDevice, RawDevice};
pub use error::{TunnelError, TunnelResult};
pub use link::{Direction, FrameObserver, LinkId, LinkInfo, NoopObserver, StatsSnapshot};
pub use proto::framing;
pub use pump::{spawn_pump, PeerLink, PumpHandle};
pub use server::{connect_once, serve_threaded};

#[cfg(target_os = "linux")]
pub use server::{connect, run_client, run_server, serve, serve_multiplexed};
