//! Error types for the taplink data plane.

use std::io;
use std::net::SocketAddr;
use thiserror::Error;

use crate::config::ConfigError;

/// Result type for tunnel operations.
pub type TunnelResult<T> = Result<T, TunnelError>;

/// Error types that can occur while opening devices, establishing
/// connections and forwarding frames.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// The virtual-interface subsystem could not be accessed
    #[error("Device unavailable ({path}): {source}")]
    DeviceUnavailable {
        path: String,
        #[source]
        source: io::Error,
    },

    /// The kernel refused the requested interface type or flags
    #[error("Device configuration rejected for {name:?}: {source}")]
    ConfigurationRejected {
        name: String,
        #[source]
        source: io::Error,
    },

    /// The device failed while forwarding (zero-length read, short write, I/O error)
    #[error("Device {name} failed: {reason}")]
    DeviceFailure { name: String, reason: String },

    /// Binding the listening socket failed
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Listening on the bound socket failed
    #[error("Failed to listen on {addr}: {source}")]
    Listen {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Connecting to the remote peer failed
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The stream ended inside a frame payload
    #[error("Truncated frame: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    /// A length field outside `1..=max`
    #[error("Protocol violation: frame length {declared} (max: {max})")]
    ProtocolViolation { declared: usize, max: usize },

    /// The peer closed the stream
    #[error("Connection closed after {received} of {expected} bytes")]
    ConnectionClosed { received: usize, expected: usize },

    /// The peer stopped reading and its queued output outgrew the limit
    #[error("Peer stalled with {queued} bytes queued (limit: {limit})")]
    PeerStalled { queued: usize, limit: usize },

    /// I/O error on the transport
    #[error("Transport error: {0}")]
    Transport(#[from] io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl TunnelError {
    pub(crate) fn device_failure(name: &str, reason: impl Into<String>) -> Self {
        TunnelError::DeviceFailure {
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether the error ends the current link but leaves the process able to
    /// accept or dial new ones.
    pub fn is_link_local(&self) -> bool {
        !matches!(
            self,
            TunnelError::Bind { .. }
                | TunnelError::Listen { .. }
                | TunnelError::DeviceUnavailable { .. }
                | TunnelError::Config(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startup_errors_are_not_link_local() {
        let addr: SocketAddr = "127.0.0.1:9981".parse().unwrap();
        let bind = TunnelError::Bind {
            addr,
            source: io::Error::from(io::ErrorKind::AddrInUse),
        };
        assert!(!bind.is_link_local());

        let closed = TunnelError::ConnectionClosed {
            received: 2,
            expected: 4,
        };
        assert!(closed.is_link_local());
        assert_eq!(
            closed.to_string(),
            "Connection closed after 2 of 4 bytes"
        );

        let stalled = TunnelError::PeerStalled {
            queued: 300_000,
            limit: 262_144,
        };
        assert!(stalled.is_link_local());
    }
}
