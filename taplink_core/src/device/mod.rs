//! Virtual network interfaces.
//!
//! Two seams are defined here:
//!
//! - [`RawDevice`]: a descriptor-backed device with synchronous whole-frame
//!   reads and writes. The multiplexed reactor drives these directly after a
//!   readiness notification.
//! - [`FrameDevice`]: the async interface the forwarding pump uses. Any
//!   `RawDevice` with a non-blocking descriptor becomes a `FrameDevice`
//!   through [`AsyncDevice`].
//!
//! Devices are opened per peer through a [`DeviceOpener`], so every link owns
//! its own interface and releases it exactly once when dropped.

use std::io;
use std::os::unix::io::AsRawFd;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;

use crate::error::{TunnelError, TunnelResult};

#[cfg(target_os = "linux")]
pub mod linux;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

#[cfg(target_os = "linux")]
pub use linux::{TapDevice, TapOpener};

#[cfg(any(test, feature = "mock"))]
pub use mock::{
    MemoryDevice, MemoryDeviceHandle, MemoryOpener, SocketDevice, SocketDeviceHandle, SocketOpener,
};

/// Layer at which the interface exchanges frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// Layer 3: raw IP packets
    Tun,
    /// Layer 2: Ethernet frames
    #[default]
    Tap,
}

/// Descriptor-backed device with whole-frame I/O.
pub trait RawDevice: AsRawFd + Send + Sync + 'static {
    /// Name assigned by the interface subsystem.
    fn name(&self) -> &str;

    /// Read exactly one frame into `buf`. `Ok(0)` means the device failed.
    fn read_frame(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one complete frame. A short write is an error.
    fn write_frame(&self, frame: &[u8]) -> io::Result<()>;
}

/// Async whole-frame device used by the forwarding pump.
#[async_trait]
pub trait FrameDevice: Send + Sync + 'static {
    /// Name assigned by the interface subsystem.
    fn name(&self) -> &str;

    /// Read exactly one frame into `buf`. `Ok(0)` means the device failed.
    async fn read_frame(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one complete frame. A short write is an error.
    async fn write_frame(&self, frame: &[u8]) -> io::Result<()>;
}

/// Opens one fresh interface per peer.
pub trait DeviceOpener: Send + Sync + 'static {
    type Device: Send + 'static;

    fn open(&self) -> TunnelResult<Self::Device>;
}

/// Adapts a non-blocking [`RawDevice`] to [`FrameDevice`] on the tokio reactor.
pub struct AsyncDevice<D: RawDevice> {
    inner: AsyncFd<D>,
}

impl<D: RawDevice> AsyncDevice<D> {
    /// Register `device` with the runtime. Its descriptor must already be in
    /// non-blocking mode.
    pub fn new(device: D) -> io::Result<Self> {
        Ok(Self {
            inner: AsyncFd::with_interest(device, Interest::READABLE | Interest::WRITABLE)?,
        })
    }

    pub fn get_ref(&self) -> &D {
        self.inner.get_ref()
    }

    /// Deregister from the runtime and hand the device back.
    pub fn into_inner(self) -> D {
        self.inner.into_inner()
    }
}

#[async_trait]
impl<D: RawDevice> FrameDevice for AsyncDevice<D> {
    fn name(&self) -> &str {
        self.inner.get_ref().name()
    }

    async fn read_frame(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.inner.readable().await?;
            match guard.try_io(|inner| inner.get_ref().read_frame(buf)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    async fn write_frame(&self, frame: &[u8]) -> io::Result<()> {
        loop {
            let mut guard = self.inner.writable().await?;
            match guard.try_io(|inner| inner.get_ref().write_frame(frame)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }
}

/// Wraps an opener of raw devices so it yields [`AsyncDevice`]s.
pub struct AsyncOpener<O> {
    inner: O,
}

impl<O> AsyncOpener<O> {
    pub fn new(inner: O) -> Self {
        Self { inner }
    }
}

impl<O> DeviceOpener for AsyncOpener<O>
where
    O: DeviceOpener,
    O::Device: RawDevice,
{
    type Device = AsyncDevice<O::Device>;

    fn open(&self) -> TunnelResult<Self::Device> {
        let device = self.inner.open()?;
        let name = device.name().to_string();
        AsyncDevice::new(device).map_err(|e| TunnelError::device_failure(&name, e.to_string()))
    }
}
