//! In-memory device for tests.
//!
//! A [`MemoryDevice`] behaves like an interface whose "network side" is held
//! by a [`MemoryDeviceHandle`]: frames injected through the handle are
//! returned by `read_frame`, and frames written to the device can be taken
//! from the handle. Dropping the device is counted so tests can check that a
//! link released its interface exactly once.
//!
//! [`SocketDevice`] is the descriptor-backed counterpart for code that needs a
//! [`RawDevice`](super::RawDevice): one end of a non-blocking datagram socket
//! pair, so each `send` on the test side is exactly one frame.
//!
//! Not for production use.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixDatagram;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use super::{DeviceOpener, FrameDevice, RawDevice};
use crate::error::TunnelResult;

/// Mock device; see the module docs.
pub struct MemoryDevice {
    name: String,
    inbound: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    closed: Arc<AtomicUsize>,
}

/// Test-side end of a [`MemoryDevice`].
pub struct MemoryDeviceHandle {
    name: String,
    inject: mpsc::UnboundedSender<Vec<u8>>,
    written: mpsc::UnboundedReceiver<Vec<u8>>,
    closed: Arc<AtomicUsize>,
}

impl MemoryDevice {
    pub fn pair(name: impl Into<String>) -> (MemoryDevice, MemoryDeviceHandle) {
        let name = name.into();
        let (inject, inbound) = mpsc::unbounded_channel();
        let (outbound, written) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicUsize::new(0));

        let device = MemoryDevice {
            name: name.clone(),
            inbound: Mutex::new(inbound),
            outbound,
            closed: Arc::clone(&closed),
        };
        let handle = MemoryDeviceHandle {
            name,
            inject,
            written,
            closed,
        };
        (device, handle)
    }
}

#[async_trait]
impl FrameDevice for MemoryDevice {
    fn name(&self) -> &str {
        &self.name
    }

    /// Returns `Ok(0)` once the handle has been dropped, like a device that
    /// has gone away.
    async fn read_frame(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut inbound = self.inbound.lock().await;
        match inbound.recv().await {
            Some(frame) => {
                let n = frame.len().min(buf.len());
                buf[..n].copy_from_slice(&frame[..n]);
                Ok(n)
            }
            None => Ok(0),
        }
    }

    async fn write_frame(&self, frame: &[u8]) -> io::Result<()> {
        self.outbound
            .send(frame.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "mock handle dropped"))
    }
}

impl Drop for MemoryDevice {
    fn drop(&mut self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

impl MemoryDeviceHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue a frame to be returned by the device's next read.
    pub fn inject(&self, frame: impl Into<Vec<u8>>) {
        let _ = self.inject.send(frame.into());
    }

    /// Wait for the next frame written to the device. `None` once the device
    /// is gone and everything written has been taken.
    pub async fn next_written(&mut self) -> Option<Vec<u8>> {
        self.written.recv().await
    }

    pub fn try_written(&mut self) -> Option<Vec<u8>> {
        self.written.try_recv().ok()
    }

    /// How many times the device has been released.
    pub fn closed_count(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Opener that hands every new device's handle to the test.
pub struct MemoryOpener {
    next: AtomicUsize,
    handles: mpsc::UnboundedSender<MemoryDeviceHandle>,
}

impl MemoryOpener {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MemoryDeviceHandle>) {
        let (handles, rx) = mpsc::unbounded_channel();
        (
            Self {
                next: AtomicUsize::new(0),
                handles,
            },
            rx,
        )
    }
}

impl DeviceOpener for MemoryOpener {
    type Device = MemoryDevice;

    fn open(&self) -> TunnelResult<MemoryDevice> {
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        let (device, handle) = MemoryDevice::pair(format!("mem{n}"));
        let _ = self.handles.send(handle);
        Ok(device)
    }
}

/// Datagram-socket device; see the module docs.
pub struct SocketDevice {
    name: String,
    socket: UnixDatagram,
    closed: Arc<AtomicUsize>,
}

/// Test-side end of a [`SocketDevice`].
pub struct SocketDeviceHandle {
    pub socket: UnixDatagram,
    closed: Arc<AtomicUsize>,
}

impl SocketDevice {
    /// The device end is non-blocking; the handle end is left blocking.
    pub fn pair(name: impl Into<String>) -> io::Result<(SocketDevice, SocketDeviceHandle)> {
        let (device_end, handle_end) = UnixDatagram::pair()?;
        device_end.set_nonblocking(true)?;
        let closed = Arc::new(AtomicUsize::new(0));
        Ok((
            SocketDevice {
                name: name.into(),
                socket: device_end,
                closed: Arc::clone(&closed),
            },
            SocketDeviceHandle {
                socket: handle_end,
                closed,
            },
        ))
    }
}

impl RawDevice for SocketDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_frame(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.socket.recv(buf)
    }

    fn write_frame(&self, frame: &[u8]) -> io::Result<()> {
        let written = self.socket.send(frame)?;
        if written != frame.len() {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "short datagram"));
        }
        Ok(())
    }
}

impl AsRawFd for SocketDevice {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

impl Drop for SocketDevice {
    fn drop(&mut self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

impl SocketDeviceHandle {
    pub fn closed_count(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Opener for [`SocketDevice`]s, handing each handle to the test.
pub struct SocketOpener {
    next: AtomicUsize,
    handles: mpsc::UnboundedSender<SocketDeviceHandle>,
}

impl SocketOpener {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SocketDeviceHandle>) {
        let (handles, rx) = mpsc::unbounded_channel();
        (
            Self {
                next: AtomicUsize::new(0),
                handles,
            },
            rx,
        )
    }
}

impl DeviceOpener for SocketOpener {
    type Device = SocketDevice;

    fn open(&self) -> TunnelResult<SocketDevice> {
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        let (device, handle) = SocketDevice::pair(format!("sock{n}"))?;
        let _ = self.handles.send(handle);
        Ok(device)
    }
}
