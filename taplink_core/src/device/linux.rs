//! Linux TUN/TAP devices via `/dev/net/tun`.
//!
//! Creating an interface is two steps: open the clone device, then issue
//! `TUNSETIFF` with the requested name and flags. The kernel fills in the
//! name it actually allocated (first free `tapN`/`tunN` when the request is
//! empty or contains `%d`), which is what [`TapDevice::name`] reports.
//!
//! Requires root or `CAP_NET_ADMIN`.

#![cfg(target_os = "linux")]

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};

use tracing::{debug, info};

use super::{DeviceKind, DeviceOpener, RawDevice};
use crate::error::{TunnelError, TunnelResult};

const TUN_DEVICE_PATH: &str = "/dev/net/tun";

const IFF_TUN: libc::c_short = 0x0001;
const IFF_TAP: libc::c_short = 0x0002;
const IFF_NO_PI: libc::c_short = 0x1000;

/// `_IOW('T', 202, int)`
const TUNSETIFF: libc::c_ulong = 0x4004_54ca;

/// Interface request as laid out by `struct ifreq` for `TUNSETIFF`.
#[repr(C)]
struct IfReq {
    ifr_name: [libc::c_char; libc::IFNAMSIZ],
    ifr_flags: libc::c_short,
    _padding: [u8; 22],
}

impl IfReq {
    fn new(name: &str, flags: libc::c_short) -> Self {
        let mut ifr = Self {
            ifr_name: [0; libc::IFNAMSIZ],
            ifr_flags: flags,
            _padding: [0; 22],
        };
        for (slot, &byte) in ifr.ifr_name.iter_mut().zip(name.as_bytes()) {
            *slot = byte as libc::c_char;
        }
        ifr
    }

    fn name(&self) -> String {
        let bytes: Vec<u8> = self
            .ifr_name
            .iter()
            .take_while(|&&c| c != 0)
            .map(|&c| c as u8)
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// A kernel TUN or TAP interface.
///
/// The descriptor is non-blocking so the device can be driven either by the
/// tokio reactor (through [`super::AsyncDevice`]) or by the epoll reactor.
#[derive(Debug)]
pub struct TapDevice {
    file: Option<File>,
    name: String,
    kind: DeviceKind,
}

impl TapDevice {
    /// Create (or attach to) an interface.
    ///
    /// # Errors
    /// - `DeviceUnavailable`: `/dev/net/tun` cannot be opened
    /// - `ConfigurationRejected`: the kernel refused the name or flags
    pub fn open(requested_name: &str, kind: DeviceKind) -> TunnelResult<Self> {
        if requested_name.len() >= libc::IFNAMSIZ {
            return Err(TunnelError::ConfigurationRejected {
                name: requested_name.to_string(),
                source: io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("interface names are limited to {} bytes", libc::IFNAMSIZ - 1),
                ),
            });
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC)
            .open(TUN_DEVICE_PATH)
            .map_err(|source| TunnelError::DeviceUnavailable {
                path: TUN_DEVICE_PATH.to_string(),
                source,
            })?;

        let flags = match kind {
            DeviceKind::Tun => IFF_TUN,
            DeviceKind::Tap => IFF_TAP,
        } | IFF_NO_PI;
        let mut ifr = IfReq::new(requested_name, flags);

        // SAFETY: `file` is an open descriptor and `ifr` is a properly sized
        // `struct ifreq` that outlives the call.
        let result = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF as _, &mut ifr) };
        if result < 0 {
            return Err(TunnelError::ConfigurationRejected {
                name: requested_name.to_string(),
                source: io::Error::last_os_error(),
            });
        }

        let name = ifr.name();
        info!(requested = requested_name, device = %name, ?kind, "Opened virtual interface");

        Ok(Self {
            file: Some(file),
            name,
            kind,
        })
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Release the interface. Calling this more than once does nothing.
    pub fn close(&mut self) {
        if self.file.take().is_some() {
            debug!(device = %self.name, "Closed virtual interface");
        }
    }

    fn file(&self) -> io::Result<&File> {
        self.file
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "device closed"))
    }
}

impl RawDevice for TapDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_frame(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut file = self.file()?;
        file.read(buf)
    }

    fn write_frame(&self, frame: &[u8]) -> io::Result<()> {
        let mut file = self.file()?;
        let written = file.write(frame)?;
        if written != frame.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short device write: {} of {} bytes", written, frame.len()),
            ));
        }
        Ok(())
    }
}

impl AsRawFd for TapDevice {
    /// `-1` once the device has been closed.
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_ref().map_or(-1, |f| f.as_raw_fd())
    }
}

impl Drop for TapDevice {
    fn drop(&mut self) {
        self.close();
    }
}

/// Opens one kernel interface per peer.
#[derive(Debug, Clone)]
pub struct TapOpener {
    requested_name: String,
    kind: DeviceKind,
}

impl TapOpener {
    pub fn new(requested_name: impl Into<String>, kind: DeviceKind) -> Self {
        Self {
            requested_name: requested_name.into(),
            kind,
        }
    }
}

impl DeviceOpener for TapOpener {
    type Device = TapDevice;

    fn open(&self) -> TunnelResult<TapDevice> {
        TapDevice::open(&self.requested_name, self.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ifreq_name_roundtrip() {
        let ifr = IfReq::new("tap7", IFF_TAP | IFF_NO_PI);
        assert_eq!(ifr.name(), "tap7");
        assert_eq!(ifr.ifr_flags, 0x1002);
        assert_eq!(std::mem::size_of::<IfReq>(), 40);
    }

    #[test]
    fn test_overlong_name_is_rejected_before_open() {
        let err = TapDevice::open("a-very-long-interface-name", DeviceKind::Tap).unwrap_err();
        assert!(matches!(err, TunnelError::ConfigurationRejected { .. }));
    }

    // Needs CAP_NET_ADMIN
    #[test]
    #[ignore]
    fn test_open_assigns_name_and_close_is_idempotent() {
        let mut device = TapDevice::open("", DeviceKind::Tap).unwrap();
        assert!(device.name().starts_with("tap"));
        assert!(device.is_open());
        device.close();
        device.close();
        assert!(!device.is_open());
        assert_eq!(device.as_raw_fd(), -1);
        assert!(device.read_frame(&mut [0u8; 64]).is_err());
    }
}
