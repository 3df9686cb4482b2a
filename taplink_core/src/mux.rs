//! Readiness notification for many descriptors from one control loop.
//!
//! [`Multiplexer`] wraps an epoll instance together with a table mapping each
//! registered descriptor to a caller-chosen tag. Registrations are one-shot:
//! after a descriptor is reported ready it stays silent until [`Multiplexer::rearm`]
//! is called, so a descriptor is never handed to two handlers at once.
//! [`Multiplexer::rearm_writable`] additionally asks for output readiness,
//! for descriptors with queued output.
//!
//! Registration changes and `wait` may race (teardown on one thread, the
//! control loop on another). The table is consulted after every wakeup and
//! events for descriptors that are no longer registered are dropped.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::{AsRawFd, BorrowedFd, RawFd};
use std::sync::Mutex;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags};
use tracing::trace;

fn interest() -> EpollFlags {
    EpollFlags::EPOLLIN | EpollFlags::EPOLLRDHUP | EpollFlags::EPOLLONESHOT
}

fn interest_writable() -> EpollFlags {
    interest() | EpollFlags::EPOLLOUT
}

fn borrow(fd: RawFd) -> io::Result<BorrowedFd<'static>> {
    if fd < 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "closed descriptor"));
    }
    // SAFETY: callers pass a descriptor owned by a value they hold a
    // reference to for the duration of the epoll call.
    Ok(unsafe { BorrowedFd::borrow_raw(fd) })
}

/// Epoll-backed readiness multiplexer; see the module docs.
pub struct Multiplexer<T> {
    epoll: Epoll,
    registrations: Mutex<HashMap<RawFd, T>>,
}

impl<T: Clone> Multiplexer<T> {
    pub fn new() -> io::Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
        Ok(Self {
            epoll,
            registrations: Mutex::new(HashMap::new()),
        })
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<RawFd, T>> {
        self.registrations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Watch `source` for readability. Returns `false` (and changes nothing)
    /// if it is already registered.
    pub fn register<S: AsRawFd + ?Sized>(&self, source: &S, tag: T) -> io::Result<bool> {
        let fd = source.as_raw_fd();
        let mut table = self.table();
        if table.contains_key(&fd) {
            return Ok(false);
        }
        self.epoll
            .add(borrow(fd)?, EpollEvent::new(interest(), fd as u64))?;
        table.insert(fd, tag);
        trace!(fd, "Registered descriptor");
        Ok(true)
    }

    /// Stop watching `source`. Returns `false` if it was not registered.
    pub fn deregister<S: AsRawFd + ?Sized>(&self, source: &S) -> io::Result<bool> {
        let fd = source.as_raw_fd();
        let mut table = self.table();
        if table.remove(&fd).is_none() {
            return Ok(false);
        }
        match self.epoll.delete(borrow(fd)?) {
            // Already gone from the kernel set (e.g. closed elsewhere)
            Ok(()) | Err(Errno::ENOENT) | Err(Errno::EBADF) => {}
            Err(e) => return Err(e.into()),
        }
        trace!(fd, "Deregistered descriptor");
        Ok(true)
    }

    /// Re-enable notifications for a descriptor after it has been handled.
    /// Does nothing for descriptors that are not registered.
    pub fn rearm<S: AsRawFd + ?Sized>(&self, source: &S) -> io::Result<()> {
        self.modify(source.as_raw_fd(), interest())
    }

    /// Like [`Multiplexer::rearm`], but also report the descriptor once it
    /// can accept more output.
    pub fn rearm_writable<S: AsRawFd + ?Sized>(&self, source: &S) -> io::Result<()> {
        self.modify(source.as_raw_fd(), interest_writable())
    }

    fn modify(&self, fd: RawFd, flags: EpollFlags) -> io::Result<()> {
        let table = self.table();
        if !table.contains_key(&fd) {
            return Ok(());
        }
        let mut event = EpollEvent::new(flags, fd as u64);
        self.epoll.modify(borrow(fd)?, &mut event)?;
        Ok(())
    }

    /// Wait for up to `max_events` ready descriptors.
    ///
    /// A zero `timeout` polls without blocking; otherwise the call blocks for
    /// at most `timeout` (rounded down to whole milliseconds, capped at
    /// `u16::MAX` ms). An interrupted wait returns no events.
    pub fn wait(&self, max_events: usize, timeout: Duration) -> io::Result<Vec<(RawFd, T)>> {
        let mut events = vec![EpollEvent::empty(); max_events.max(1)];
        let millis = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);

        let n = match self.epoll.wait(&mut events, millis) {
            Ok(n) => n,
            Err(Errno::EINTR) => 0,
            Err(e) => return Err(e.into()),
        };

        let table = self.table();
        let ready = events[..n]
            .iter()
            .filter_map(|event| {
                let fd = event.data() as RawFd;
                table.get(&fd).map(|tag| (fd, tag.clone()))
            })
            .collect();
        Ok(ready)
    }

    /// Number of registered descriptors.
    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
