//! All-or-nothing reads and writes over a byte stream.
//!
//! A single `read`/`write` on a stream socket may move fewer bytes than
//! requested. Every framing operation goes through these helpers so that a
//! short transfer is never mistaken for a complete one: either the whole
//! buffer is transferred or the call fails with
//! [`TunnelError::ConnectionClosed`] or [`TunnelError::Transport`].

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::error::{TunnelError, TunnelResult};

/// Fill `buf` completely from `reader`.
pub async fn read_exact<R>(reader: &mut R, buf: &mut [u8]) -> TunnelResult<()>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let expected = buf.len();
    let mut received = 0;

    while received < expected {
        match reader.read(&mut buf[received..]).await {
            Ok(0) => return Err(TunnelError::ConnectionClosed { received, expected }),
            Ok(n) => {
                received += n;
                trace!(n, received, expected, "partial read");
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(TunnelError::Transport(e)),
        }
    }

    Ok(())
}

/// Write all of `buf` to `writer`.
pub async fn write_exact<W>(writer: &mut W, buf: &[u8]) -> TunnelResult<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let expected = buf.len();
    let mut written = 0;

    while written < expected {
        match writer.write(&buf[written..]).await {
            Ok(0) => {
                return Err(TunnelError::ConnectionClosed {
                    received: written,
                    expected,
                })
            }
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(TunnelError::Transport(e)),
        }
    }

    writer.flush().await.map_err(TunnelError::Transport)
}

/// Counterparts over `std::io` streams.
pub mod blocking {
    use std::io::{self, Read, Write};

    use crate::error::{TunnelError, TunnelResult};

    /// Fill `buf` completely from `reader`.
    pub fn read_exact<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> TunnelResult<()> {
        let expected = buf.len();
        let mut received = 0;

        while received < expected {
            match reader.read(&mut buf[received..]) {
                Ok(0) => return Err(TunnelError::ConnectionClosed { received, expected }),
                Ok(n) => received += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(TunnelError::Transport(e)),
            }
        }

        Ok(())
    }

    /// Write all of `buf` to `writer`.
    pub fn write_exact<W: Write + ?Sized>(writer: &mut W, buf: &[u8]) -> TunnelResult<()> {
        let expected = buf.len();
        let mut written = 0;

        while written < expected {
            match writer.write(&buf[written..]) {
                Ok(0) => {
                    return Err(TunnelError::ConnectionClosed {
                        received: written,
                        expected,
                    })
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(TunnelError::Transport(e)),
            }
        }

        Ok(())
    }

    /// Write as much of `pending` as a non-blocking `writer` takes right now
    /// and remove that prefix. Returns the number of bytes written; stopping
    /// at `WouldBlock` is not an error.
    pub fn write_pending<W: Write + ?Sized>(
        writer: &mut W,
        pending: &mut Vec<u8>,
    ) -> TunnelResult<usize> {
        let expected = pending.len();
        let mut written = 0;

        while written < expected {
            match writer.write(&pending[written..]) {
                Ok(0) => {
                    return Err(TunnelError::ConnectionClosed {
                        received: written,
                        expected,
                    })
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(TunnelError::Transport(e)),
            }
        }

        pending.drain(..written);
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_exact_reports_orderly_close() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&[1, 2, 3]).await.unwrap();
        drop(a);

        let mut buf = [0u8; 8];
        match read_exact(&mut b, &mut buf).await {
            Err(TunnelError::ConnectionClosed { received, expected }) => {
                assert_eq!(received, 3);
                assert_eq!(expected, 8);
            }
            other => panic!("expected ConnectionClosed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn write_exact_fails_once_peer_is_gone() {
        let (mut a, b) = tokio::io::duplex(4);
        drop(b);
        let err = write_exact(&mut a, &[0u8; 16]).await.unwrap_err();
        assert!(matches!(err, TunnelError::Transport(_)));
    }

    #[test]
    fn blocking_read_exact_on_short_input() {
        let mut input: &[u8] = &[9, 8];
        let mut buf = [0u8; 4];
        let err = blocking::read_exact(&mut input, &mut buf).unwrap_err();
        assert!(matches!(
            err,
            TunnelError::ConnectionClosed {
                received: 2,
                expected: 4
            }
        ));
    }

    /// Accepts `room` bytes, then reports `WouldBlock`.
    struct Congested {
        accepted: Vec<u8>,
        room: usize,
    }

    impl std::io::Write for Congested {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.room == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.room).min(2);
            self.accepted.extend_from_slice(&buf[..n]);
            self.room -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn write_pending_keeps_what_did_not_fit() {
        let mut writer = Congested {
            accepted: Vec::new(),
            room: 5,
        };
        let mut pending = vec![1, 2, 3, 4, 5, 6, 7, 8];

        assert_eq!(blocking::write_pending(&mut writer, &mut pending).unwrap(), 5);
        assert_eq!(writer.accepted, [1, 2, 3, 4, 5]);
        assert_eq!(pending, [6, 7, 8]);

        // Still congested: nothing moves, nothing is lost
        assert_eq!(blocking::write_pending(&mut writer, &mut pending).unwrap(), 0);
        assert_eq!(pending, [6, 7, 8]);

        writer.room = 16;
        assert_eq!(blocking::write_pending(&mut writer, &mut pending).unwrap(), 3);
        assert!(pending.is_empty());
        assert_eq!(writer.accepted, [1, 2, 3, 4, 5, 6, 7, 8]);
    }
}
