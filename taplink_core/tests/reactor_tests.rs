#![cfg(target_os = "linux")]

use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

use taplink_core::device::{SocketDevice, SocketDeviceHandle};
use taplink_core::link::{LinkId, NoopObserver};
use taplink_core::reactor::{ClosedLink, Reactor, ReactorHandle};
use taplink_core::TunnelError;
use tokio_util::sync::CancellationToken;

type TestReactor = Reactor<SocketDevice, UnixStream>;

const POLL: Duration = Duration::from_millis(20);

struct Peer {
    device: SocketDeviceHandle,
    wire: UnixStream,
}

fn new_reactor() -> TestReactor {
    Reactor::new(16, Arc::new(NoopObserver)).unwrap()
}

fn attach(reactor: &mut TestReactor, id: u64) -> Peer {
    let (device, handle) = SocketDevice::pair(format!("sock{id}")).unwrap();
    let (transport, wire) = UnixStream::pair().unwrap();
    reactor.attach(LinkId(id), None, device, transport).unwrap();

    wire.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    handle
        .socket
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    Peer {
        device: handle,
        wire,
    }
}

/// Poll until `done` holds, collecting links that close along the way.
fn poll_until<F>(reactor: &mut TestReactor, mut done: F) -> Vec<ClosedLink>
where
    F: FnMut(&TestReactor, &[ClosedLink]) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(2);
    let mut closed = Vec::new();
    while !done(reactor, &closed) {
        assert!(Instant::now() < deadline, "reactor made no progress");
        closed.extend(reactor.poll_once(POLL).unwrap());
    }
    closed
}

fn frames_up(reactor: &TestReactor, id: u64) -> u64 {
    reactor.stats(LinkId(id)).map_or(0, |s| s.frames_up)
}

fn frames_down(reactor: &TestReactor, id: u64) -> u64 {
    reactor.stats(LinkId(id)).map_or(0, |s| s.frames_down)
}

fn closed_with(id: u64) -> impl FnMut(&TestReactor, &[ClosedLink]) -> bool {
    move |_, closed| closed.iter().any(|c| c.info.id == LinkId(id))
}

#[test]
fn forwards_both_directions() {
    let mut reactor = new_reactor();
    let mut peer = attach(&mut reactor, 1);

    peer.wire
        .write_all(&[0, 0, 0, 5, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE])
        .unwrap();
    poll_until(&mut reactor, |r, _| frames_up(r, 1) == 1);

    let mut buf = [0u8; 64];
    let n = peer.device.socket.recv(&mut buf).unwrap();
    assert_eq!(&buf[..n], &[0xAA, 0xBB, 0xCC, 0xDD, 0xEE]);

    peer.device.socket.send(&[0x11, 0x22, 0x33, 0x44]).unwrap();
    poll_until(&mut reactor, |r, _| frames_down(r, 1) == 1);

    let mut wire = [0u8; 8];
    peer.wire.read_exact(&mut wire).unwrap();
    assert_eq!(wire, [0, 0, 0, 4, 0x11, 0x22, 0x33, 0x44]);
}

#[test]
fn two_links_never_cross_deliver() {
    let mut reactor = new_reactor();
    let mut a = attach(&mut reactor, 1);
    let mut b = attach(&mut reactor, 2);

    a.wire.write_all(&[0, 0, 0, 2, b'a', b'a']).unwrap();
    b.wire.write_all(&[0, 0, 0, 3, b'b', b'b', b'b']).unwrap();
    poll_until(&mut reactor, |r, _| frames_up(r, 1) == 1 && frames_up(r, 2) == 1);

    let mut buf = [0u8; 64];
    let n = a.device.socket.recv(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"aa");
    let n = b.device.socket.recv(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"bbb");

    // Nothing else arrived on either interface
    for peer in [&a, &b] {
        peer.device.socket.set_nonblocking(true).unwrap();
        let err = peer.device.socket.recv(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    // And the reverse direction stays on its own link too
    b.device.socket.send(b"from-b").unwrap();
    poll_until(&mut reactor, |r, _| frames_down(r, 2) == 1);
    assert_eq!(frames_down(&reactor, 1), 0);

    let mut wire = [0u8; 10];
    b.wire.read_exact(&mut wire).unwrap();
    assert_eq!(&wire[4..], b"from-b");
    a.wire.set_nonblocking(true).unwrap();
    assert_eq!(
        a.wire.read(&mut wire).unwrap_err().kind(),
        io::ErrorKind::WouldBlock
    );
}

#[test]
fn dribbled_frame_is_reassembled() {
    let mut reactor = new_reactor();
    let mut peer = attach(&mut reactor, 1);

    for byte in [0u8, 0, 0, 3, 7, 8, 9] {
        peer.wire.write_all(&[byte]).unwrap();
        reactor.poll_once(POLL).unwrap();
    }
    poll_until(&mut reactor, |r, _| frames_up(r, 1) == 1);

    let mut buf = [0u8; 16];
    let n = peer.device.socket.recv(&mut buf).unwrap();
    assert_eq!(&buf[..n], &[7, 8, 9]);
}

#[test]
fn oversized_length_closes_only_that_link() {
    let mut reactor = new_reactor();
    let mut bad = attach(&mut reactor, 1);
    let mut good = attach(&mut reactor, 2);

    bad.wire.write_all(&100_000u32.to_be_bytes()).unwrap();
    bad.wire.write_all(&[0x55; 32]).unwrap();
    let closed = poll_until(&mut reactor, closed_with(1));

    let link = closed.iter().find(|c| c.info.id == LinkId(1)).unwrap();
    assert!(matches!(
        link.error,
        Some(TunnelError::ProtocolViolation {
            declared: 100_000,
            ..
        })
    ));
    assert!(!reactor.contains(LinkId(1)));
    assert_eq!(bad.device.closed_count(), 1);

    // Nothing reached the interface and the transport was closed
    bad.device.socket.set_nonblocking(true).unwrap();
    let mut buf = [0u8; 64];
    assert!(bad.device.socket.recv(&mut buf).is_err());
    let mut rest = Vec::new();
    assert_eq!(bad.wire.read_to_end(&mut rest).unwrap(), 0);

    // The other link is unaffected
    good.wire.write_all(&[0, 0, 0, 1, 0x42]).unwrap();
    poll_until(&mut reactor, |r, _| frames_up(r, 2) == 1);
    let n = good.device.socket.recv(&mut buf).unwrap();
    assert_eq!(&buf[..n], &[0x42]);
}

#[test]
fn peer_close_releases_device_once() {
    let mut reactor = new_reactor();
    let peer = attach(&mut reactor, 1);
    let Peer { device, wire } = peer;

    drop(wire);
    let closed = poll_until(&mut reactor, closed_with(1));

    assert!(closed[0].error.is_none());
    assert_eq!(device.closed_count(), 1);
    assert!(reactor.is_empty());
    assert!(reactor.detach(LinkId(1)).is_none());
    assert_eq!(device.closed_count(), 1);
}

#[test]
fn truncated_payload_is_reported() {
    let mut reactor = new_reactor();
    let mut peer = attach(&mut reactor, 1);

    peer.wire.write_all(&[0, 0, 0, 10, 1, 2, 3]).unwrap();
    let Peer { device, wire } = peer;
    drop(wire);

    let closed = poll_until(&mut reactor, closed_with(1));
    assert!(matches!(
        closed[0].error,
        Some(TunnelError::Truncated {
            expected: 10,
            actual: 3
        })
    ));
    assert_eq!(device.closed_count(), 1);
}

#[test]
fn detach_is_idempotent() {
    let mut reactor = new_reactor();
    let peer = attach(&mut reactor, 7);
    assert_eq!(reactor.len(), 1);

    let closed = reactor.detach(LinkId(7)).unwrap();
    assert!(closed.error.is_none());
    assert!(reactor.detach(LinkId(7)).is_none());
    assert_eq!(peer.device.closed_count(), 1);
}

#[test]
fn stalled_peer_does_not_hold_up_other_links() {
    const LIMIT: usize = 64 * 1024;
    let mut reactor = new_reactor().with_backlog_limit(LIMIT);
    // `stalled.wire` is never read
    let stalled = attach(&mut reactor, 1);
    let mut live = attach(&mut reactor, 2);
    stalled.device.socket.set_nonblocking(true).unwrap();

    let frame = [0x5A; 1500];
    let flood = |reactor: &mut TestReactor| {
        while stalled.device.socket.send(&frame).is_ok() {}
        reactor.poll_once(Duration::from_millis(1)).unwrap()
    };

    // Fill the socket buffer until output starts queueing in the reactor
    let deadline = Instant::now() + Duration::from_secs(5);
    while reactor.queued_bytes(LinkId(1)) == Some(0) {
        assert!(Instant::now() < deadline, "transport never filled up");
        assert!(flood(&mut reactor).is_empty());
    }

    live.wire.write_all(&[0, 0, 0, 1, 0x42]).unwrap();
    poll_until(&mut reactor, |r, _| frames_up(r, 2) == 1);
    assert!(reactor.contains(LinkId(1)));

    let mut buf = [0u8; 16];
    let n = live.device.socket.recv(&mut buf).unwrap();
    assert_eq!(&buf[..n], &[0x42]);

    // Keep flooding until the backlog limit is crossed
    let deadline = Instant::now() + Duration::from_secs(5);
    let closed = loop {
        assert!(Instant::now() < deadline, "stalled link was never dropped");
        let closed = flood(&mut reactor);
        if !closed.is_empty() {
            break closed;
        }
    };
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].info.id, LinkId(1));
    match closed[0].error {
        Some(TunnelError::PeerStalled { queued, limit }) => {
            assert_eq!(limit, LIMIT);
            assert!(queued > LIMIT);
        }
        ref other => panic!("expected PeerStalled, got {other:?}"),
    }
    assert_eq!(stalled.device.closed_count(), 1);
    assert!(reactor.contains(LinkId(2)));
}

#[test]
fn queued_output_drains_once_peer_reads() {
    let mut reactor = new_reactor();
    let mut peer = attach(&mut reactor, 1);
    peer.device.socket.set_nonblocking(true).unwrap();

    let frame = [0x33; 1000];
    let deadline = Instant::now() + Duration::from_secs(5);
    while reactor.queued_bytes(LinkId(1)) == Some(0) {
        assert!(Instant::now() < deadline, "transport never filled up");
        while peer.device.socket.send(&frame).is_ok() {}
        assert!(reactor.poll_once(Duration::from_millis(1)).unwrap().is_empty());
    }

    // Read everything the reactor forwards until the transport closes
    let reader = std::thread::spawn(move || {
        let mut frames = 0u64;
        let mut encoded = [0u8; 1004];
        while peer.wire.read_exact(&mut encoded).is_ok() {
            assert_eq!(&encoded[..4], &[0, 0, 0x03, 0xE8]);
            assert!(encoded[4..].iter().all(|&b| b == 0x33));
            frames += 1;
        }
        (frames, peer)
    });

    // Every frame counted so far has been handed to the socket
    poll_until(&mut reactor, |r, _| r.queued_bytes(LinkId(1)) == Some(0));
    let sent = frames_down(&reactor, 1);
    let closed = reactor.detach(LinkId(1)).unwrap();
    assert!(closed.error.is_none());

    let (received, _peer) = reader.join().unwrap();
    assert_eq!(received, sent);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handle_wakes_idle_reactor() {
    let shutdown = CancellationToken::new();
    // Far longer than the test may take, so only a wakeup gets the link in
    let handle = ReactorHandle::spawn(new_reactor(), &shutdown, Duration::from_secs(60));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (device, device_handle) = SocketDevice::pair("sock1").unwrap();
    let (transport, mut wire) = UnixStream::pair().unwrap();
    device_handle
        .socket
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    let started = Instant::now();
    handle.attach(None, device, transport).unwrap();
    wire.write_all(&[0, 0, 0, 1, 0x42]).unwrap();

    let (received, device_handle) = tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; 16];
        let received = device_handle.socket.recv(&mut buf).map(|n| buf[..n].to_vec());
        (received, device_handle)
    })
    .await
    .unwrap();
    assert_eq!(received.unwrap(), vec![0x42]);
    assert!(started.elapsed() < Duration::from_secs(5));

    tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
        .await
        .expect("reactor did not stop");
    assert_eq!(device_handle.closed_count(), 1);
}
