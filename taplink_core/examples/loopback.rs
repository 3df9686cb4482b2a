//! Loopback demo: a threaded server and a client session in one process,
//! each bridged to an in-memory interface.
//!
//! Run with:
//! ```
//! cargo run -p taplink_core --features mock --example loopback
//! ```

use std::sync::Arc;

use taplink_core::acceptor::{Acceptor, PeerTargets};
use taplink_core::device::MemoryOpener;
use taplink_core::link::NoopObserver;
use taplink_core::logging;
use taplink_core::server::{connect_once, serve_threaded};
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _guard = logging::init_logging(logging::LogOptions {
        level: Level::DEBUG,
        ..Default::default()
    });

    let acceptor = Acceptor::bind("127.0.0.1:0".parse()?, 16)?;
    let targets = PeerTargets::new(acceptor.local_addr().to_string());

    let (server_opener, mut server_devices) = MemoryOpener::new();
    let (client_opener, mut client_devices) = MemoryOpener::new();
    let shutdown = CancellationToken::new();

    let server = tokio::spawn(serve_threaded(
        acceptor,
        server_opener,
        Arc::new(NoopObserver),
        shutdown.clone(),
    ));

    let client_shutdown = shutdown.clone();
    let client = tokio::spawn(async move {
        let mut connector = targets.connector();
        connect_once(
            &mut connector,
            &client_opener,
            Arc::new(NoopObserver),
            &client_shutdown,
        )
        .await
    });

    let client_dev = client_devices.recv().await.ok_or("client device missing")?;
    let mut server_dev = server_devices.recv().await.ok_or("server device missing")?;

    // A frame read from the client's interface appears on the server's
    client_dev.inject(vec![0xAA, 0xBB, 0xCC, 0xDD, 0xEE]);
    let frame = server_dev.next_written().await.ok_or("link closed")?;
    info!(?frame, "Frame crossed the link");

    shutdown.cancel();
    let stats = client.await??;
    server.await??;
    info!(frames_down = stats.frames_down, "Done");
    Ok(())
}
