//! Accept loop for inbound peer connections (`spec.md` §4.8).

use std::net::TcpListener;
use std::sync::Arc;

use btide_peer::{Direction, PeerHandle, PeerId, PeerSession};
use tracing::{info, warn};

use crate::wiring::Node;

/// Bind `node.config.bind_port`. Separated from [`serve`] so callers
/// (and tests) can observe the bound address before the accept loop
/// takes over — useful when `bind_port` is `0`.
pub fn bind(node: &Node) -> std::io::Result<TcpListener> {
    TcpListener::bind(("0.0.0.0", node.config.bind_port))
}

/// Accept connections on `listener` until the process exits or
/// accepting fails unrecoverably. Each accepted connection gets its
/// own peer record, runs the inbound handshake, and — only on success
/// — is offered to the registry; a capacity/duplicate rejection sends
/// `DSN` and closes without ever starting a session thread.
pub fn serve(node: Arc<Node>, listener: TcpListener) {
    info!(addr = ?listener.local_addr(), "listening for inbound peers");

    for incoming in listener.incoming() {
        let stream = match incoming {
            Ok(stream) => stream,
            Err(err) => {
                warn!(error = %err, "failed to accept inbound connection");
                continue;
            }
        };

        let node = Arc::clone(&node);
        std::thread::spawn(move || accept_one(&node, stream));
    }
}

/// Bind and serve in one call; the common case for `main`.
pub fn run(node: Arc<Node>) -> std::io::Result<()> {
    let listener = bind(&node)?;
    serve(node, listener);
    Ok(())
}

fn accept_one(node: &Arc<Node>, stream: std::net::TcpStream) {
    let Ok(addr) = stream.peer_addr() else {
        return;
    };
    let id = PeerId::new(addr.ip().to_string(), addr.port());
    let handle = PeerHandle::new(id.clone());

    let mut session = PeerSession::with_timeouts(
        id.clone(),
        stream,
        node.codec(),
        Arc::clone(&node.registry),
        Arc::clone(&node.queue),
        Arc::clone(&node.packages),
        handle.clone(),
        node.timeouts(),
    );

    if let Err(err) = session.handshake(Direction::Inbound) {
        info!(peer = %id, error = %err, "inbound handshake failed");
        return;
    }

    if let Err(err) = node.admit_inbound(id.clone(), handle, session) {
        warn!(peer = %id, error = %err, "rejected inbound peer, sending DSN");
    }
}
