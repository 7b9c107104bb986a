//! Peer identity and the per-peer handle shared between the registry,
//! the request queue, and a peer's session thread (`spec.md` §3).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// `(ip, port)` uniquely identifies a peer; the registry enforces no
/// two peers share one.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct PeerId {
    pub ip: String,
    pub port: u16,
}

impl PeerId {
    #[must_use]
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self { ip: ip.into(), port }
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// A lightweight handle to a peer's session, cheap to clone and share.
/// The registry holds these for membership bookkeeping; the socket and
/// session thread live only inside [`crate::session::PeerSession`]
/// (`spec.md` §4.5: "the registry does not own socket I/O").
#[derive(Clone, Debug)]
pub struct PeerHandle {
    pub id: PeerId,
    cancel: Arc<AtomicBool>,
}

impl PeerHandle {
    #[must_use]
    pub fn new(id: PeerId) -> Self {
        Self {
            id,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Request that this peer's session terminate at its next
    /// cancellation checkpoint (`spec.md` §5, "cancellation flag").
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}
