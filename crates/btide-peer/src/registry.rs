//! Bounded peer registry (`spec.md` §4.5).
//!
//! All mutation is serialised by a single mutex; reads that need to
//! survive beyond the lock (e.g. the CLI listing peers) take a
//! snapshot rather than holding the lock across I/O (`spec.md` §9,
//! "registry reads by the CLI can use a snapshot").

use std::sync::Mutex;

use tracing::{debug, warn};

use crate::error::PeerError;
use crate::peer::{PeerHandle, PeerId};

pub struct PeerRegistry {
    peers: Mutex<Vec<PeerHandle>>,
    max: usize,
}

impl PeerRegistry {
    #[must_use]
    pub fn new(max: usize) -> Self {
        Self {
            peers: Mutex::new(Vec::new()),
            max,
        }
    }

    /// Add `handle`, failing if the registry is at capacity or
    /// `(ip, port)` is already present.
    pub fn add(&self, handle: PeerHandle) -> Result<(), PeerError> {
        let mut peers = self.peers.lock().expect("registry lock poisoned");
        if peers.iter().any(|p| p.id == handle.id) {
            warn!(peer = %handle.id, "rejecting duplicate peer");
            return Err(PeerError::DuplicatePeer {
                ip: handle.id.ip,
                port: handle.id.port,
            });
        }
        if peers.len() >= self.max {
            warn!(peer = %handle.id, max = self.max, "rejecting peer, registry at capacity");
            return Err(PeerError::Capacity { max: self.max });
        }
        debug!(peer = %handle.id, "peer added to registry");
        peers.push(handle);
        Ok(())
    }

    /// Remove the peer identified by `id`, if present.
    pub fn remove(&self, id: &PeerId) {
        let mut peers = self.peers.lock().expect("registry lock poisoned");
        let before = peers.len();
        peers.retain(|p| &p.id != id);
        if peers.len() != before {
            debug!(peer = %id, "peer removed from registry");
        }
    }

    /// Look up a peer by identity.
    #[must_use]
    pub fn find(&self, id: &PeerId) -> Option<PeerHandle> {
        self.peers
            .lock()
            .expect("registry lock poisoned")
            .iter()
            .find(|p| &p.id == id)
            .cloned()
    }

    /// Snapshot of every currently registered peer, safe to hold and
    /// iterate without the registry lock.
    #[must_use]
    pub fn snapshot(&self) -> Vec<PeerHandle> {
        self.peers.lock().expect("registry lock poisoned").clone()
    }

    /// Signal every currently registered session to terminate at its
    /// next cancellation checkpoint (`spec.md` §5, "cancellation
    /// flag"), without waiting for any of them to exit. Used on node
    /// shutdown, where every session should tear down promptly rather
    /// than linger until its next blocking read times out.
    pub fn cancel_all(&self) {
        for peer in self.snapshot() {
            peer.cancel();
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.lock().expect("registry lock poisoned").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
