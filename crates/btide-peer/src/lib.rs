//! Peer registry, request queue, and the per-peer session state
//! machine (`spec.md` §4.5-4.7).

pub mod error;
pub mod peer;
pub mod queue;
pub mod registry;
pub mod session;

pub use error::PeerError;
pub use peer::{PeerHandle, PeerId};
pub use queue::{Request, RequestQueue, RequestStatus};
pub use registry::PeerRegistry;
pub use session::{
    Direction, PeerSession, SessionState, SessionTimeouts, HANDSHAKE_TIMEOUT, RECV_TIMEOUT,
};
