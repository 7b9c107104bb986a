//! Error kinds for peer registry, request queue, and session operations
//! (`spec.md` §7).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("peer registry is at capacity ({max})")]
    Capacity { max: usize },

    #[error("peer {ip}:{port} is already connected")]
    DuplicatePeer { ip: String, port: u16 },

    #[error("no peer {ip}:{port} in the registry")]
    UnknownPeer { ip: String, port: u16 },

    #[error("no package loaded with ident {ident}")]
    UnknownPackage { ident: String },

    #[error("network timeout")]
    NetworkTimeout,

    #[error("network connection closed")]
    NetworkClosed,

    #[error("request queue has shut down")]
    QueueShutdown,

    #[error("wire codec error: {0}")]
    Codec(#[from] btide_wire::CodecError),

    #[error("package error: {0}")]
    Package(#[from] bpkg::BpkgError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
