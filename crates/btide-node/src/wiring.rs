//! Shared construction of the registry, request queue, and package
//! set consumed by the CLI collaborator (`spec.md` §2.9).

use std::net::TcpStream;
use std::sync::Arc;

use std::time::Duration;

use bpkg::PackageSet;
use btide_peer::{
    Direction, PeerError, PeerHandle, PeerId, PeerRegistry, PeerSession, RequestQueue, SessionTimeouts,
};
use btide_wire::Codec;
use tracing::info;

use crate::config::NodeConfig;

/// Everything a session needs that outlives any single connection.
pub struct Node {
    pub config: NodeConfig,
    pub registry: Arc<PeerRegistry>,
    pub queue: Arc<RequestQueue>,
    pub packages: Arc<PackageSet>,
}

impl Node {
    #[must_use]
    pub fn new(config: NodeConfig) -> Self {
        let registry = Arc::new(PeerRegistry::new(config.npeers_max));
        Self {
            config,
            registry,
            queue: Arc::new(RequestQueue::new()),
            packages: Arc::new(PackageSet::new()),
        }
    }

    #[must_use]
    pub fn codec(&self) -> Codec {
        Codec::new(self.config.payload_max)
    }

    /// Session deadlines as configured in `btide.toml`
    /// (`SPEC_FULL.md` §4.9), rather than the crate's hardcoded
    /// defaults.
    #[must_use]
    pub fn timeouts(&self) -> SessionTimeouts {
        SessionTimeouts {
            handshake: Duration::from_millis(self.config.handshake_timeout_ms),
            recv: Duration::from_millis(self.config.recv_timeout_ms),
        }
    }

    /// `CONNECT <ip> <port>` (`spec.md` §6): dial, handshake
    /// outbound, then admit to the registry and spawn the session
    /// thread. Handshake happens before the registry check, mirroring
    /// the listener's inbound ordering (`spec.md` §4.8).
    pub fn connect(&self, ip: &str, port: u16) -> Result<(), PeerError> {
        let id = PeerId::new(ip, port);
        let stream = TcpStream::connect((ip, port))?;
        self.start_session(id, stream, Direction::Outbound)
    }

    /// `DISCONNECT <ip> <port>` (`spec.md` §6): enqueue a `DSN` for
    /// the matching peer; its session sends it and tears itself down
    /// when it next drains the queue.
    pub fn disconnect(&self, ip: &str, port: u16) -> Arc<btide_peer::Request> {
        let id = PeerId::new(ip, port);
        let req = btide_peer::Request::new(id, btide_wire::Packet::Dsn);
        self.queue.enqueue(req.clone());
        req
    }

    /// Signal every active session to terminate at its next
    /// cancellation checkpoint and shut down the request queue.
    /// Called when the embedding host (the CLI's REPL) is exiting, so
    /// session threads tear down promptly instead of lingering until
    /// their next blocking read times out.
    pub fn shutdown(&self) {
        self.registry.cancel_all();
        self.queue.shutdown();
    }

    /// `FETCH <ip> <port> <ident> <chunk_hash>` (`spec.md` §6):
    /// enqueue a `REQ` for the whole chunk addressed by `offset`/`size`.
    pub fn fetch(
        &self,
        ip: &str,
        port: u16,
        ident: String,
        chunk_hash: String,
        offset: u32,
        size: u32,
    ) -> Arc<btide_peer::Request> {
        let id = PeerId::new(ip, port);
        let payload = btide_wire::ReqPayload {
            ident,
            chunk_hash,
            offset,
            size,
        };
        let req = btide_peer::Request::new(id, btide_wire::Packet::Req(payload));
        self.queue.enqueue(req.clone());
        req
    }

    /// `FETCH <ip> <port> <ident> <chunk_hash>` as typed by the CLI
    /// (`spec.md` §6): resolve `offset`/`size` from the requester's own
    /// copy of the manifest before enqueuing, since the wire `REQ`
    /// payload carries them explicitly (`spec.md` §4.4).
    pub fn fetch_by_hash(
        &self,
        ip: &str,
        port: u16,
        ident: &str,
        chunk_hash: &str,
    ) -> Result<Arc<btide_peer::Request>, PeerError> {
        let pkg = self
            .packages
            .find(ident)
            .ok_or_else(|| PeerError::UnknownPackage {
                ident: ident.to_owned(),
            })?;
        let (offset, size) = pkg
            .locate_chunk(chunk_hash)
            .ok_or_else(|| PeerError::Package(bpkg::BpkgError::UnknownHash(chunk_hash.to_owned())))?;
        let offset = u32::try_from(offset).map_err(|_| {
            PeerError::Package(bpkg::BpkgError::UnknownChunk {
                offset,
                size,
            })
        })?;
        Ok(self.fetch(ip, port, ident.to_owned(), chunk_hash.to_owned(), offset, size))
    }

    fn start_session(&self, id: PeerId, stream: TcpStream, direction: Direction) -> Result<(), PeerError> {
        let handle = PeerHandle::new(id.clone());
        let mut session = PeerSession::with_timeouts(
            id.clone(),
            stream,
            self.codec(),
            Arc::clone(&self.registry),
            Arc::clone(&self.queue),
            Arc::clone(&self.packages),
            handle.clone(),
            self.timeouts(),
        );

        session.handshake(direction)?;
        self.registry.add(handle)?;

        info!(peer = %id, "session admitted, spawning worker thread");
        std::thread::spawn(move || session.run_active());
        Ok(())
    }

    /// Admit an already-handshaken inbound connection, used by the
    /// listener which performs the handshake itself before deciding
    /// whether to admit the peer (`spec.md` §4.8). `handle` must be
    /// the same handle `session` was constructed with, so registry
    /// membership and the session's own cancellation flag stay the
    /// same object.
    pub(crate) fn admit_inbound(
        &self,
        id: PeerId,
        handle: PeerHandle,
        mut session: PeerSession,
    ) -> Result<(), PeerError> {
        if let Err(err) = self.registry.add(handle) {
            session.reject_with_dsn();
            return Err(err);
        }
        info!(peer = %id, "inbound session admitted, spawning worker thread");
        std::thread::spawn(move || session.run_active());
        Ok(())
    }
}
