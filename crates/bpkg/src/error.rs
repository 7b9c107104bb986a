//! Error kinds for manifest parsing, tree construction, and chunk
//! installation (`spec.md` §7).

use std::io;

use thiserror::Error;

use crate::hash::HashError;

/// Failure modes for the package/Merkle-tree engine.
#[derive(Debug, Error)]
pub enum BpkgError {
    #[error("manifest malformed: {0}")]
    ManifestParse(String),

    #[error("backing file I/O error: {0}")]
    BackingFileIo(#[from] io::Error),

    #[error("tree invariant violated: {0}")]
    TreeInvariant(String),

    #[error("chunk hash mismatch for expected hash {expected}")]
    HashMismatch { expected: String },

    #[error("no chunk known at offset {offset} with size {size}")]
    UnknownChunk { offset: u64, size: u32 },

    #[error("no node found for hash {0}")]
    UnknownHash(String),
}

impl From<HashError> for BpkgError {
    fn from(err: HashError) -> Self {
        Self::ManifestParse(err.to_string())
    }
}
