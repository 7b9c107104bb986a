//! The `bpkg` package: a manifest bound to a backing data file and its
//! Merkle tree (`spec.md` §4.3).

use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, info, warn};

use crate::error::BpkgError;
use crate::manifest::parse_manifest;
use crate::tree::{HashMode, MerkleTree};

/// Outcome of ensuring the backing data file exists
/// (`spec.md` §4.3, "File-check").
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FileCheck {
    FileExists,
    FileCreated,
}

/// A loaded package: manifest metadata, the backing file, and its
/// Merkle tree. The tree is guarded by its own mutex so concurrent
/// chunk installs from different peer sessions serialize their
/// propagation to the root (`spec.md` §5, "package lock").
pub struct Package {
    pub ident: String,
    pub filename: PathBuf,
    pub file_size: u64,
    pub chunk_size: u32,
    pub chunk_count: u32,
    file: File,
    tree: Mutex<MerkleTree>,
}

impl Package {
    /// Load a manifest from `manifest_path`, ensure its backing file
    /// exists (sparse, zero-extended, per `spec.md` §3), and build its
    /// Merkle tree.
    pub fn load(manifest_path: &Path) -> Result<(Self, FileCheck), BpkgError> {
        let text = fs::read_to_string(manifest_path)?;
        let parsed = parse_manifest(&text)?;

        let filename = PathBuf::from(&parsed.filename);
        let file_check = ensure_backing_file(&filename, parsed.size)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&filename)?;

        let chunk_size = parsed.chunks.first().map_or(0, |c| c.size);
        let chunk_count = u32::try_from(parsed.chunks.len())
            .map_err(|_| BpkgError::TreeInvariant("too many chunks".to_owned()))?;

        let tree = MerkleTree::build(parsed.chunks, parsed.internal_hashes)?;

        info!(ident = %parsed.ident, chunks = chunk_count, "loaded package");

        Ok((
            Self {
                ident: parsed.ident,
                filename,
                file_size: parsed.size,
                chunk_size,
                chunk_count,
                file,
                tree: Mutex::new(tree),
            },
            file_check,
        ))
    }

    /// Every node's expected hash, pre-order.
    pub fn all_hashes(&self) -> Vec<String> {
        self.tree.lock().expect("tree lock poisoned").all_hashes()
    }

    /// Leaf expected hashes, left-to-right.
    pub fn all_chunk_hashes(&self) -> Vec<String> {
        self.tree
            .lock()
            .expect("tree lock poisoned")
            .all_chunk_hashes()
    }

    /// Leaves currently installed and verified, left-to-right.
    pub fn completed_chunk_hashes(&self) -> Vec<String> {
        self.tree
            .lock()
            .expect("tree lock poisoned")
            .completed_chunk_hashes()
    }

    /// The minimum set of leaf hashes covering current completion.
    pub fn min_completed_chunk_hashes(&self) -> Vec<String> {
        self.tree
            .lock()
            .expect("tree lock poisoned")
            .min_completed_chunk_hashes()
    }

    /// Leaf hashes beneath the node identified by `ancestor_hash`.
    pub fn chunks_from_hash(&self, ancestor_hash: &str) -> Result<Vec<String>, BpkgError> {
        let tree = self.tree.lock().expect("tree lock poisoned");
        let idx = tree
            .find_by_hash(ancestor_hash, HashMode::Expected)
            .ok_or_else(|| BpkgError::UnknownHash(ancestor_hash.to_owned()))?;
        Ok(tree.subtree_chunks(idx))
    }

    /// Locate the byte range of a chunk by its expected hash, whether
    /// or not it is currently complete. The CLI's `FETCH` command uses
    /// this to fill in the `offset`/`size` fields of an outgoing `REQ`
    /// (`spec.md` §6), which the requester must already know locally
    /// from its own copy of the manifest.
    pub fn locate_chunk(&self, chunk_hash: &str) -> Option<(u64, u32)> {
        let tree = self.tree.lock().expect("tree lock poisoned");
        let idx = tree.find_by_hash(chunk_hash, HashMode::Expected)?;
        let node = tree.node(idx);
        node.is_leaf.then(|| (node.chunk_offset, node.chunk_size))
    }

    /// Read a chunk's bytes from the backing file, but only when its
    /// leaf is complete (`spec.md` §5, "Shared resources": readers
    /// never race a concurrent writer for the same chunk because they
    /// only read chunks already marked complete).
    pub fn read_chunk(&self, chunk_hash: &str) -> Result<Option<Vec<u8>>, BpkgError> {
        let (offset, size) = {
            let tree = self.tree.lock().expect("tree lock poisoned");
            let Some(idx) = tree.find_by_hash(chunk_hash, HashMode::Expected) else {
                return Ok(None);
            };
            let node = tree.node(idx);
            if !node.is_leaf || !node.is_complete() {
                return Ok(None);
            }
            (node.chunk_offset, node.chunk_size)
        };

        let mut buf = vec![0_u8; size as usize];
        self.file.read_at(&mut buf, offset)?;
        Ok(Some(buf))
    }

    /// Validate `offset`/`data.len()` against a known leaf, write the
    /// bytes, recompute the leaf hash and propagate upward. Succeeds
    /// iff the freshly-computed leaf hash equals `expected_hash`;
    /// otherwise the in-memory hash is rolled back (`spec.md` §4.3,
    /// "Install-chunk").
    pub fn install_chunk(
        &self,
        expected_hash: &str,
        offset: u64,
        data: &[u8],
    ) -> Result<(), BpkgError> {
        let size = u32::try_from(data.len())
            .map_err(|_| BpkgError::TreeInvariant("chunk too large".to_owned()))?;

        let mut tree = self.tree.lock().expect("tree lock poisoned");
        let idx = tree
            .find_leaf_by_range(offset, size)
            .ok_or(BpkgError::UnknownChunk { offset, size })?;

        if tree.node(idx).expected_hash != expected_hash {
            return Err(BpkgError::UnknownChunk { offset, size });
        }

        self.file.write_at(data, offset)?;
        tree.install_leaf(idx, data);

        if tree.node(idx).is_complete() {
            debug!(ident = %self.ident, %offset, "chunk installed");
            Ok(())
        } else {
            warn!(ident = %self.ident, %offset, "chunk hash mismatch, rolling back");
            tree.clear_leaf(idx);
            Err(BpkgError::HashMismatch {
                expected: expected_hash.to_owned(),
            })
        }
    }
}

fn ensure_backing_file(filename: &Path, size: u64) -> Result<FileCheck, BpkgError> {
    if filename.exists() {
        return Ok(FileCheck::FileExists);
    }
    let file = File::create(filename)?;
    file.set_len(size)?;
    Ok(FileCheck::FileCreated)
}
