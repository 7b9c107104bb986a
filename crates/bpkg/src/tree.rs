//! Complete binary Merkle tree over a package's chunks (`spec.md` §4.2).
//!
//! Nodes live in a flat `Vec`, indexed so that node `i`'s children sit
//! at `2i + 1` and `2i + 2` and its parent at `(i - 1) / 2`. This flat,
//! singly-owned layout is the deliberate replacement for the original
//! C implementation's raw child→parent pointers (`spec.md` §9): there
//! is exactly one owner of tree memory, so there is no way to express
//! the original's double-free of the tree root.

use crate::error::BpkgError;

/// Which hash field [`MerkleTree::find_by_hash`] compares against.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HashMode {
    Expected,
    Computed,
}

/// A single node of the tree. Leaves additionally carry the byte range
/// of the backing file they cover.
#[derive(Clone, Debug)]
pub struct Node {
    pub expected_hash: String,
    pub computed_hash: Option<String>,
    pub left: Option<usize>,
    pub right: Option<usize>,
    pub parent: Option<usize>,
    pub is_leaf: bool,
    pub chunk_offset: u64,
    pub chunk_size: u32,
}

impl Node {
    /// A leaf is complete when its computed hash matches the expected
    /// one; an internal node uses the same equality, maintained solely
    /// by [`MerkleTree::install_leaf`]'s upward propagation.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.computed_hash.as_deref() == Some(self.expected_hash.as_str())
    }
}

/// One chunk record from the manifest's `chunks:` section.
#[derive(Clone, Debug)]
pub struct ChunkRecord {
    pub expected_hash: String,
    pub offset: u64,
    pub size: u32,
}

/// A complete binary Merkle tree built from a manifest's chunk and
/// internal-hash lists.
#[derive(Clone, Debug)]
pub struct MerkleTree {
    nodes: Vec<Node>,
    height: u32,
    chunk_count: u32,
}

impl MerkleTree {
    /// Build the tree shape, assign leaf hashes from `chunks`
    /// left-to-right, and assign internal hashes from
    /// `internal_hashes` in pre-order (manifest order). Fails when
    /// `chunks.len()` is not a power of two or when
    /// `internal_hashes.len() != chunks.len() - 1`.
    pub fn build(
        chunks: Vec<ChunkRecord>,
        internal_hashes: Vec<String>,
    ) -> Result<Self, BpkgError> {
        let chunk_count = u32::try_from(chunks.len())
            .map_err(|_| BpkgError::TreeInvariant("too many chunks".to_owned()))?;

        if chunk_count == 0 || !chunk_count.is_power_of_two() {
            return Err(BpkgError::TreeInvariant(format!(
                "chunk count {chunk_count} is not a power of two"
            )));
        }
        if internal_hashes.len() != chunks.len() - 1 {
            return Err(BpkgError::TreeInvariant(format!(
                "expected {} internal hashes, got {}",
                chunks.len() - 1,
                internal_hashes.len()
            )));
        }

        let height = chunk_count.trailing_zeros();
        let total = 2 * chunks.len() - 1;
        let leaf_start = chunks.len() - 1;

        let mut nodes: Vec<Node> = (0..total)
            .map(|i| {
                let left = 2 * i + 1;
                let right = 2 * i + 2;
                Node {
                    expected_hash: String::new(),
                    computed_hash: None,
                    left: (left < total).then_some(left),
                    right: (right < total).then_some(right),
                    parent: (i > 0).then(|| (i - 1) / 2),
                    is_leaf: left >= total,
                    chunk_offset: 0,
                    chunk_size: 0,
                }
            })
            .collect();

        for (i, chunk) in chunks.into_iter().enumerate() {
            let node = &mut nodes[leaf_start + i];
            node.expected_hash = chunk.expected_hash;
            node.chunk_offset = chunk.offset;
            node.chunk_size = chunk.size;
        }

        let mut internal_iter = internal_hashes.into_iter();
        assign_internal_preorder(&mut nodes, 0, &mut internal_iter);

        Ok(Self {
            nodes,
            height,
            chunk_count,
        })
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[must_use]
    pub fn chunk_count(&self) -> u32 {
        self.chunk_count
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[must_use]
    pub fn node(&self, idx: usize) -> &Node {
        &self.nodes[idx]
    }

    #[must_use]
    pub fn root(&self) -> &Node {
        &self.nodes[0]
    }

    /// Index of the first leaf (leaves occupy the contiguous tail of
    /// the array, already in left-to-right order).
    fn leaf_start(&self) -> usize {
        self.nodes.len() - self.chunk_count as usize
    }

    /// Leaf node at position `i` (0-indexed, left-to-right).
    #[must_use]
    pub fn leaf(&self, i: usize) -> &Node {
        &self.nodes[self.leaf_start() + i]
    }

    /// Node index (suitable for [`install_leaf`](Self::install_leaf))
    /// of the leaf whose byte range matches `offset`/`size` exactly.
    #[must_use]
    pub fn find_leaf_by_range(&self, offset: u64, size: u32) -> Option<usize> {
        (self.leaf_start()..self.nodes.len())
            .find(|&idx| self.nodes[idx].chunk_offset == offset && self.nodes[idx].chunk_size == size)
    }

    /// Set a leaf's computed hash from freshly-installed data, then
    /// recompute every ancestor's computed hash up to the root.
    /// `spec.md` §4.2 ("Compute"): this is the sole way internal
    /// `computed_hash` is updated.
    pub fn install_leaf(&mut self, leaf_idx: usize, data: &[u8]) {
        self.nodes[leaf_idx].computed_hash = Some(crate::hash::hash_bytes(data));
        let mut cursor = self.nodes[leaf_idx].parent;
        while let Some(idx) = cursor {
            let left = self.nodes[idx].left.expect("internal node has left child");
            let right = self.nodes[idx]
                .right
                .expect("internal node has right child");
            let left_hash = self.nodes[left].computed_hash.clone().unwrap_or_default();
            let right_hash = self.nodes[right].computed_hash.clone().unwrap_or_default();
            let combined = format!("{left_hash}{right_hash}");
            self.nodes[idx].computed_hash = Some(crate::hash::hash_bytes(combined.as_bytes()));
            cursor = self.nodes[idx].parent;
        }
    }

    /// Undo a failed install: reset a leaf's computed hash and
    /// re-propagate, so a verification failure never leaves a stale
    /// "looks complete" ancestor hash behind.
    pub fn clear_leaf(&mut self, leaf_idx: usize) {
        self.nodes[leaf_idx].computed_hash = None;
        let mut cursor = self.nodes[leaf_idx].parent;
        while let Some(idx) = cursor {
            let left = self.nodes[idx].left.expect("internal node has left child");
            let right = self.nodes[idx]
                .right
                .expect("internal node has right child");
            let left_hash = self.nodes[left].computed_hash.clone().unwrap_or_default();
            let right_hash = self.nodes[right].computed_hash.clone().unwrap_or_default();
            let combined = format!("{left_hash}{right_hash}");
            self.nodes[idx].computed_hash = Some(crate::hash::hash_bytes(combined.as_bytes()));
            cursor = self.nodes[idx].parent;
        }
    }

    /// First node in pre-order (root, left subtree, right subtree)
    /// whose selected hash field equals `query`.
    #[must_use]
    pub fn find_by_hash(&self, query: &str, mode: HashMode) -> Option<usize> {
        self.find_preorder(0, query, mode)
    }

    fn find_preorder(&self, idx: usize, query: &str, mode: HashMode) -> Option<usize> {
        let node = &self.nodes[idx];
        let selected = match mode {
            HashMode::Expected => Some(node.expected_hash.as_str()),
            HashMode::Computed => node.computed_hash.as_deref(),
        };
        if selected == Some(query) {
            return Some(idx);
        }
        if let Some(left) = node.left {
            if let Some(found) = self.find_preorder(left, query, mode) {
                return Some(found);
            }
        }
        if let Some(right) = node.right {
            if let Some(found) = self.find_preorder(right, query, mode) {
                return Some(found);
            }
        }
        None
    }

    /// Leaf `expected_hash` values beneath `idx`, left-to-right (the
    /// node itself if it is a leaf).
    #[must_use]
    pub fn subtree_chunks(&self, idx: usize) -> Vec<String> {
        let node = &self.nodes[idx];
        if node.is_leaf {
            return vec![node.expected_hash.clone()];
        }
        let mut out = Vec::new();
        if let Some(left) = node.left {
            out.extend(self.subtree_chunks(left));
        }
        if let Some(right) = node.right {
            out.extend(self.subtree_chunks(right));
        }
        out
    }

    /// Roots of maximal complete subtrees, left-to-right — the
    /// minimum set of hashes that fully attest current completion
    /// (`spec.md` §4.2, "Largest completed subtree").
    #[must_use]
    pub fn largest_completed_subtrees(&self) -> Vec<usize> {
        self.largest_completed_from(0)
    }

    fn largest_completed_from(&self, idx: usize) -> Vec<usize> {
        let node = &self.nodes[idx];
        if node.is_complete() {
            return vec![idx];
        }
        if node.is_leaf {
            return Vec::new();
        }
        let mut out = Vec::new();
        if let Some(left) = node.left {
            out.extend(self.largest_completed_from(left));
        }
        if let Some(right) = node.right {
            out.extend(self.largest_completed_from(right));
        }
        out
    }

    /// Every node's expected hash, pre-order.
    #[must_use]
    pub fn all_hashes(&self) -> Vec<String> {
        let mut out = Vec::with_capacity(self.nodes.len());
        self.collect_preorder(0, &mut out);
        out
    }

    fn collect_preorder(&self, idx: usize, out: &mut Vec<String>) {
        let node = &self.nodes[idx];
        out.push(node.expected_hash.clone());
        if let Some(left) = node.left {
            self.collect_preorder(left, out);
        }
        if let Some(right) = node.right {
            self.collect_preorder(right, out);
        }
    }

    /// Leaf expected hashes, left-to-right.
    #[must_use]
    pub fn all_chunk_hashes(&self) -> Vec<String> {
        self.nodes[self.leaf_start()..]
            .iter()
            .map(|n| n.expected_hash.clone())
            .collect()
    }

    /// Leaves where `computed_hash == expected_hash`, left-to-right.
    #[must_use]
    pub fn completed_chunk_hashes(&self) -> Vec<String> {
        self.nodes[self.leaf_start()..]
            .iter()
            .filter(|n| n.is_complete())
            .map(|n| n.expected_hash.clone())
            .collect()
    }

    /// The smallest set of leaf hashes that covers all complete
    /// chunks: `subtree_chunks` flattened over
    /// `largest_completed_subtrees`.
    #[must_use]
    pub fn min_completed_chunk_hashes(&self) -> Vec<String> {
        self.largest_completed_subtrees()
            .into_iter()
            .flat_map(|idx| self.subtree_chunks(idx))
            .collect()
    }
}

/// Assign `internal_hashes` to internal nodes in pre-order, skipping
/// leaves entirely (the manifest's `hashes:` section lists internal
/// nodes only).
fn assign_internal_preorder(
    nodes: &mut [Node],
    idx: usize,
    internal_hashes: &mut impl Iterator<Item = String>,
) {
    if nodes[idx].is_leaf {
        return;
    }
    nodes[idx].expected_hash = internal_hashes
        .next()
        .expect("internal hash count already validated against chunk count");
    if let Some(left) = nodes[idx].left {
        assign_internal_preorder(nodes, left, internal_hashes);
    }
    if let Some(right) = nodes[idx].right {
        assign_internal_preorder(nodes, right, internal_hashes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(hash: &str, offset: u64, size: u32) -> ChunkRecord {
        ChunkRecord {
            expected_hash: hash.to_owned(),
            offset,
            size,
        }
    }

    fn build_two_leaf() -> MerkleTree {
        let l0 = "0".repeat(64);
        let l1 = "1".repeat(64);
        let root = crate::hash::hash_bytes(format!("{l0}{l1}").as_bytes());
        MerkleTree::build(
            vec![leaf(&l0, 0, 16), leaf(&l1, 16, 16)],
            vec![root],
        )
        .unwrap()
    }

    #[test]
    fn single_leaf_tree_root_is_leaf() {
        let hash = "a".repeat(64);
        let tree = MerkleTree::build(vec![leaf(&hash, 0, 16)], vec![]).unwrap();
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.height(), 0);
        assert!(tree.root().is_leaf);
        assert_eq!(tree.root().expected_hash, hash);
    }

    #[test]
    fn rejects_non_power_of_two_chunk_count() {
        let h = "a".repeat(64);
        let err = MerkleTree::build(vec![leaf(&h, 0, 1), leaf(&h, 1, 1), leaf(&h, 2, 1)], vec![h.clone(), h])
            .unwrap_err();
        assert!(matches!(err, BpkgError::TreeInvariant(_)));
    }

    #[test]
    fn rejects_wrong_internal_hash_count() {
        let h = "a".repeat(64);
        let err = MerkleTree::build(vec![leaf(&h, 0, 1), leaf(&h, 1, 1)], vec![]).unwrap_err();
        assert!(matches!(err, BpkgError::TreeInvariant(_)));
    }

    #[test]
    fn two_leaf_shape_and_parent_links() {
        let tree = build_two_leaf();
        assert_eq!(tree.len(), 3);
        assert_eq!(tree.root().left, Some(1));
        assert_eq!(tree.root().right, Some(2));
        assert_eq!(tree.node(1).parent, Some(0));
        assert_eq!(tree.node(2).parent, Some(0));
        assert!(tree.node(1).is_leaf);
        assert!(tree.node(2).is_leaf);
    }

    #[test]
    fn install_propagates_to_root_and_completes() {
        let mut tree = build_two_leaf();
        let leaf0_hash = crate::hash::hash_bytes(&[0u8; 16]);
        let leaf1_hash = crate::hash::hash_bytes(&[1u8; 16]);
        // rebuild with matching data so completion can actually succeed
        let expected_root =
            crate::hash::hash_bytes(format!("{leaf0_hash}{leaf1_hash}").as_bytes());
        tree = MerkleTree::build(
            vec![leaf(&leaf0_hash, 0, 16), leaf(&leaf1_hash, 16, 16)],
            vec![expected_root],
        )
        .unwrap();

        assert!(tree.largest_completed_subtrees().is_empty());

        tree.install_leaf(1, &[0u8; 16]);
        assert!(tree.leaf(0).is_complete());
        assert!(!tree.root().is_complete());
        assert_eq!(
            tree.largest_completed_subtrees(),
            vec![1]
        );

        tree.install_leaf(2, &[1u8; 16]);
        assert!(tree.root().is_complete());
        assert_eq!(tree.largest_completed_subtrees(), vec![0]);
        assert_eq!(tree.min_completed_chunk_hashes(), vec![leaf0_hash, leaf1_hash]);
    }

    #[test]
    fn bad_chunk_does_not_complete_leaf() {
        let mut tree = build_two_leaf();
        tree.install_leaf(1, b"tampered");
        assert!(!tree.leaf(0).is_complete());
    }

    #[test]
    fn find_by_hash_prefers_preorder() {
        let tree = build_two_leaf();
        let root_hash = tree.root().expected_hash.clone();
        assert_eq!(tree.find_by_hash(&root_hash, HashMode::Expected), Some(0));
    }

    #[test]
    fn subtree_chunks_of_leaf_is_itself() {
        let tree = build_two_leaf();
        let l0 = tree.leaf(0).expected_hash.clone();
        assert_eq!(tree.subtree_chunks(1), vec![l0]);
    }
}
