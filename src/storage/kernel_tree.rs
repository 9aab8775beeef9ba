//! Authenticated kernel set
//!
//! An ordered set of kernel ids with a root digest over the sorted members.
//! A kernel can exist in the chain at most once: adding a duplicate is a
//! validation failure; removal happens only when rolling a block back.
//!
//! The root hashes the same way the UTXO tree does: every digest is
//! domain-tagged. Members enter as `kernel.leaf` digests and levels collapse
//! pairwise under `kernel.node`; an odd node is promoted to the next level
//! unchanged.

use std::collections::BTreeSet;
use thiserror::Error;

use crate::crypto::{Hash, Hasher};

/// Kernel tree errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KernelTreeError {
    #[error("Kernel already present")]
    Duplicate,
    #[error("Kernel not present")]
    NotFound,
    #[error("Malformed tree snapshot")]
    BadSnapshot,
}

fn leaf_digest(id: &Hash) -> Hash {
    let mut h = Hasher::with_tag("kernel.leaf");
    h.update(&id.0);
    h.finish()
}

fn node_digest(left: &Hash, right: &Hash) -> Hash {
    let mut h = Hasher::with_tag("kernel.node");
    h.update(&left.0).update(&right.0);
    h.finish()
}

/// Set of kernel ids with a cached root
#[derive(Debug, Clone, Default)]
pub struct KernelTree {
    kernels: BTreeSet<Hash>,
    cached_root: Option<Hash>,
}

impl KernelTree {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a kernel id; duplicates are a validation failure
    pub fn add(&mut self, id: Hash) -> Result<(), KernelTreeError> {
        if !self.kernels.insert(id) {
            return Err(KernelTreeError::Duplicate);
        }
        self.cached_root = None;
        Ok(())
    }

    /// Remove a kernel id (rollback only)
    pub fn remove(&mut self, id: &Hash) -> Result<(), KernelTreeError> {
        if !self.kernels.remove(id) {
            return Err(KernelTreeError::NotFound);
        }
        self.cached_root = None;
        Ok(())
    }

    /// Check membership
    pub fn contains(&self, id: &Hash) -> bool {
        self.kernels.contains(id)
    }

    /// Number of kernels
    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    /// Check if the set is empty
    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }

    /// Root digest over the sorted members; zero for an empty set
    pub fn root(&mut self) -> Hash {
        if let Some(root) = self.cached_root {
            return root;
        }
        let mut level: Vec<Hash> = self.kernels.iter().map(leaf_digest).collect();
        let root = if level.is_empty() {
            Hash::zero()
        } else {
            while level.len() > 1 {
                level = level
                    .chunks(2)
                    .map(|pair| match pair {
                        [left, right] => node_digest(left, right),
                        [odd] => *odd,
                        _ => unreachable!("chunks(2) yields one or two nodes"),
                    })
                    .collect();
            }
            level[0]
        };
        self.cached_root = Some(root);
        root
    }

    /// Flat snapshot of the sorted members
    pub fn serialize(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.kernels.len() * 32);
        for id in &self.kernels {
            bytes.extend_from_slice(&id.0);
        }
        bytes
    }

    /// Rebuild from a snapshot
    pub fn restore(bytes: &[u8]) -> Result<Self, KernelTreeError> {
        if bytes.len() % 32 != 0 {
            return Err(KernelTreeError::BadSnapshot);
        }
        let mut tree = KernelTree::new();
        for chunk in bytes.chunks_exact(32) {
            let mut id = [0u8; 32];
            id.copy_from_slice(chunk);
            tree.add(Hash(id)).map_err(|_| KernelTreeError::BadSnapshot)?;
        }
        Ok(tree)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hash_bytes;

    #[test]
    fn test_empty_root_is_zero() {
        assert_eq!(KernelTree::new().root(), Hash::zero());
    }

    #[test]
    fn test_single_member_root_is_tagged() {
        let mut tree = KernelTree::new();
        let id = hash_bytes(b"k1");
        tree.add(id).unwrap();
        // The root is a leaf digest, never the raw member
        assert_ne!(tree.root(), id);
        assert_ne!(tree.root(), Hash::zero());
    }

    #[test]
    fn test_duplicate_add_fails() {
        let mut tree = KernelTree::new();
        let id = hash_bytes(b"k1");
        tree.add(id).unwrap();
        assert_eq!(tree.add(id), Err(KernelTreeError::Duplicate));
    }

    #[test]
    fn test_remove_absent_fails() {
        let mut tree = KernelTree::new();
        assert_eq!(
            tree.remove(&hash_bytes(b"missing")),
            Err(KernelTreeError::NotFound)
        );
    }

    #[test]
    fn test_root_is_insertion_order_independent() {
        let ids: Vec<Hash> = (0u8..10).map(|i| hash_bytes(&[i])).collect();

        let mut a = KernelTree::new();
        for id in &ids {
            a.add(*id).unwrap();
        }
        let mut b = KernelTree::new();
        for id in ids.iter().rev() {
            b.add(*id).unwrap();
        }
        assert_eq!(a.root(), b.root());
    }

    #[test]
    fn test_promoted_odd_member_still_covered() {
        // With an odd count the highest member is promoted through the
        // levels rather than duplicated; changing it must change the root.
        let mut a = KernelTree::new();
        let mut b = KernelTree::new();
        for i in 0u8..4 {
            a.add(Hash([i; 32])).unwrap();
            b.add(Hash([i; 32])).unwrap();
        }
        a.add(Hash([0xFE; 32])).unwrap();
        b.add(Hash([0xFF; 32])).unwrap();
        assert_ne!(a.root(), b.root());
    }

    #[test]
    fn test_add_remove_restores_root() {
        let mut tree = KernelTree::new();
        for i in 0u8..5 {
            tree.add(hash_bytes(&[i])).unwrap();
        }
        let root = tree.root();

        let extra = hash_bytes(b"extra");
        tree.add(extra).unwrap();
        assert_ne!(tree.root(), root);
        tree.remove(&extra).unwrap();
        assert_eq!(tree.root(), root);
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let mut tree = KernelTree::new();
        for i in 0u8..7 {
            tree.add(hash_bytes(&[i])).unwrap();
        }
        let mut restored = KernelTree::restore(&tree.serialize()).unwrap();
        assert_eq!(restored.root(), tree.root());
        assert_eq!(restored.len(), tree.len());
    }
}
