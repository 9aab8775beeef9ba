//! Authenticated UTXO multiset
//!
//! A crit-bit (binary Patricia) tree over fixed-width keys
//! (33-byte commitment ‖ 8-byte big-endian maturity). Each leaf carries a
//! count: identical outputs created in different blocks share one node. The
//! tree shape is canonical for a given key set, so the root never depends on
//! insertion order. Node hashes are cached and recomputed only along the
//! path touched by a mutation.

use thiserror::Error;

use crate::crypto::{Commitment, Hash, Hasher};

/// Width of a UTXO key in bytes
pub const UTXO_KEY_LEN: usize = 41;

/// A UTXO tree key
pub type UtxoKey = [u8; UTXO_KEY_LEN];

/// Build the tree key for (commitment, maturity)
pub fn utxo_key(commitment: &Commitment, maturity: u64) -> UtxoKey {
    let mut key = [0u8; UTXO_KEY_LEN];
    key[..33].copy_from_slice(commitment.as_bytes());
    key[33..].copy_from_slice(&maturity.to_be_bytes());
    key
}

/// UTXO tree errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TreeError {
    #[error("Key not present in the tree")]
    NotFound,
    #[error("Malformed tree snapshot")]
    BadSnapshot,
}

#[derive(Debug, Clone)]
enum Node {
    Leaf {
        key: UtxoKey,
        count: u32,
        hash: Hash,
    },
    Branch {
        /// Index of the first bit on which the two subtrees differ
        bit: u16,
        left: Box<Node>,
        right: Box<Node>,
        hash: Hash,
    },
}

impl Node {
    fn leaf(key: UtxoKey, count: u32) -> Box<Node> {
        let mut h = Hasher::with_tag("utxo.leaf");
        h.update(&key).update(&count.to_le_bytes());
        Box::new(Node::Leaf {
            key,
            count,
            hash: h.finish(),
        })
    }

    fn branch(bit: u16, left: Box<Node>, right: Box<Node>) -> Box<Node> {
        let mut h = Hasher::with_tag("utxo.branch");
        h.update(&left.hash().0).update(&right.hash().0);
        let hash = h.finish();
        Box::new(Node::Branch {
            bit,
            left,
            right,
            hash,
        })
    }

    fn hash(&self) -> Hash {
        match self {
            Node::Leaf { hash, .. } | Node::Branch { hash, .. } => *hash,
        }
    }
}

fn bit_at(key: &UtxoKey, bit: u16) -> u8 {
    let byte = (bit / 8) as usize;
    let shift = 7 - (bit % 8);
    (key[byte] >> shift) & 1
}

/// First bit index on which two keys differ
fn crit_bit(a: &UtxoKey, b: &UtxoKey) -> Option<u16> {
    for i in 0..UTXO_KEY_LEN {
        let diff = a[i] ^ b[i];
        if diff != 0 {
            return Some((i * 8) as u16 + diff.leading_zeros() as u16);
        }
    }
    None
}

/// Authenticated multiset of unspent outputs
#[derive(Debug, Clone, Default)]
pub struct UtxoTree {
    root: Option<Box<Node>>,
    leaves: usize,
}

impl UtxoTree {
    /// Create an empty tree
    pub fn new() -> Self {
        Self::default()
    }

    /// Root hash; zero for an empty tree
    pub fn root(&self) -> Hash {
        match &self.root {
            Some(node) => node.hash(),
            None => Hash::zero(),
        }
    }

    /// Number of distinct keys
    pub fn len(&self) -> usize {
        self.leaves
    }

    /// Check if the tree is empty
    pub fn is_empty(&self) -> bool {
        self.leaves == 0
    }

    /// Multiplicity stored under a key (0 if absent)
    pub fn count(&self, key: &UtxoKey) -> u32 {
        let mut node = match &self.root {
            Some(node) => node.as_ref(),
            None => return 0,
        };
        loop {
            match node {
                Node::Leaf {
                    key: leaf_key,
                    count,
                    ..
                } => {
                    return if leaf_key == key { *count } else { 0 };
                }
                Node::Branch {
                    bit, left, right, ..
                } => {
                    node = if bit_at(key, *bit) == 0 { left } else { right };
                }
            }
        }
    }

    /// Insert one unit under a key
    pub fn add(&mut self, key: UtxoKey) {
        self.add_with_count(key, 1)
    }

    /// Insert `count` units under a key
    pub fn add_with_count(&mut self, key: UtxoKey, count: u32) {
        if count == 0 {
            return;
        }
        let Some(root) = self.root.take() else {
            self.root = Some(Node::leaf(key, count));
            self.leaves = 1;
            return;
        };

        // Locate the closest leaf, then restructure at the crit bit.
        let nearest = Self::nearest_leaf_key(&root, &key);
        match crit_bit(&key, &nearest) {
            None => self.root = Some(Self::bump(root, &key, count)),
            Some(crit) => {
                self.root = Some(Self::split_at(root, key, count, crit));
                self.leaves += 1;
            }
        }
    }

    /// Remove one unit under a key; the leaf disappears at count zero
    pub fn remove(&mut self, key: &UtxoKey) -> Result<(), TreeError> {
        let root = self.root.take().ok_or(TreeError::NotFound)?;
        match Self::remove_rec(root, key) {
            Ok((new_root, leaf_gone)) => {
                if leaf_gone {
                    self.leaves -= 1;
                }
                self.root = new_root;
                Ok(())
            }
            Err((root, e)) => {
                self.root = Some(root);
                Err(e)
            }
        }
    }

    fn nearest_leaf_key(node: &Node, key: &UtxoKey) -> UtxoKey {
        match node {
            Node::Leaf { key: leaf_key, .. } => *leaf_key,
            Node::Branch {
                bit, left, right, ..
            } => {
                if bit_at(key, *bit) == 0 {
                    Self::nearest_leaf_key(left, key)
                } else {
                    Self::nearest_leaf_key(right, key)
                }
            }
        }
    }

    fn bump(node: Box<Node>, key: &UtxoKey, delta: u32) -> Box<Node> {
        match *node {
            Node::Leaf {
                key: leaf_key,
                count,
                ..
            } => {
                debug_assert_eq!(&leaf_key, key);
                Node::leaf(leaf_key, count.saturating_add(delta))
            }
            Node::Branch {
                bit, left, right, ..
            } => {
                if bit_at(key, bit) == 0 {
                    Node::branch(bit, Self::bump(left, key, delta), right)
                } else {
                    Node::branch(bit, left, Self::bump(right, key, delta))
                }
            }
        }
    }

    fn split_at(node: Box<Node>, key: UtxoKey, count: u32, crit: u16) -> Box<Node> {
        let descend = match node.as_ref() {
            Node::Branch { bit, .. } => *bit < crit,
            Node::Leaf { .. } => false,
        };
        if descend {
            let Node::Branch {
                bit, left, right, ..
            } = *node
            else {
                unreachable!()
            };
            if bit_at(&key, bit) == 0 {
                Node::branch(bit, Self::split_at(left, key, count, crit), right)
            } else {
                Node::branch(bit, left, Self::split_at(right, key, count, crit))
            }
        } else {
            let new_leaf = Node::leaf(key, count);
            if bit_at(&key, crit) == 0 {
                Node::branch(crit, new_leaf, node)
            } else {
                Node::branch(crit, node, new_leaf)
            }
        }
    }

    #[allow(clippy::type_complexity)]
    fn remove_rec(
        node: Box<Node>,
        key: &UtxoKey,
    ) -> Result<(Option<Box<Node>>, bool), (Box<Node>, TreeError)> {
        match *node {
            Node::Leaf {
                key: leaf_key,
                count,
                ..
            } => {
                if &leaf_key != key {
                    return Err((Node::leaf(leaf_key, count), TreeError::NotFound));
                }
                if count > 1 {
                    Ok((Some(Node::leaf(leaf_key, count - 1)), false))
                } else {
                    Ok((None, true))
                }
            }
            Node::Branch {
                bit, left, right, ..
            } => {
                if bit_at(key, bit) == 0 {
                    match Self::remove_rec(left, key) {
                        Ok((None, gone)) => Ok((Some(right), gone)),
                        Ok((Some(left), gone)) => Ok((Some(Node::branch(bit, left, right)), gone)),
                        Err((left, e)) => Err((Node::branch(bit, left, right), e)),
                    }
                } else {
                    match Self::remove_rec(right, key) {
                        Ok((None, gone)) => Ok((Some(left), gone)),
                        Ok((Some(right), gone)) => {
                            Ok((Some(Node::branch(bit, left, right)), gone))
                        }
                        Err((right, e)) => Err((Node::branch(bit, left, right), e)),
                    }
                }
            }
        }
    }

    /// Sorted (key, count) entries
    pub fn entries(&self) -> Vec<(UtxoKey, u32)> {
        let mut out = Vec::with_capacity(self.leaves);
        if let Some(root) = &self.root {
            Self::collect(root, &mut out);
        }
        out
    }

    fn collect(node: &Node, out: &mut Vec<(UtxoKey, u32)>) {
        match node {
            Node::Leaf { key, count, .. } => out.push((*key, *count)),
            Node::Branch { left, right, .. } => {
                Self::collect(left, out);
                Self::collect(right, out);
            }
        }
    }

    /// Flat snapshot: `key ‖ count_le` per entry
    pub fn serialize(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.leaves * (UTXO_KEY_LEN + 4));
        for (key, count) in self.entries() {
            bytes.extend_from_slice(&key);
            bytes.extend_from_slice(&count.to_le_bytes());
        }
        bytes
    }

    /// Rebuild a tree from a snapshot
    pub fn restore(bytes: &[u8]) -> Result<Self, TreeError> {
        const ENTRY: usize = UTXO_KEY_LEN + 4;
        if bytes.len() % ENTRY != 0 {
            return Err(TreeError::BadSnapshot);
        }
        let mut tree = UtxoTree::new();
        for chunk in bytes.chunks_exact(ENTRY) {
            let mut key = [0u8; UTXO_KEY_LEN];
            key.copy_from_slice(&chunk[..UTXO_KEY_LEN]);
            let mut count = [0u8; 4];
            count.copy_from_slice(&chunk[UTXO_KEY_LEN..]);
            let count = u32::from_le_bytes(count);
            if count == 0 {
                return Err(TreeError::BadSnapshot);
            }
            tree.add_with_count(key, count);
        }
        Ok(tree)
    }
}
