//! Block header (system state)
//!
//! The header commits to the roots of both authenticated structures; its
//! content hash is its identity.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::crypto::{hash_bytes, Hash};

/// Identity of a chain state: height plus header hash
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StateId {
    pub height: u64,
    pub hash: Hash,
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.height, &self.hash.to_hex()[..12])
    }
}

/// Block header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Block height; genesis is 1
    pub height: u64,
    /// Hash of the previous header (zero for genesis)
    pub prev_hash: Hash,
    /// Block timestamp (seconds since Unix epoch)
    pub timestamp: u64,
    /// Compact difficulty target
    pub difficulty: u32,
    /// Cumulative chain work through this block
    pub chain_work: u128,
    /// Root of the UTXO tree after applying this block
    pub utxo_root: Hash,
    /// Root of the kernel tree after applying this block
    pub kernel_root: Hash,
    /// PoW solution
    pub nonce: u64,
}

impl Header {
    /// Serialize the header for hashing
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(8 + 32 + 8 + 4 + 16 + 32 + 32 + 8);
        bytes.extend_from_slice(&self.height.to_le_bytes());
        bytes.extend_from_slice(&self.prev_hash.0);
        bytes.extend_from_slice(&self.timestamp.to_le_bytes());
        bytes.extend_from_slice(&self.difficulty.to_le_bytes());
        bytes.extend_from_slice(&self.chain_work.to_le_bytes());
        bytes.extend_from_slice(&self.utxo_root.0);
        bytes.extend_from_slice(&self.kernel_root.0);
        bytes.extend_from_slice(&self.nonce.to_le_bytes());
        bytes
    }

    /// Content hash of this header
    pub fn hash(&self) -> Hash {
        hash_bytes(&self.to_bytes())
    }

    /// Identity of the state this header defines
    pub fn id(&self) -> StateId {
        StateId {
            height: self.height,
            hash: self.hash(),
        }
    }

    /// Identity of the parent state; `None` for genesis
    pub fn parent_id(&self) -> Option<StateId> {
        (self.height > 1).then(|| StateId {
            height: self.height - 1,
            hash: self.prev_hash,
        })
    }

    /// Check if this is the genesis header
    pub fn is_genesis(&self) -> bool {
        self.height == 1 && self.prev_hash == Hash::zero()
    }
}
