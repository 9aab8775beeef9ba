//! Key derivation
//!
//! Deterministic derivation of output and kernel keys from a node secret,
//! keyed by purpose, height, and index. The block builder derives its
//! coinbase, commission, and kernel keys this way so a wallet holding the
//! same secret can recognize and spend them.

use k256::Scalar;
use rand::rngs::OsRng;
use rand::RngCore;

use super::{scalar_from_hash, Hasher};

/// Purpose of a derived key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    /// Coinbase output of a mined block
    Coinbase,
    /// Fee-collection output of a mined block
    Commission,
    /// Kernel excess key
    Kernel,
}

impl KeyType {
    fn tag(self) -> u8 {
        match self {
            KeyType::Coinbase => 0,
            KeyType::Commission => 1,
            KeyType::Kernel => 2,
        }
    }
}

/// Key-derivation function over a 32-byte secret
#[derive(Clone)]
pub struct Kdf {
    secret: [u8; 32],
}

impl Kdf {
    /// Build from an existing secret
    pub fn new(secret: [u8; 32]) -> Self {
        Kdf { secret }
    }

    /// Generate a fresh random secret
    pub fn random() -> Self {
        let mut secret = [0u8; 32];
        OsRng.fill_bytes(&mut secret);
        Kdf { secret }
    }

    /// Derive the key for (purpose, height, index)
    pub fn derive(&self, key_type: KeyType, height: u64, idx: u32) -> Scalar {
        let mut h = Hasher::with_tag("kdf");
        h.update(&self.secret)
            .update(&[key_type.tag()])
            .update_u64(height)
            .update_u64(idx as u64);
        scalar_from_hash(&h.finish())
    }
}

impl std::fmt::Debug for Kdf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Kdf([REDACTED])")
    }
}
