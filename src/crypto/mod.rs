//! Cryptography module - BLAKE3 hashing, Pedersen commitments, proofs, KDF

mod commitment;
mod hash;
mod kdf;
mod proofs;

pub use commitment::*;
pub use hash::*;
pub use kdf::*;
pub use proofs::*;
