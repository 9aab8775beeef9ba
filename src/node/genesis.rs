//! Genesis block generation
//!
//! Builds the immutable height-1 block: a publicly-valued coinbase output
//! and its balancing kernel, with the tree roots and PoW nonce computed at
//! construction time. Reproducible bit-for-bit on every call.

use crate::consensus::{work, Header, StateId, TxBody};
use crate::constants::{GENESIS_TIMESTAMP, INITIAL_DIFFICULTY};
use crate::crypto::{hash_bytes, Hash, Kdf, ProofError};
use crate::mining::{minted_parts, solve_nonce};
use crate::storage::{utxo_key, KernelTree, UtxoTree};

/// The fixed KDF the genesis coinbase is derived from
///
/// Publicly known: the genesis output is spendable by anyone who cares to,
/// which keeps the chain bootstrap free of a privileged key holder.
pub fn genesis_kdf() -> Kdf {
    Kdf::new(hash_bytes(b"OBOL.genesis.kdf").0)
}

/// Create the genesis block
///
/// This function produces a reproducible, byte-for-byte identical genesis
/// block: fixed timestamp, fixed derivation secret, and a deterministic
/// nonce search.
pub fn create_genesis() -> Result<(Header, TxBody), ProofError> {
    let (outputs, kernel) = minted_parts(&genesis_kdf(), 1, 0)?;

    let mut body = TxBody {
        inputs: vec![],
        outputs,
        kernels: vec![kernel],
    };
    body.normalize();

    let mut utxo = UtxoTree::new();
    for output in &body.outputs {
        utxo.add(utxo_key(&output.commitment, output.maturity));
    }
    let mut kernels = KernelTree::new();
    for kernel in &body.kernels {
        kernels
            .add(kernel.id())
            .expect("fresh kernel tree has no duplicates");
    }

    let mut header = Header {
        height: 1,
        prev_hash: Hash::zero(),
        timestamp: GENESIS_TIMESTAMP,
        difficulty: INITIAL_DIFFICULTY,
        chain_work: work(INITIAL_DIFFICULTY),
        utxo_root: utxo.root(),
        kernel_root: kernels.root(),
        nonce: 0,
    };
    solve_nonce(&mut header);
    Ok((header, body))
}

/// The genesis state id
pub fn genesis_id() -> Result<StateId, ProofError> {
    Ok(create_genesis()?.0.id())
}
