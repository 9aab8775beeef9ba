//! Candidate block assembly
//!
//! Drains the mempool in profit order onto overlay copies of the commitment
//! trees, mints the coinbase and commission outputs with KDF-derived keys,
//! and fills a header ready for the PoW search. The live trees and the pool
//! are never mutated: transactions leave the pool only when the finished
//! block is applied to the canonical chain.

use k256::ProjectivePoint;
use thiserror::Error;
use tracing::{debug, info};

use crate::consensus::{block_subsidy, work, Header, Output, TxBody, TxKernel};
use crate::constants::{COINBASE_INCUBATION, MAX_BLOCK_SIZE};
use crate::crypto::{
    Commitment, Hash, Kdf, KeyType, ProofError, RangeProof, SchnorrSignature,
};
use crate::node::{apply_elements, ChainProcessor, NodeEvents};
use crate::storage::{utxo_key, StoreError};

/// Room reserved for the minted outputs and kernel when packing a block
const MINTED_RESERVE: usize = 1024;

/// Block assembly errors
#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Proof(#[from] ProofError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Encoding error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("Derived kernel collides with the chain")]
    KernelCollision,
}

/// A freshly assembled block, PoW not yet solved
#[derive(Debug)]
pub struct NewBlock {
    /// Header with roots and work filled in; nonce still zero
    pub header: Header,
    /// Encoded body ready for `on_block`
    pub body: Vec<u8>,
    /// Fees collected from the included transactions
    pub fees: u64,
}

/// Minted outputs for one block: coinbase, plus commission when fees exist,
/// plus the kernel balancing their blinding factors
pub(crate) fn minted_parts(
    kdf: &Kdf,
    height: u64,
    fees: u64,
) -> Result<(Vec<Output>, TxKernel), ProofError> {
    let subsidy = block_subsidy(height);
    let maturity = height + COINBASE_INCUBATION;
    let mut outputs = Vec::with_capacity(2);

    let coinbase_blind = kdf.derive(KeyType::Coinbase, height, 0);
    let coinbase_commit =
        Commitment::commit(subsidy, &coinbase_blind).ok_or(ProofError::InvalidPoint)?;
    outputs.push(Output {
        commitment: coinbase_commit,
        maturity,
        coinbase: true,
        proof: RangeProof::public(subsidy, &coinbase_blind, &coinbase_commit)?,
    });

    let mut blind_sum = coinbase_blind;
    if fees > 0 {
        let commission_blind = kdf.derive(KeyType::Commission, height, 0);
        let commission_commit =
            Commitment::commit(fees, &commission_blind).ok_or(ProofError::InvalidPoint)?;
        outputs.push(Output {
            commitment: commission_commit,
            maturity,
            coinbase: true,
            proof: RangeProof::public(fees, &commission_blind, &commission_commit)?,
        });
        blind_sum += commission_blind;
    }

    // The kernel excess cancels the minted blinding factors so the block
    // satisfies the balance identity.
    let excess_key = -blind_sum;
    let excess = Commitment::from_point(&(ProjectivePoint::GENERATOR * excess_key))
        .ok_or(ProofError::InvalidPoint)?;
    let signature = SchnorrSignature::sign(
        &excess_key,
        &TxKernel::signing_hash_for(0, height, u64::MAX),
    )?;
    let kernel = TxKernel {
        excess,
        fee: 0,
        min_height: height,
        max_height: u64::MAX,
        signature,
    };
    Ok((outputs, kernel))
}

impl<E: NodeEvents> ChainProcessor<E> {
    /// Assemble a candidate block atop the current tip
    ///
    /// One pass over the mempool in fee-per-byte order; candidates that
    /// fail contextual validation at the new height or would overflow the
    /// size limit are skipped, not removed. The caller solves the PoW and
    /// feeds the block back through `on_state`/`on_block`.
    pub fn generate_block(&mut self, kdf: &Kdf) -> Result<NewBlock, BuildError> {
        let tip = self.store.tip()?;
        let (height, prev_hash, prev_work, parent_header) = match tip {
            Some(tip_id) => {
                let record = self
                    .store
                    .get_state(&tip_id)?
                    .ok_or_else(|| StoreError::Corrupted("tip record missing".into()))?;
                (
                    tip_id.height + 1,
                    tip_id.hash,
                    record.header.chain_work,
                    Some(record.header),
                )
            }
            None => (1, Hash::zero(), 0u128, None),
        };
        let difficulty = self.next_difficulty(parent_header.as_ref());

        // Simulate on overlays; the live trees stay untouched.
        let mut utxo = self.utxo.clone();
        let mut kernels = self.kernels.clone();
        let mut body = TxBody::new();
        let mut fees: u64 = 0;
        let mut skipped = 0usize;

        for entry in self.pool.by_profit() {
            let Some(new_fees) = fees.checked_add(entry.fee) else {
                skipped += 1;
                continue;
            };
            if body.serialized_size() + entry.size + MINTED_RESERVE > MAX_BLOCK_SIZE {
                skipped += 1;
                continue;
            }
            if let Err(e) = apply_elements(&mut utxo, &mut kernels, &entry.tx, height) {
                debug!(error = %e, "mempool candidate skipped");
                skipped += 1;
                continue;
            }
            body.merge(entry.tx.clone());
            fees = new_fees;
        }

        let (minted_outputs, minted_kernel) = minted_parts(kdf, height, fees)?;
        for output in &minted_outputs {
            utxo.add(utxo_key(&output.commitment, output.maturity));
        }
        kernels
            .add(minted_kernel.id())
            .map_err(|_| BuildError::KernelCollision)?;
        body.outputs.extend(minted_outputs);
        body.kernels.push(minted_kernel);
        body.normalize();

        let header = Header {
            height,
            prev_hash,
            timestamp: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            difficulty,
            chain_work: prev_work.saturating_add(work(difficulty)),
            utxo_root: utxo.root(),
            kernel_root: kernels.root(),
            nonce: 0,
        };

        info!(
            height,
            fees,
            kernels = body.kernels.len(),
            skipped,
            "assembled candidate block"
        );
        Ok(NewBlock {
            header,
            body: body.encode()?,
            fees,
        })
    }
}
