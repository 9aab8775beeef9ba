//! Transaction and block body structures
//!
//! A body is the triple (inputs, outputs, kernels); the same shape carries a
//! loose transaction and a full block. Lists are kept in canonical order:
//! inputs and outputs by (commitment, maturity), kernels by excess.

use serde::{Deserialize, Serialize};

use crate::crypto::{Commitment, Hash, Hasher, RangeProof, SchnorrSignature};

/// A transaction input: the explicit key of the UTXO being spent
///
/// The node never searches across maturities; spending a commitment that
/// exists at several maturities requires naming the one meant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Input {
    pub commitment: Commitment,
    pub maturity: u64,
}

/// A transaction output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Output {
    /// Pedersen commitment to (value, blinding factor)
    pub commitment: Commitment,
    /// Height from which this output is spendable
    pub maturity: u64,
    /// Minted output (coinbase or commission); carries a public value
    pub coinbase: bool,
    /// Ownership proof; public for minted outputs
    pub proof: RangeProof,
}

impl Output {
    /// Declared value of a minted output
    pub fn public_value(&self) -> Option<u64> {
        self.proof.public_value()
    }

    fn sort_key(&self) -> (Commitment, u64) {
        (self.commitment, self.maturity)
    }
}

/// A transaction kernel: the authorization record of a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxKernel {
    /// Excess commitment `e·G`
    pub excess: Commitment,
    /// Fee paid to the block miner
    pub fee: u64,
    /// First height at which this kernel is valid
    pub min_height: u64,
    /// Last height at which this kernel is valid
    pub max_height: u64,
    /// Schnorr signature by the excess key over the signing hash
    pub signature: SchnorrSignature,
}

impl TxKernel {
    /// Hash signed by the excess key: binds fee and validity window
    pub fn signing_hash(&self) -> Hash {
        Self::signing_hash_for(self.fee, self.min_height, self.max_height)
    }

    /// Signing hash for a kernel under construction
    pub fn signing_hash_for(fee: u64, min_height: u64, max_height: u64) -> Hash {
        let mut h = Hasher::with_tag("kernel");
        h.update_u64(fee).update_u64(min_height).update_u64(max_height);
        h.finish()
    }

    /// Kernel id stored in the kernel tree
    pub fn id(&self) -> Hash {
        let mut h = Hasher::with_tag("kernel.id");
        h.update(self.excess.as_bytes());
        h.finish()
    }
}

/// Inputs, outputs, and kernels of a transaction or block body
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxBody {
    pub inputs: Vec<Input>,
    pub outputs: Vec<Output>,
    pub kernels: Vec<TxKernel>,
}

impl TxBody {
    /// Empty body
    pub fn new() -> Self {
        Self::default()
    }

    /// Sort all lists into canonical order
    pub fn normalize(&mut self) {
        self.inputs.sort();
        self.outputs.sort_by_key(Output::sort_key);
        self.kernels.sort_by(|a, b| a.excess.cmp(&b.excess));
    }

    /// Append another body's elements (not re-sorted)
    pub fn merge(&mut self, other: TxBody) {
        self.inputs.extend(other.inputs);
        self.outputs.extend(other.outputs);
        self.kernels.extend(other.kernels);
    }

    /// Total fee across kernels; `None` on overflow
    pub fn fee_total(&self) -> Option<u64> {
        self.kernels.iter().try_fold(0u64, |acc, k| acc.checked_add(k.fee))
    }

    /// Sum of public values of minted outputs; `None` on overflow
    pub fn public_sum(&self) -> Option<u64> {
        self.outputs
            .iter()
            .filter_map(Output::public_value)
            .try_fold(0u64, |acc, v| acc.checked_add(v))
    }

    /// Earliest kernel expiry; `u64::MAX` when no kernel bounds it
    pub fn expiry(&self) -> u64 {
        self.kernels
            .iter()
            .map(|k| k.max_height)
            .min()
            .unwrap_or(u64::MAX)
    }

    /// Kernel ids in list order
    pub fn kernel_ids(&self) -> Vec<Hash> {
        self.kernels.iter().map(TxKernel::id).collect()
    }

    /// The body minus its minted parts
    ///
    /// What remains is the aggregate of the user transactions in a block: it
    /// satisfies the balance identity on its own and can be re-admitted to
    /// the mempool after a rollback.
    pub fn strip_minted(&self) -> TxBody {
        TxBody {
            inputs: self.inputs.clone(),
            outputs: self
                .outputs
                .iter()
                .filter(|o| !o.coinbase)
                .cloned()
                .collect(),
            kernels: self
                .kernels
                .iter()
                .filter(|k| k.fee > 0)
                .cloned()
                .collect(),
        }
    }

    /// Serialized size in bytes
    pub fn serialized_size(&self) -> usize {
        bincode::serialized_size(self).map(|n| n as usize).unwrap_or(usize::MAX)
    }

    /// Encode for storage or the wire
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Decode from raw bytes
    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}
