//! Transaction pool
//!
//! Fee-ordered, height-bounded pool of candidate transactions. Two indices:
//! profit order (fee-per-byte descending, stable by insertion sequence) and
//! expiry order (ascending). The pool is owned by the chain processor and
//! is volatile: it starts empty on every restart.

use std::collections::{BTreeMap, HashMap};
use std::cmp::Ordering;
use thiserror::Error;

use crate::consensus::{validate_transaction, BodyError, TxBody};
use crate::constants::MAX_TX_SIZE;
use crate::crypto::Hash;

/// Pool admission errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("Transaction failed validation: {0}")]
    Invalid(#[from] BodyError),
    #[error("Transaction exceeds the maximum size")]
    Oversized,
    #[error("Transaction expires below the current height")]
    Expired,
    #[error("A kernel of this transaction is already pooled")]
    Duplicate,
}

/// A pooled transaction with its cached economics
#[derive(Debug, Clone)]
pub struct PoolEntry {
    pub tx: TxBody,
    pub fee: u64,
    pub size: usize,
    pub expiry: u64,
    seq: u64,
}

/// Profit-index key: fee-per-byte descending, ties by insertion order
///
/// Compared by cross-multiplication (`fee·size' vs fee'·size`) so the
/// effective key is the exact rational fee/size without division.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ProfitKey {
    fee: u64,
    size: u64,
    seq: u64,
}

impl Ord for ProfitKey {
    fn cmp(&self, other: &Self) -> Ordering {
        let lhs = self.fee as u128 * other.size as u128;
        let rhs = other.fee as u128 * self.size as u128;
        rhs.cmp(&lhs).then(self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for ProfitKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Fee-ordered transaction pool
#[derive(Debug, Default)]
pub struct TxPool {
    entries: HashMap<u64, PoolEntry>,
    profit: BTreeMap<ProfitKey, u64>,
    expiry: BTreeMap<(u64, u64), u64>,
    kernels: HashMap<Hash, u64>,
    next_seq: u64,
}

impl TxPool {
    /// Create an empty pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a transaction
    ///
    /// Runs context-free validation; rejects oversized transactions, ones
    /// whose every kernel window already closed, and duplicates by kernel.
    pub fn add(&mut self, tx: TxBody, current_height: u64) -> Result<(), PoolError> {
        let size = tx.serialized_size();
        if size > MAX_TX_SIZE {
            return Err(PoolError::Oversized);
        }
        validate_transaction(&tx)?;

        let expiry = tx.expiry();
        if expiry < current_height {
            return Err(PoolError::Expired);
        }
        let kernel_ids = tx.kernel_ids();
        if kernel_ids.iter().any(|id| self.kernels.contains_key(id)) {
            return Err(PoolError::Duplicate);
        }
        // validate_transaction guarantees the sum exists and is positive
        let fee = tx.fee_total().ok_or(BodyError::Overflow)?;

        let seq = self.next_seq;
        self.next_seq += 1;

        for id in kernel_ids {
            self.kernels.insert(id, seq);
        }
        self.profit.insert(
            ProfitKey {
                fee,
                size: size as u64,
                seq,
            },
            seq,
        );
        self.expiry.insert((expiry, seq), seq);
        self.entries.insert(
            seq,
            PoolEntry {
                tx,
                fee,
                size,
                expiry,
                seq,
            },
        );
        Ok(())
    }

    /// Remove one entry
    pub fn delete(&mut self, entry: &PoolEntry) {
        self.remove_seq(entry.seq);
    }

    /// Remove every entry sharing a kernel with an applied block
    pub fn delete_by_kernels(&mut self, kernel_ids: &[Hash]) {
        let mut doomed: Vec<u64> = kernel_ids
            .iter()
            .filter_map(|id| self.kernels.get(id).copied())
            .collect();
        doomed.sort_unstable();
        doomed.dedup();
        for seq in doomed {
            self.remove_seq(seq);
        }
    }

    /// Pop expired entries: everything with expiry strictly below `height`
    pub fn delete_out_of_bound(&mut self, height: u64) {
        loop {
            let Some((&(expiry, seq), _)) = self.expiry.iter().next() else {
                break;
            };
            if expiry >= height {
                break;
            }
            self.remove_seq(seq);
        }
    }

    /// Drop everything
    pub fn clear(&mut self) {
        self.entries.clear();
        self.profit.clear();
        self.expiry.clear();
        self.kernels.clear();
    }

    /// Entries in profit order (fee-per-byte descending, stable)
    pub fn by_profit(&self) -> impl Iterator<Item = &PoolEntry> {
        self.profit
            .values()
            .filter_map(move |seq| self.entries.get(seq))
    }

    /// Whether a kernel is already pooled
    pub fn contains_kernel(&self, id: &Hash) -> bool {
        self.kernels.contains_key(id)
    }

    /// Number of pooled transactions
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the pool is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn remove_seq(&mut self, seq: u64) {
        let Some(entry) = self.entries.remove(&seq) else {
            return;
        };
        self.profit.remove(&ProfitKey {
            fee: entry.fee,
            size: entry.size as u64,
            seq,
        });
        self.expiry.remove(&(entry.expiry, seq));
        for id in entry.tx.kernel_ids() {
            if self.kernels.get(&id) == Some(&seq) {
                self.kernels.remove(&id);
            }
        }
    }
}
