//! OBOL confidential-transaction node core
//!
//! A Mimblewimble-style full-node core: headers commit to the roots of two
//! authenticated structures (the UTXO tree and the kernel tree), and the
//! chain processor keeps both strictly consistent with the canonical tip
//! across reorganizations, pruning, and block building.

pub mod consensus;
pub mod crypto;
pub mod mining;
pub mod node;
pub mod storage;

/// Protocol constants - HARD-CODED, NEVER CONFIGURABLE
pub mod constants {
    /// Chain name, used in domain-separation tags
    pub const CHAIN_NAME: &str = "OBOL";

    /// Number of base units per coin (8 decimal places)
    pub const COIN: u64 = 100_000_000;

    /// Target block time in seconds
    pub const BLOCK_TIME_TARGET: u64 = 60;

    /// Difficulty retarget interval (blocks)
    pub const RETARGET_INTERVAL: u64 = 1440;

    /// Initial compact difficulty target (easy: roughly one solve per two attempts)
    pub const INITIAL_DIFFICULTY: u32 = 0x207fffff;

    /// Maturity delay for minted (coinbase and fee) outputs, in blocks
    pub const COINBASE_INCUBATION: u64 = 60;

    /// Initial block subsidy (in base units)
    pub const INITIAL_SUBSIDY: u64 = 80 * COIN;

    /// Subsidy halving interval (blocks)
    pub const HALVING_INTERVAL: u64 = 840_000;

    /// Maximum serialized block body size in bytes
    pub const MAX_BLOCK_SIZE: usize = 1 << 20;

    /// Maximum serialized transaction size accepted by the mempool
    pub const MAX_TX_SIZE: usize = 1 << 17;

    /// Genesis timestamp (Unix timestamp)
    pub const GENESIS_TIMESTAMP: u64 = 1767225600; // 2026-01-01
}
