//! Block subsidy schedule
//!
//! Pure halving schedule over height; both the validator (coinbase sum
//! check) and the block builder consume it.

use crate::constants::{HALVING_INTERVAL, INITIAL_SUBSIDY};

/// Subsidy minted by the block at `height`
///
/// Height 0 does not exist; genesis (height 1) mints the full initial
/// subsidy.
pub fn block_subsidy(height: u64) -> u64 {
    if height == 0 {
        return 0;
    }
    let halvings = (height - 1) / HALVING_INTERVAL;
    if halvings >= 64 {
        0
    } else {
        INITIAL_SUBSIDY >> halvings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_genesis_mints_full_subsidy() {
        assert_eq!(block_subsidy(1), INITIAL_SUBSIDY);
    }

    #[test]
    fn test_subsidy_halves_per_interval() {
        assert_eq!(block_subsidy(HALVING_INTERVAL), INITIAL_SUBSIDY);
        assert_eq!(block_subsidy(HALVING_INTERVAL + 1), INITIAL_SUBSIDY / 2);
        assert_eq!(block_subsidy(2 * HALVING_INTERVAL + 1), INITIAL_SUBSIDY / 4);
    }

    #[test]
    fn test_subsidy_eventually_zero() {
        assert_eq!(block_subsidy(65 * HALVING_INTERVAL + 1), 0);
        assert_eq!(block_subsidy(u64::MAX), 0);
    }

    #[test]
    fn test_height_zero_mints_nothing() {
        assert_eq!(block_subsidy(0), 0);
    }
}
