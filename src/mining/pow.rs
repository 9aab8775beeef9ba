//! PoW search
//!
//! Increments the header nonce until the header hash meets its declared
//! target. The search is deterministic from the starting header, which also
//! makes the genesis nonce reproducible.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::consensus::{pow_ok, Header};

/// Outcome of a PoW search
#[derive(Debug)]
pub enum PowResult {
    /// Header with a valid nonce filled in
    Solved(Header),
    /// The stop signal fired first
    Interrupted,
}

/// Interruptible PoW solver
#[derive(Clone, Default)]
pub struct PowSolver {
    stop_signal: Arc<AtomicBool>,
}

impl PowSolver {
    /// Create a solver
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a stop signal handle
    pub fn stop_signal(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop_signal)
    }

    /// Stop an in-flight search
    pub fn stop(&self) {
        self.stop_signal.store(true, Ordering::SeqCst);
    }

    /// Clear the stop signal
    pub fn reset(&self) {
        self.stop_signal.store(false, Ordering::SeqCst);
    }

    /// Search for a valid nonce
    pub fn solve(&self, mut header: Header) -> PowResult {
        loop {
            if self.stop_signal.load(Ordering::SeqCst) {
                return PowResult::Interrupted;
            }
            if pow_ok(&header.hash(), header.difficulty) {
                return PowResult::Solved(header);
            }
            header.nonce = header.nonce.wrapping_add(1);
        }
    }
}

/// Uninterruptible nonce search starting from zero
///
/// Deterministic: the same header content always solves to the same nonce.
pub fn solve_nonce(header: &mut Header) {
    header.nonce = 0;
    while !pow_ok(&header.hash(), header.difficulty) {
        header.nonce = header.nonce.wrapping_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::INITIAL_DIFFICULTY;
    use crate::crypto::Hash;

    fn header() -> Header {
        Header {
            height: 1,
            prev_hash: Hash::zero(),
            timestamp: 1234567890,
            difficulty: INITIAL_DIFFICULTY,
            chain_work: 2,
            utxo_root: Hash::zero(),
            kernel_root: Hash::zero(),
            nonce: 0,
        }
    }

    #[test]
    fn test_solve_finds_valid_nonce() {
        let mut h = header();
        solve_nonce(&mut h);
        assert!(pow_ok(&h.hash(), h.difficulty));
    }

    #[test]
    fn test_solve_is_deterministic() {
        let mut a = header();
        let mut b = header();
        solve_nonce(&mut a);
        solve_nonce(&mut b);
        assert_eq!(a.nonce, b.nonce);
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn test_solver_interrupts() {
        let solver = PowSolver::new();
        solver.stop();
        // An impossible target would never solve; the stop signal wins
        let mut h = header();
        h.difficulty = 0x01000001;
        assert!(matches!(solver.solve(h), PowResult::Interrupted));
    }

    #[test]
    fn test_solver_solves_easy_target() {
        let solver = PowSolver::new();
        match solver.solve(header()) {
            PowResult::Solved(h) => assert!(pow_ok(&h.hash(), h.difficulty)),
            PowResult::Interrupted => panic!("not interrupted"),
        }
    }

    #[test]
    fn test_stop_signal_handle() {
        let solver = PowSolver::new();
        let signal = solver.stop_signal();

        assert!(!signal.load(Ordering::SeqCst));
        solver.stop();
        assert!(signal.load(Ordering::SeqCst));
        solver.reset();
        assert!(!signal.load(Ordering::SeqCst));
    }
}
