//! Block and transaction validation
//!
//! Context-free checks apply to loose transactions and to block bodies
//! before they touch any chain state; contextual checks run against a
//! chosen parent state during apply. A context-free failure marks the
//! supplying peer insane; a contextual failure only drops the block.

use k256::{ProjectivePoint, Scalar};
use thiserror::Error;

use crate::consensus::{block_subsidy, Output, TxBody, TxKernel};
use crate::constants::COINBASE_INCUBATION;
use crate::crypto::value_generator;

/// Context-free validation errors (malformed input; the peer is insane)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BodyError {
    #[error("Body carries no kernels")]
    NoKernels,
    #[error("Invalid curve point encoding")]
    InvalidPoint,
    #[error("Output proof verification failed")]
    InvalidProof,
    #[error("Coinbase flag disagrees with proof visibility")]
    CoinbaseVisibility,
    #[error("Kernel signature verification failed")]
    InvalidKernelSignature,
    #[error("Kernel height window is inverted")]
    InvertedKernelWindow,
    #[error("List not canonically sorted")]
    Unsorted,
    #[error("Duplicate kernel")]
    DuplicateKernel,
    #[error("Fee or value sum overflow")]
    Overflow,
    #[error("Balance identity does not hold")]
    Unbalanced,
    #[error("Coinbase output in loose transaction")]
    CoinbaseInTransaction,
    #[error("Transaction pays no fee")]
    NoFee,
}

/// Contextual validation errors (drop the block, keep the peer)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextualError {
    #[error("Input not found in UTXO set at its stated maturity")]
    MissingInput,
    #[error("Input spent before its maturity height")]
    ImmatureSpend,
    #[error("Output maturity does not match its apply height")]
    WrongMaturity,
    #[error("Kernel outside its validity window")]
    KernelWindow,
    #[error("Kernel already present in the chain")]
    DuplicateChainKernel,
    #[error("Coinbase sum does not equal subsidy plus fees")]
    WrongCoinbaseSum,
    #[error("Computed tree roots do not match the header")]
    RootMismatch,
    #[error("Unexpected block difficulty")]
    WrongDifficulty,
}

/// Context-free validation of a block body
pub fn validate_body(body: &TxBody) -> Result<(), BodyError> {
    if body.kernels.is_empty() {
        return Err(BodyError::NoKernels);
    }
    check_sorted(body)?;

    for output in &body.outputs {
        check_output(output)?;
    }
    for kernel in &body.kernels {
        check_kernel(kernel)?;
    }

    check_balance(body)
}

/// Context-free validation of a loose transaction
///
/// Same as a block body, except minted outputs are forbidden and the
/// transaction must pay a positive fee.
pub fn validate_transaction(tx: &TxBody) -> Result<(), BodyError> {
    if tx.outputs.iter().any(|o| o.coinbase) {
        return Err(BodyError::CoinbaseInTransaction);
    }
    validate_body(tx)?;
    let fee = tx.fee_total().ok_or(BodyError::Overflow)?;
    if fee == 0 {
        return Err(BodyError::NoFee);
    }
    Ok(())
}

/// The maturity a freshly created output must declare at `height`
pub fn expected_maturity(output: &Output, height: u64) -> u64 {
    if output.coinbase {
        height.saturating_add(COINBASE_INCUBATION)
    } else {
        height
    }
}

/// Contextual check: output maturity matches its apply height
pub fn check_output_maturity(output: &Output, height: u64) -> Result<(), ContextualError> {
    if output.maturity != expected_maturity(output, height) {
        return Err(ContextualError::WrongMaturity);
    }
    Ok(())
}

/// Contextual check: kernel validity window contains `height`
pub fn check_kernel_window(kernel: &TxKernel, height: u64) -> Result<(), ContextualError> {
    if height < kernel.min_height || height > kernel.max_height {
        return Err(ContextualError::KernelWindow);
    }
    Ok(())
}

/// Contextual check: minted value equals subsidy plus collected fees
pub fn check_coinbase_sum(body: &TxBody, height: u64) -> Result<(), ContextualError> {
    let minted = body.public_sum().ok_or(ContextualError::WrongCoinbaseSum)?;
    let fees = body.fee_total().ok_or(ContextualError::WrongCoinbaseSum)?;
    let expected = block_subsidy(height)
        .checked_add(fees)
        .ok_or(ContextualError::WrongCoinbaseSum)?;
    if minted != expected {
        return Err(ContextualError::WrongCoinbaseSum);
    }
    Ok(())
}

fn check_sorted(body: &TxBody) -> Result<(), BodyError> {
    // Inputs and outputs are multisets: equal neighbors are legal and spend
    // or create multiplicity on one UTXO key. Kernels must be unique.
    if !body.inputs.windows(2).all(|w| w[0] <= w[1]) {
        return Err(BodyError::Unsorted);
    }
    let out_key = |o: &Output| (o.commitment, o.maturity);
    if !body
        .outputs
        .windows(2)
        .all(|w| out_key(&w[0]) <= out_key(&w[1]))
    {
        return Err(BodyError::Unsorted);
    }
    for pair in body.kernels.windows(2) {
        match pair[0].excess.cmp(&pair[1].excess) {
            std::cmp::Ordering::Less => {}
            std::cmp::Ordering::Equal => return Err(BodyError::DuplicateKernel),
            std::cmp::Ordering::Greater => return Err(BodyError::Unsorted),
        }
    }
    Ok(())
}

fn check_output(output: &Output) -> Result<(), BodyError> {
    if output.coinbase != output.public_value().is_some() {
        return Err(BodyError::CoinbaseVisibility);
    }
    if output.commitment.to_point().is_none() {
        return Err(BodyError::InvalidPoint);
    }
    if !output.proof.verify(&output.commitment) {
        return Err(BodyError::InvalidProof);
    }
    Ok(())
}

fn check_kernel(kernel: &TxKernel) -> Result<(), BodyError> {
    if kernel.min_height > kernel.max_height {
        return Err(BodyError::InvertedKernelWindow);
    }
    if kernel.excess.to_point().is_none() {
        return Err(BodyError::InvalidPoint);
    }
    if !kernel.signature.verify(&kernel.excess, &kernel.signing_hash()) {
        return Err(BodyError::InvalidKernelSignature);
    }
    Ok(())
}

/// The excess-sum identity:
/// `Σ outputs − Σ inputs + Σ excess + fees·V == minted·V`
fn check_balance(body: &TxBody) -> Result<(), BodyError> {
    let fees = body.fee_total().ok_or(BodyError::Overflow)?;
    let minted = body.public_sum().ok_or(BodyError::Overflow)?;

    let mut sum = ProjectivePoint::IDENTITY;
    for output in &body.outputs {
        sum += output.commitment.to_point().ok_or(BodyError::InvalidPoint)?;
    }
    for input in &body.inputs {
        sum -= input.commitment.to_point().ok_or(BodyError::InvalidPoint)?;
    }
    for kernel in &body.kernels {
        sum += kernel.excess.to_point().ok_or(BodyError::InvalidPoint)?;
    }
    sum += value_generator() * Scalar::from(fees);
    sum -= value_generator() * Scalar::from(minted);

    if sum != ProjectivePoint::IDENTITY {
        return Err(BodyError::Unbalanced);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::Input;
    use crate::crypto::{
        hash_bytes, scalar_from_hash, Commitment, RangeProof, SchnorrSignature,
    };

    fn blind(tag: &[u8]) -> Scalar {
        scalar_from_hash(&hash_bytes(tag))
    }

    fn confidential_output(value: u64, tag: &[u8], maturity: u64) -> (Output, Scalar) {
        let b = blind(tag);
        let commitment = Commitment::commit(value, &b).unwrap();
        (
            Output {
                commitment,
                maturity,
                coinbase: false,
                proof: RangeProof::confidential(value, &b, &commitment).unwrap(),
            },
            b,
        )
    }

    fn kernel_for(excess_key: &Scalar, fee: u64) -> TxKernel {
        kernel_with_window(excess_key, fee, 0, u64::MAX)
    }

    fn kernel_with_window(
        excess_key: &Scalar,
        fee: u64,
        min_height: u64,
        max_height: u64,
    ) -> TxKernel {
        let excess =
            Commitment::from_point(&(ProjectivePoint::GENERATOR * excess_key)).unwrap();
        let signature = SchnorrSignature::sign(
            excess_key,
            &TxKernel::signing_hash_for(fee, min_height, max_height),
        )
        .unwrap();
        TxKernel {
            excess,
            fee,
            min_height,
            max_height,
            signature,
        }
    }

    /// Balanced single-kernel transaction: a 100-unit input into a 90-unit
    /// output plus a 10-unit fee
    fn balanced_tx() -> TxBody {
        let fee = 10u64;
        let (input_output, b_in) = confidential_output(100, b"in", 1);
        let (out, b_out) = confidential_output(90, b"out", 5);

        // excess = b_in − b_out (fees ride the value generator)
        let e = b_in - b_out;
        let mut tx = TxBody {
            inputs: vec![Input {
                commitment: input_output.commitment,
                maturity: 1,
            }],
            outputs: vec![out],
            kernels: vec![kernel_for(&e, fee)],
        };
        tx.normalize();
        tx
    }

    #[test]
    fn test_balanced_transaction_passes() {
        assert_eq!(validate_transaction(&balanced_tx()), Ok(()));
    }

    #[test]
    fn test_unbalanced_transaction_fails() {
        let mut tx = balanced_tx();
        tx.kernels[0].fee += 1;
        tx.kernels[0].signature = {
            let e = blind(b"in") - blind(b"out");
            SchnorrSignature::sign(&e, &tx.kernels[0].signing_hash()).unwrap()
        };
        assert_eq!(validate_transaction(&tx), Err(BodyError::Unbalanced));
    }

    #[test]
    fn test_bad_kernel_signature_fails() {
        let mut tx = balanced_tx();
        tx.kernels[0].min_height = 3; // signing hash no longer matches
        assert_eq!(
            validate_body(&tx),
            Err(BodyError::InvalidKernelSignature)
        );
    }

    #[test]
    fn test_unsorted_outputs_fail() {
        let (o1, _) = confidential_output(1, b"a", 1);
        let (o2, _) = confidential_output(2, b"b", 1);
        let mut tx = balanced_tx();
        tx.outputs = vec![o1, o2];
        tx.outputs.sort_by_key(|o| (o.commitment, o.maturity));
        tx.outputs.reverse();
        if tx.outputs[0].commitment > tx.outputs[1].commitment {
            assert_eq!(check_sorted(&tx), Err(BodyError::Unsorted));
        }
    }

    #[test]
    fn test_duplicate_kernel_rejected() {
        let mut tx = balanced_tx();
        let dup = tx.kernels[0].clone();
        tx.kernels.push(dup);
        assert_eq!(validate_body(&tx), Err(BodyError::DuplicateKernel));
    }

    #[test]
    fn test_coinbase_forbidden_in_transaction() {
        let mut tx = balanced_tx();
        tx.outputs[0].coinbase = true;
        assert_eq!(
            validate_transaction(&tx),
            Err(BodyError::CoinbaseInTransaction)
        );
    }

    #[test]
    fn test_output_maturity_rules() {
        let (mut out, _) = confidential_output(5, b"m", 7);
        assert!(check_output_maturity(&out, 7).is_ok());
        assert!(check_output_maturity(&out, 8).is_err());

        out.coinbase = true;
        out.maturity = 7 + COINBASE_INCUBATION;
        assert!(check_output_maturity(&out, 7).is_ok());
    }

    #[test]
    fn test_kernel_window_check() {
        let kernel = kernel_with_window(&blind(b"k"), 1, 5, 10);
        assert!(check_kernel_window(&kernel, 5).is_ok());
        assert!(check_kernel_window(&kernel, 10).is_ok());
        assert!(check_kernel_window(&kernel, 4).is_err());
        assert!(check_kernel_window(&kernel, 11).is_err());
    }
}
