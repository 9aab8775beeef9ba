//! Ownership proofs and kernel signatures
//!
//! Two sigma protocols over the commitment generators:
//! - `SchnorrSignature`: proof of knowledge of the discrete log of a point
//!   with respect to `G`; signs kernel excesses and public coinbase outputs.
//! - `RepresentationProof`: proof of knowledge of an opening `(v, b)` of a
//!   Pedersen commitment; attached to confidential outputs.
//!
//! Nonces are derived deterministically from the secret and the message, so
//! proving never consumes randomness.

use k256::{ProjectivePoint, Scalar};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{
    scalar_from_bytes, scalar_from_hash, scalar_to_bytes, value_generator, Commitment, Hash,
    Hasher,
};

/// Proof construction errors
#[derive(Debug, Error)]
pub enum ProofError {
    #[error("Point at infinity in proof material")]
    InvalidPoint,
    #[error("Degenerate derived nonce")]
    DegenerateNonce,
}

fn derive_nonce(tag: &str, secret: &Scalar, message: &Hash) -> Result<Scalar, ProofError> {
    let mut h = Hasher::with_tag(tag);
    h.update(&scalar_to_bytes(secret)).update(&message.0);
    let nonce = scalar_from_hash(&h.finish());
    if nonce == Scalar::ZERO {
        return Err(ProofError::DegenerateNonce);
    }
    Ok(nonce)
}

fn challenge(tag: &str, nonce: &Commitment, public: &Commitment, message: &Hash) -> Scalar {
    let mut h = Hasher::with_tag(tag);
    h.update(nonce.as_bytes())
        .update(public.as_bytes())
        .update(&message.0);
    scalar_from_hash(&h.finish())
}

/// Schnorr signature: proof of knowledge of `x` with `P = x·G`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchnorrSignature {
    /// Nonce point `R = r·G`
    pub nonce: Commitment,
    /// Response `s = r + c·x`
    pub s: [u8; 32],
}

impl SchnorrSignature {
    /// Sign a message under a secret key
    pub fn sign(secret: &Scalar, message: &Hash) -> Result<Self, ProofError> {
        let public = Commitment::from_point(&(ProjectivePoint::GENERATOR * secret))
            .ok_or(ProofError::InvalidPoint)?;
        let r = derive_nonce("schnorr.nonce", secret, message)?;
        let nonce = Commitment::from_point(&(ProjectivePoint::GENERATOR * r))
            .ok_or(ProofError::InvalidPoint)?;
        let c = challenge("schnorr.challenge", &nonce, &public, message);
        let s = r + c * secret;
        Ok(SchnorrSignature {
            nonce,
            s: scalar_to_bytes(&s),
        })
    }

    /// Verify against the public point and message
    pub fn verify(&self, public: &Commitment, message: &Hash) -> bool {
        let (Some(nonce_pt), Some(public_pt)) = (self.nonce.to_point(), public.to_point()) else {
            return false;
        };
        let Some(s) = scalar_from_bytes(&self.s) else {
            return false;
        };
        let c = challenge("schnorr.challenge", &self.nonce, public, message);
        ProjectivePoint::GENERATOR * s == nonce_pt + public_pt * c
    }
}

/// Proof of knowledge of an opening `(v, b)` with `C = b·G + v·V`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepresentationProof {
    /// Nonce point `A = r_b·G + r_v·V`
    pub nonce: Commitment,
    /// Response for the blinding factor
    pub s_blind: [u8; 32],
    /// Response for the value
    pub s_value: [u8; 32],
}

impl RepresentationProof {
    /// Prove knowledge of the opening of `commitment`
    pub fn prove(value: u64, blind: &Scalar, commitment: &Commitment) -> Result<Self, ProofError> {
        let message = hash_commitment(commitment);
        let value_scalar = Scalar::from(value);
        let r_blind = derive_nonce("rep.nonce.blind", blind, &message)?;
        let r_value = derive_nonce("rep.nonce.value", &(blind + value_scalar), &message)?;

        let nonce_pt = ProjectivePoint::GENERATOR * r_blind + value_generator() * r_value;
        let nonce = Commitment::from_point(&nonce_pt).ok_or(ProofError::InvalidPoint)?;

        let c = challenge("rep.challenge", &nonce, commitment, &message);
        Ok(RepresentationProof {
            nonce,
            s_blind: scalar_to_bytes(&(r_blind + c * blind)),
            s_value: scalar_to_bytes(&(r_value + c * value_scalar)),
        })
    }

    /// Verify against the commitment
    pub fn verify(&self, commitment: &Commitment) -> bool {
        let (Some(nonce_pt), Some(commit_pt)) = (self.nonce.to_point(), commitment.to_point())
        else {
            return false;
        };
        let (Some(s_blind), Some(s_value)) = (
            scalar_from_bytes(&self.s_blind),
            scalar_from_bytes(&self.s_value),
        ) else {
            return false;
        };
        let message = hash_commitment(commitment);
        let c = challenge("rep.challenge", &self.nonce, commitment, &message);
        ProjectivePoint::GENERATOR * s_blind + value_generator() * s_value
            == nonce_pt + commit_pt * c
    }
}

fn hash_commitment(commitment: &Commitment) -> Hash {
    let mut h = Hasher::with_tag("rep.message");
    h.update(commitment.as_bytes());
    h.finish()
}

/// Output ownership proof
///
/// Confidential outputs hide their value behind a representation proof;
/// coinbase-flagged outputs carry the minted value in the clear together
/// with a proof that the commitment opens to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RangeProof {
    /// Opening-knowledge proof; value stays hidden
    Confidential(RepresentationProof),
    /// Publicly-valued output (coinbase and commission)
    Public {
        value: u64,
        proof: SchnorrSignature,
    },
}

impl RangeProof {
    /// Build a confidential proof
    pub fn confidential(
        value: u64,
        blind: &Scalar,
        commitment: &Commitment,
    ) -> Result<Self, ProofError> {
        Ok(RangeProof::Confidential(RepresentationProof::prove(
            value, blind, commitment,
        )?))
    }

    /// Build a public proof: knowledge of `b` with `C − v·V = b·G`
    pub fn public(value: u64, blind: &Scalar, commitment: &Commitment) -> Result<Self, ProofError> {
        let message = public_message(value, commitment);
        Ok(RangeProof::Public {
            value,
            proof: SchnorrSignature::sign(blind, &message)?,
        })
    }

    /// Verify against the output commitment
    pub fn verify(&self, commitment: &Commitment) -> bool {
        match self {
            RangeProof::Confidential(proof) => proof.verify(commitment),
            RangeProof::Public { value, proof } => {
                let Some(commit_pt) = commitment.to_point() else {
                    return false;
                };
                let blinded = commit_pt - value_generator() * Scalar::from(*value);
                let Some(public) = Commitment::from_point(&blinded) else {
                    return false;
                };
                proof.verify(&public, &public_message(*value, commitment))
            }
        }
    }

    /// Declared value of a public proof
    pub fn public_value(&self) -> Option<u64> {
        match self {
            RangeProof::Confidential(_) => None,
            RangeProof::Public { value, .. } => Some(*value),
        }
    }
}

fn public_message(value: u64, commitment: &Commitment) -> Hash {
    let mut h = Hasher::with_tag("public.value");
    h.update_u64(value).update(commitment.as_bytes());
    h.finish()
}
