//! Pedersen commitments on secp256k1
//!
//! A commitment binds a value and a blinding factor:
//! `commit(v, b) = b·G + v·V`, where `G` is the curve generator and `V` is a
//! second generator derived by hashing, with no known discrete log relation
//! to `G`.

use k256::elliptic_curve::ops::Reduce;
use k256::elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use k256::{AffinePoint, EncodedPoint, ProjectivePoint, Scalar, U256};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::{Hash, Hasher};

/// The value generator `V`
///
/// Derived by hashing a domain tag with an incrementing counter until the
/// digest is a valid x coordinate. Nothing-up-my-sleeve: no party knows its
/// discrete log with respect to `G`.
static VALUE_GENERATOR: Lazy<ProjectivePoint> = Lazy::new(|| {
    let mut counter: u64 = 0;
    loop {
        let mut h = Hasher::with_tag("value.generator");
        h.update_u64(counter);
        let digest = h.finish();

        let mut candidate = [0u8; 33];
        candidate[0] = 0x02;
        candidate[1..].copy_from_slice(&digest.0);

        if let Some(point) = decode_point(&candidate) {
            return point;
        }
        counter += 1;
    }
});

/// Get the value generator point
pub fn value_generator() -> ProjectivePoint {
    *VALUE_GENERATOR
}

/// A 33-byte compressed secp256k1 point
///
/// Used for output commitments, kernel excesses, and proof nonce points.
/// The point at infinity has no compressed encoding and is invalid in any
/// wire position.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Commitment(#[serde(with = "point_serde")] pub [u8; 33]);

pub(crate) mod point_serde {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8; 33], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 33], D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes: Vec<u8> = Deserialize::deserialize(deserializer)?;
        if bytes.len() != 33 {
            return Err(serde::de::Error::custom("Invalid point length"));
        }
        let mut arr = [0u8; 33];
        arr.copy_from_slice(&bytes);
        Ok(arr)
    }
}

impl Commitment {
    /// Commit to a value under a blinding factor
    ///
    /// Returns `None` only for the degenerate zero opening, which encodes
    /// the point at infinity.
    pub fn commit(value: u64, blind: &Scalar) -> Option<Self> {
        let point = ProjectivePoint::GENERATOR * blind + value_generator() * Scalar::from(value);
        Self::from_point(&point)
    }

    /// Wrap a curve point; `None` for the identity
    pub fn from_point(point: &ProjectivePoint) -> Option<Self> {
        if point == &ProjectivePoint::IDENTITY {
            return None;
        }
        let encoded = point.to_affine().to_encoded_point(true);
        let mut bytes = [0u8; 33];
        bytes.copy_from_slice(encoded.as_bytes());
        Some(Commitment(bytes))
    }

    /// Decode back to a curve point; `None` if the bytes are not on the curve
    pub fn to_point(&self) -> Option<ProjectivePoint> {
        decode_point(&self.0)
    }

    /// Raw compressed bytes
    pub fn as_bytes(&self) -> &[u8; 33] {
        &self.0
    }
}

impl fmt::Debug for Commitment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Commitment({})", hex::encode(self.0))
    }
}

impl fmt::Display for Commitment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Decode a compressed point
pub(crate) fn decode_point(bytes: &[u8; 33]) -> Option<ProjectivePoint> {
    let encoded = EncodedPoint::from_bytes(bytes).ok()?;
    let affine = Option::<AffinePoint>::from(AffinePoint::from_encoded_point(&encoded))?;
    Some(ProjectivePoint::from(affine))
}

/// Map a hash to a scalar by wide reduction
pub fn scalar_from_hash(hash: &Hash) -> Scalar {
    <Scalar as Reduce<U256>>::reduce_bytes(k256::FieldBytes::from_slice(&hash.0))
}

/// Scalar to its canonical 32-byte encoding
pub fn scalar_to_bytes(scalar: &Scalar) -> [u8; 32] {
    scalar.to_bytes().into()
}

/// Scalar from its canonical encoding; `None` if out of range
pub fn scalar_from_bytes(bytes: &[u8; 32]) -> Option<Scalar> {
    use k256::elliptic_curve::PrimeField;
    Option::from(Scalar::from_repr(k256::FieldBytes::clone_from_slice(bytes)))
}
