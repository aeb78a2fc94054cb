//! secp256k1 point and scalar helpers
//!
//! Wire forms are SEC1 compressed points (33 bytes, leading 0x02/0x03) and
//! zero-padded big-endian hex for scalars. Hashing a point always hashes the
//! ASCII hex of its compressed form, matching the protocol's wire hashing.

use k256::elliptic_curve::ff::PrimeField;
use k256::elliptic_curve::group::Group;
use k256::elliptic_curve::ops::Reduce;
use k256::elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use k256::{AffinePoint, EncodedPoint, NonZeroScalar, ProjectivePoint, Scalar, U256};
use rand::{CryptoRng, RngCore};
use sha2::{Digest, Sha256};

use crate::error::{EcError, Result};

// secp256k1 field prime, big-endian 64-bit limbs.
const FIELD_PRIME_LIMBS: [u64; 4] = [
    0xFFFF_FFFF_FFFF_FFFF,
    0xFFFF_FFFF_FFFF_FFFF,
    0xFFFF_FFFF_FFFF_FFFF,
    0xFFFF_FFFE_FFFF_FC2F,
];

/// SEC1 compressed encoding of a point.
pub fn compress_point(point: &ProjectivePoint) -> [u8; 33] {
    let encoded = point.to_affine().to_encoded_point(true);
    let mut out = [0u8; 33];
    out.copy_from_slice(encoded.as_bytes());
    out
}

/// Lowercase ASCII hex of the compressed point (66 characters).
pub fn compress_point_hex(point: &ProjectivePoint) -> String {
    hex::encode(compress_point(point))
}

/// Decode a SEC1 compressed point. Rejects any prefix other than 0x02/0x03,
/// wrong lengths, off-curve x coordinates, and the identity.
pub fn decompress_point(bytes: &[u8]) -> Result<ProjectivePoint> {
    if bytes.len() != 33 || (bytes[0] != 0x02 && bytes[0] != 0x03) {
        return Err(EcError::InvalidPoint);
    }
    let encoded = EncodedPoint::from_bytes(bytes).map_err(|_| EcError::InvalidPoint)?;
    let affine = Option::<AffinePoint>::from(AffinePoint::from_encoded_point(&encoded))
        .ok_or(EcError::InvalidPoint)?;
    let point = ProjectivePoint::from(affine);
    if bool::from(point.is_identity()) {
        return Err(EcError::InvalidPoint);
    }
    Ok(point)
}

/// Decode a compressed point from its 66-character hex form.
pub fn decompress_point_hex(text: &str) -> Result<ProjectivePoint> {
    let bytes = hex::decode(text).map_err(|_| EcError::InvalidHex)?;
    decompress_point(&bytes)
}

/// Zero-padded big-endian hex of a scalar (64 characters).
pub fn scalar_to_hex(scalar: &Scalar) -> String {
    hex::encode(scalar.to_bytes())
}

/// Parse a scalar from 64 hex characters. Values >= the group order are
/// rejected rather than silently reduced.
pub fn scalar_from_hex(text: &str) -> Result<Scalar> {
    if text.len() != 64 {
        return Err(EcError::InvalidScalar);
    }
    let bytes = hex::decode(text).map_err(|_| EcError::InvalidHex)?;
    let mut repr = [0u8; 32];
    repr.copy_from_slice(&bytes);
    scalar_from_repr(repr)
}

/// Scalar from canonical big-endian bytes; rejects values >= the group order.
pub fn scalar_from_repr(bytes: [u8; 32]) -> Result<Scalar> {
    Option::<Scalar>::from(Scalar::from_repr(bytes.into())).ok_or(EcError::InvalidScalar)
}

/// Scalar from big-endian bytes, reduced modulo the group order.
pub fn scalar_reduce_bytes(bytes: [u8; 32]) -> Scalar {
    <Scalar as Reduce<U256>>::reduce_bytes(&bytes.into())
}

/// `int(SHA-256(data)) mod n` as a scalar.
pub fn hash_to_scalar(data: &[u8]) -> Scalar {
    let digest: [u8; 32] = Sha256::digest(data).into();
    scalar_reduce_bytes(digest)
}

/// Reduce a 256-bit big-endian value modulo the field prime p.
///
/// Any 256-bit value is < 2p, so the reduction is a single conditional
/// subtraction.
pub fn reduce_mod_field_prime(bytes: [u8; 32]) -> [u8; 32] {
    let mut limbs = [0u64; 4];
    for (i, limb) in limbs.iter_mut().enumerate() {
        let mut chunk = [0u8; 8];
        chunk.copy_from_slice(&bytes[i * 8..(i + 1) * 8]);
        *limb = u64::from_be_bytes(chunk);
    }
    if limbs >= FIELD_PRIME_LIMBS {
        let mut borrow = 0u64;
        for i in (0..4).rev() {
            let (diff, under) = limbs[i].overflowing_sub(FIELD_PRIME_LIMBS[i]);
            let (diff, under2) = diff.overflowing_sub(borrow);
            limbs[i] = diff;
            borrow = (under || under2) as u64;
        }
    }
    let mut out = [0u8; 32];
    for (i, limb) in limbs.iter().enumerate() {
        out[i * 8..(i + 1) * 8].copy_from_slice(&limb.to_be_bytes());
    }
    out
}

/// Uniform scalar in `[2, n-1]`.
pub fn random_scalar(rng: &mut (impl RngCore + CryptoRng)) -> Scalar {
    loop {
        let candidate = *NonZeroScalar::random(rng).as_ref();
        if candidate != Scalar::ONE {
            return candidate;
        }
    }
}

/// Uniform nonzero scalar in `[1, n-1]`.
pub fn random_nonzero_scalar(rng: &mut (impl RngCore + CryptoRng)) -> NonZeroScalar {
    NonZeroScalar::random(rng)
}

/// `s * G`.
pub fn g_mul(scalar: &Scalar) -> ProjectivePoint {
    ProjectivePoint::GENERATOR * scalar
}

/// Number of leading zero bits in a digest, MSB first.
pub fn leading_zero_bits(digest: &[u8]) -> u32 {
    let mut bits = 0;
    for &byte in digest {
        if byte == 0 {
            bits += 8;
        } else {
            bits += byte.leading_zeros();
            break;
        }
    }
    bits
}
