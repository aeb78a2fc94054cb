//! Network Access Keys
//!
//! A NAK is a short-lived self-signed ECDSA credential: relays require one
//! on onion traffic and verify the self-signature on every hop. The wire
//! form is 101 bytes: expire, compressed pubkey, and the signature over the
//! first 37 bytes.

use std::cmp::Ordering;
use std::fmt;

use k256::ecdsa::signature::{Signer, Verifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use ciphrtxt_core::{
    compress_point, compress_point_hex, decompress_point, g_mul, now_epoch,
    random_nonzero_scalar, NonZeroScalar, ProjectivePoint,
};
use ciphrtxt_message::SignatureBytes;

/// Serialized NAK length: 4 + 33 + 32 + 32.
pub const NAK_WIRE_LEN: usize = 101;

/// Default credential lifetime: one year.
const DEFAULT_NAK_TTL: u32 = 365 * 24 * 60 * 60;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NakError {
    #[error("Malformed network access key")]
    Malformed,

    #[error("No private key held")]
    MissingPrivateKey,

    #[error("Signing failed")]
    SigningFailed,
}

#[derive(Serialize, Deserialize)]
struct NakJson {
    pubkey: String,
    expire: u32,
    signature: [String; 2],
}

/// Self-signed network access credential.
#[derive(Clone)]
pub struct Nak {
    expire: u32,
    pubkey: ProjectivePoint,
    signature: Option<SignatureBytes>,
    privkey: Option<NonZeroScalar>,
}

impl Nak {
    /// Generate a fresh credential expiring in one year.
    pub fn generate(rng: &mut (impl RngCore + CryptoRng)) -> Self {
        Self::generate_with_expire(rng, now_epoch().saturating_add(DEFAULT_NAK_TTL))
    }

    pub fn generate_with_expire(rng: &mut (impl RngCore + CryptoRng), expire: u32) -> Self {
        let privkey = random_nonzero_scalar(rng);
        Self::from_private(expire, privkey)
    }

    /// Rebuild a credential from a held private scalar.
    pub fn from_private(expire: u32, privkey: NonZeroScalar) -> Self {
        Self {
            expire,
            pubkey: g_mul(privkey.as_ref()),
            signature: None,
            privkey: Some(privkey),
        }
    }

    pub fn expire(&self) -> u32 {
        self.expire
    }

    pub fn pubkey(&self) -> &ProjectivePoint {
        &self.pubkey
    }

    pub fn pubkey_bytes(&self) -> [u8; 33] {
        compress_point(&self.pubkey)
    }

    pub fn has_private(&self) -> bool {
        self.privkey.is_some()
    }

    fn signing_key(&self) -> Result<SigningKey, NakError> {
        let privkey = self.privkey.ok_or(NakError::MissingPrivateKey)?;
        SigningKey::from_bytes(&privkey.as_ref().to_bytes())
            .map_err(|_| NakError::SigningFailed)
    }

    fn signable_bytes(&self) -> [u8; 37] {
        let mut out = [0u8; 37];
        out[..4].copy_from_slice(&self.expire.to_be_bytes());
        out[4..].copy_from_slice(&self.pubkey_bytes());
        out
    }

    /// Sign caller-supplied bytes with the credential key (ECDSA-SHA256).
    pub fn sign(&self, message: &[u8]) -> Result<SignatureBytes, NakError> {
        let signature: Signature = self
            .signing_key()?
            .try_sign(message)
            .map_err(|_| NakError::SigningFailed)?;
        let bytes = signature.to_bytes();
        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        r.copy_from_slice(&bytes[..32]);
        s.copy_from_slice(&bytes[32..]);
        Ok(SignatureBytes { r, s })
    }

    /// Verify a signature over caller-supplied bytes against the credential
    /// pubkey.
    pub fn verify(&self, signature: &SignatureBytes, message: &[u8]) -> bool {
        let Ok(verifying) = VerifyingKey::from_affine(self.pubkey.to_affine()) else {
            return false;
        };
        let Ok(signature) = Signature::from_scalars(signature.r, signature.s) else {
            return false;
        };
        verifying.verify(message, &signature).is_ok()
    }

    /// 101-byte wire form. The self-signature is created on first use when
    /// a private scalar is held.
    pub fn serialize(&mut self) -> Result<[u8; NAK_WIRE_LEN], NakError> {
        let signature = match self.signature {
            Some(signature) => signature,
            None => {
                let signature = self.sign(&self.signable_bytes())?;
                self.signature = Some(signature);
                signature
            }
        };
        let mut out = [0u8; NAK_WIRE_LEN];
        out[..37].copy_from_slice(&self.signable_bytes());
        out[37..69].copy_from_slice(&signature.r);
        out[69..].copy_from_slice(&signature.s);
        Ok(out)
    }

    /// Parse and verify a 101-byte credential. Any failure, including a bad
    /// self-signature, reports malformed.
    pub fn deserialize(raw: &[u8]) -> Result<Self, NakError> {
        if raw.len() != NAK_WIRE_LEN {
            return Err(NakError::Malformed);
        }
        let expire = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
        let pubkey = decompress_point(&raw[4..37]).map_err(|_| NakError::Malformed)?;
        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        r.copy_from_slice(&raw[37..69]);
        s.copy_from_slice(&raw[69..]);
        let nak = Self {
            expire,
            pubkey,
            signature: Some(SignatureBytes { r, s }),
            privkey: None,
        };
        if !nak.verify(&SignatureBytes { r, s }, &raw[..37]) {
            return Err(NakError::Malformed);
        }
        Ok(nak)
    }

    /// JSON export; the signature components are hex strings.
    pub fn to_json(&mut self) -> Result<String, NakError> {
        if self.signature.is_none() {
            self.serialize()?;
        }
        let signature = self.signature.ok_or(NakError::MissingPrivateKey)?;
        serde_json::to_string(&NakJson {
            pubkey: compress_point_hex(&self.pubkey),
            expire: self.expire,
            signature: [hex::encode(signature.r), hex::encode(signature.s)],
        })
        .map_err(|_| NakError::Malformed)
    }

    pub fn from_json(text: &str) -> Result<Self, NakError> {
        let raw: NakJson = serde_json::from_str(text).map_err(|_| NakError::Malformed)?;
        let pubkey = hex::decode(&raw.pubkey).map_err(|_| NakError::Malformed)?;
        let r: [u8; 32] = hex::decode(&raw.signature[0])
            .map_err(|_| NakError::Malformed)?
            .try_into()
            .map_err(|_| NakError::Malformed)?;
        let s: [u8; 32] = hex::decode(&raw.signature[1])
            .map_err(|_| NakError::Malformed)?
            .try_into()
            .map_err(|_| NakError::Malformed)?;
        Ok(Self {
            expire: raw.expire,
            pubkey: decompress_point(&pubkey).map_err(|_| NakError::Malformed)?,
            signature: Some(SignatureBytes { r, s }),
            privkey: None,
        })
    }
}

impl PartialEq for Nak {
    fn eq(&self, other: &Self) -> bool {
        self.expire == other.expire && self.pubkey == other.pubkey
    }
}

impl Nak {
    /// Ordering used by credential stores: expiry first, pubkey bytes as
    /// tie-break.
    pub fn cmp_order(&self, other: &Self) -> Ordering {
        (self.expire, self.pubkey_bytes()).cmp(&(other.expire, other.pubkey_bytes()))
    }
}

impl fmt::Debug for Nak {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Nak")
            .field("pubkey", &compress_point_hex(&self.pubkey))
            .field("expire", &self.expire)
            .finish()
    }
}
