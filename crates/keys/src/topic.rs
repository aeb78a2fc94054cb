//! Deterministic topic keys
//!
//! A topic key is a rotating private key whose every field is derived from a
//! topic string via PBKDF2, so any two clients subscribing to the same topic
//! hold the same key. This stands in for shared symmetric keys on broadcast
//! channels.

use std::ops::Deref;

use pbkdf2::pbkdf2_hmac;
use sha2::{Digest, Sha256};

use ciphrtxt_core::{scalar_reduce_bytes, CryptoContext};

use crate::rotating::{KeyError, PrivateKey, Result, SlotAddress};

const PBKDF2_ROUNDS: u32 = 100_000;

/// Rotating private key derived from a topic string.
#[derive(Clone, PartialEq)]
pub struct TopicKey {
    topic: String,
    key: PrivateKey,
}

impl TopicKey {
    /// Derive the canonical single-rotation key for a topic.
    pub fn derive(ctx: &CryptoContext, topic: &str) -> Result<Self> {
        Self::derive_with_rotations(ctx, topic, 1)
    }

    /// Derive a topic key with `rotation_count` rotations. The topic string
    /// doubles as the PBKDF2 salt.
    pub fn derive_with_rotations(
        ctx: &CryptoContext,
        topic: &str,
        rotation_count: usize,
    ) -> Result<Self> {
        let nbytes = ((ctx.bits + 7) / 8) as usize;
        let key_size = (2 + 2 * rotation_count) * nbytes;
        let mut material = vec![0u8; key_size];
        pbkdf2_hmac::<Sha256>(
            topic.as_bytes(),
            topic.as_bytes(),
            PBKDF2_ROUNDS,
            &mut material,
        );

        let scalar = scalar_reduce_bytes(chunk32(&material, 0));
        if bool::from(scalar.is_zero()) {
            return Err(KeyError::InvalidMaterial);
        }

        let mut rotations = Vec::with_capacity(rotation_count);
        for n in 1..=rotation_count {
            let otp = chunk32(&material, 2 * n * nbytes);
            let t = scalar_reduce_bytes(chunk32(&material, (2 * n + 1) * nbytes));
            if bool::from(t.is_zero()) {
                return Err(KeyError::InvalidMaterial);
            }
            rotations.push((otp, t));
        }

        let mut rehash = chunk32(&material, key_size - nbytes);
        let t0 = 0x4000_0000
            | (0x0FFF_FFFF & u32::from_be_bytes([rehash[0], rehash[1], rehash[2], rehash[3]]));
        let ts = ctx.ts_min
            + u32::from_be_bytes([rehash[4], rehash[5], rehash[6], rehash[7]])
                % (ctx.ts_max - ctx.ts_min);

        // Low mask_size bits of the rehash seed give the mask, the next
        // mask_size bits the target; rehash until the mask has the required
        // bit count.
        let addr = loop {
            let mask = u32::from_be_bytes([rehash[28], rehash[29], rehash[30], rehash[31]])
                & ctx.mask_all();
            let target =
                u32::from_be_bytes([rehash[24], rehash[25], rehash[26], rehash[27]]) & mask;
            if mask.count_ones() == ctx.mask_bits {
                break SlotAddress { mask, target };
            }
            rehash = Sha256::digest(rehash).into();
        };

        Ok(Self {
            topic: topic.to_string(),
            key: PrivateKey::from_secret_parts(*ctx, scalar, rotations, addr, t0, ts),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn key(&self) -> &PrivateKey {
        &self.key
    }
}

impl Deref for TopicKey {
    type Target = PrivateKey;

    fn deref(&self) -> &PrivateKey {
        &self.key
    }
}

fn chunk32(material: &[u8], offset: usize) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&material[offset..offset + 32]);
    out
}
