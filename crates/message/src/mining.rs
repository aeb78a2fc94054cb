//! Mining loops
//!
//! Slot mining rejection-samples an ephemeral scalar until the compressed
//! point's top bits land in the recipient's slot; the v2 proof of work
//! searches a 40-bit nonce until the header digest clears the difficulty
//! target. Both loops are cooperative: they report progress at a fixed
//! cadence and honor a cancellation token.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

use ciphrtxt_core::{
    compress_point, g_mul, leading_zero_bits, random_scalar, CryptoContext, ProjectivePoint,
    Scalar,
};
use ciphrtxt_keys::SlotAddress;

use crate::envelope::MessageError;
use crate::header::SignatureBytes;

/// Cancellation signal shared between a mining loop and its caller.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Progress report from a mining loop.
#[derive(Debug, Clone, Copy)]
pub enum MiningEvent {
    /// Slot search: closest prefix seen so far, by masked Hamming distance.
    Slot {
        attempts: u64,
        best_bits: u32,
        best_prefix: u32,
    },
    /// Proof-of-work search.
    Pow { attempts: u64 },
}

pub(crate) type ProgressFn<'a> = Box<dyn FnMut(&MiningEvent) + 'a>;

const SLOT_PROGRESS_CADENCE: u64 = 10;
const POW_PROGRESS_CADENCE: u64 = 100;

/// Rejection-sample an ephemeral scalar whose point lands in `addr`.
///
/// Expected attempts ≈ 2^mask_bits.
pub(crate) fn mine_slot(
    ctx: &CryptoContext,
    addr: SlotAddress,
    progress: &mut Option<ProgressFn<'_>>,
    cancel: Option<&CancelToken>,
) -> Result<(Scalar, ProjectivePoint, [u8; 33]), MessageError> {
    let mut attempts = 0u64;
    let mut best_bits = ctx.mask_size;
    let mut best_prefix = 0u32;
    loop {
        let s = random_scalar(&mut OsRng);
        let point = g_mul(&s);
        let compressed = compress_point(&point);
        let prefix = ctx.slot_prefix(&compressed) & addr.mask;
        let miss = addr.distance(prefix);
        if miss < best_bits {
            best_bits = miss;
            best_prefix = prefix;
        }
        if addr.matches(prefix) {
            return Ok((s, point, compressed));
        }
        if attempts % SLOT_PROGRESS_CADENCE == 0 {
            if let Some(cancel) = cancel {
                if cancel.is_cancelled() {
                    return Err(MessageError::Aborted);
                }
            }
            if let Some(callback) = progress {
                callback(&MiningEvent::Slot {
                    attempts,
                    best_bits,
                    best_prefix,
                });
            }
        }
        attempts += 1;
    }
}

/// Search for a 40-bit nonce `(nonce_m << 24) | nonce_l` such that
/// `SHA256(short_header_b64 || base64(r || s || nonce_m) || base64(nonce_l))`
/// has at least `nbits` leading zero bits.
///
/// The 66-byte `r || s || nonce_m` prefix is a multiple of 3, so its base64
/// concatenated with the nonce_l chunk equals the base64 of the contiguous
/// 69-byte signature block on the wire. The outer hash state is computed
/// once per `nonce_m` and cloned per `nonce_l` attempt.
pub(crate) fn mine_pow(
    short_header_b64: &str,
    sig: &SignatureBytes,
    nbits: u32,
    progress: &mut Option<ProgressFn<'_>>,
    cancel: Option<&CancelToken>,
) -> Result<u64, MessageError> {
    let mut attempts = 0u64;
    for nonce_m in 0..=u16::MAX {
        let mut prefix = [0u8; 66];
        prefix[..32].copy_from_slice(&sig.r);
        prefix[32..64].copy_from_slice(&sig.s);
        prefix[64..].copy_from_slice(&nonce_m.to_be_bytes());

        let mut outer = Sha256::new();
        outer.update(short_header_b64.as_bytes());
        outer.update(BASE64.encode(prefix).as_bytes());

        for nonce_l in 0..(1u32 << 24) {
            let mut hasher = outer.clone();
            hasher.update(BASE64.encode(&nonce_l.to_be_bytes()[1..]).as_bytes());
            let digest = hasher.finalize();
            if leading_zero_bits(&digest) >= nbits {
                return Ok(((nonce_m as u64) << 24) | nonce_l as u64);
            }
            if attempts % POW_PROGRESS_CADENCE == 0 {
                if let Some(cancel) = cancel {
                    if cancel.is_cancelled() {
                        return Err(MessageError::Aborted);
                    }
                }
                if let Some(callback) = progress {
                    callback(&MiningEvent::Pow { attempts });
                }
            }
            attempts += 1;
        }
    }
    Err(MessageError::PowExhausted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_token() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        let shared = token.clone();
        shared.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_mine_slot_lands_in_bucket() {
        let ctx = CryptoContext::standard();
        // Narrow two-bit mask keeps the search fast.
        let addr = SlotAddress {
            mask: 0x8000_0001,
            target: 0x8000_0000,
        };
        let (s, point, compressed) = mine_slot(&ctx, addr, &mut None, None).unwrap();
        assert_eq!(g_mul(&s), point);
        assert!(addr.matches(ctx.slot_prefix(&compressed)));
    }

    #[test]
    fn test_mine_slot_cancelled() {
        let ctx = CryptoContext::standard();
        // Full 32-bit bucket would take ~2^32 attempts; cancellation fires
        // long before that.
        let addr = SlotAddress {
            mask: 0xFFFF_FFFF,
            target: 0x1234_5678,
        };
        let token = CancelToken::new();
        token.cancel();
        let result = mine_slot(&ctx, addr, &mut None, Some(&token));
        assert!(matches!(result, Err(MessageError::Aborted)));
    }

    #[test]
    fn test_mine_pow_meets_target() {
        let sig = SignatureBytes {
            r: [0x11; 32],
            s: [0x22; 32],
        };
        let short = "A".repeat(164);
        let nbits = 8;
        let nonce = mine_pow(&short, &sig, nbits, &mut None, None).unwrap();
        assert!(nonce < 1u64 << 40);

        // Recompute the digest the way a verifier would.
        let mut block = [0u8; 69];
        block[..32].copy_from_slice(&sig.r);
        block[32..64].copy_from_slice(&sig.s);
        block[64..].copy_from_slice(&nonce.to_be_bytes()[3..]);
        let mut hasher = Sha256::new();
        hasher.update(short.as_bytes());
        hasher.update(BASE64.encode(block).as_bytes());
        assert!(leading_zero_bits(&hasher.finalize()) >= nbits);
    }

    #[test]
    fn test_pow_progress_cadence() {
        let sig = SignatureBytes {
            r: [0x33; 32],
            s: [0x44; 32],
        };
        let short = "B".repeat(164);
        let mut calls = 0u64;
        let mut progress: Option<ProgressFn<'_>> = Some(Box::new(|event| {
            if let MiningEvent::Pow { .. } = event {
                calls += 1;
            }
        }));
        mine_pow(&short, &sig, 4, &mut progress, None).unwrap();
        drop(progress);
        assert!(calls >= 1);
    }
}
