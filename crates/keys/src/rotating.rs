//! Time-rotating identity keys
//!
//! A keypair's effective EC scalar/point evolves with wall-clock time: the
//! long-term key is combined with per-rotation offsets derived HOTP-style
//! from a one-time pad and the current step counter. The key also carries a
//! sparse slot mask/target pair that relays use to route headers without
//! identifying the recipient.

use std::collections::HashMap;
use std::fmt;

use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use rand::{CryptoRng, Rng, RngCore};
use sha2::{Digest, Sha256};
use thiserror::Error;

use ciphrtxt_core::{
    compress_point_hex, decompress_point_hex, g_mul, now_epoch, random_scalar,
    reduce_mod_field_prime, scalar_from_hex, scalar_reduce_bytes, scalar_to_hex, CryptoContext,
    EcError, ProjectivePoint, Scalar,
};

type HmacSha256 = Hmac<Sha256>;

/// Serial format version, 1.0 in fixed point.
pub const KEY_FORMAT_VERSION: &str = "0100";

const STEP_COUNTER_MODULUS: i64 = 10_000_000;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("Malformed key serialization")]
    Malformed,

    #[error("Key material out of range")]
    InvalidMaterial,
}

impl From<EcError> for KeyError {
    fn from(_: EcError) -> Self {
        KeyError::Malformed
    }
}

pub type Result<T> = std::result::Result<T, KeyError>;

/// Routing prefix descriptor: a sparse mask over the top bits of an
/// ephemeral point's x coordinate, and the target value within that mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotAddress {
    pub mask: u32,
    pub target: u32,
}

impl SlotAddress {
    /// Whether a slot prefix lands in this address bucket.
    pub fn matches(&self, prefix: u32) -> bool {
        prefix & self.mask == self.target
    }

    /// Hamming distance between a candidate prefix and the target, within
    /// the mask. Used for mining progress reporting.
    pub fn distance(&self, prefix: u32) -> u32 {
        ((prefix & self.mask) ^ self.target).count_ones()
    }

    /// Draw a mask with exactly `mask_bits` set bits and a random target
    /// subset of those bits.
    pub fn random(ctx: &CryptoContext, rng: &mut (impl RngCore + CryptoRng)) -> Self {
        loop {
            let mut mask = 0u32;
            let mut target = 0u32;
            for _ in 0..ctx.mask_bits {
                let bit = loop {
                    let bit = 1u32 << rng.gen_range(0..ctx.mask_size);
                    if mask & bit == 0 {
                        break bit;
                    }
                };
                mask |= bit;
                if rng.gen::<bool>() {
                    target |= bit;
                }
            }
            if mask != 0 {
                return Self { mask, target };
            }
        }
    }
}

/// One public rotation entry: the one-time pad and the pad's public point.
#[derive(Clone, PartialEq)]
pub struct PublicRotation {
    pub otp: [u8; 32],
    pub point: ProjectivePoint,
}

#[derive(Clone, PartialEq)]
struct SecretRotation {
    otp: [u8; 32],
    scalar: Scalar,
}

/// Step index for a wall-clock time: `floor((time - t0) / ts)`.
fn steps_at(t0: u32, ts: u32, time: i64) -> i64 {
    (time - t0 as i64).div_euclid(ts as i64)
}

/// HOTP-style rotation offset.
///
/// The HMAC key is the 64-character lowercase hex of the pad; the counter is
/// the step index modulo 10^7, zero-padded to 7 decimal digits. The MAC
/// output must be reduced modulo the field prime p (not the group order)
/// before use as a scalar, or derived keys drift from the wire format.
fn rotation_offset(otp: &[u8; 32], steps: i64) -> Scalar {
    let key = hex::encode(otp);
    let counter = format!("{:07}", steps.rem_euclid(STEP_COUNTER_MODULUS));
    let mut mac =
        HmacSha256::new_from_slice(key.as_bytes()).expect("HMAC accepts any key length");
    mac.update(counter.as_bytes());
    let digest: [u8; 32] = mac.finalize().into_bytes().into();
    scalar_reduce_bytes(reduce_mod_field_prime(digest))
}

/// Last 8 hex characters of SHA-256 over the serialized text.
fn checksum_suffix(text: &str) -> String {
    let digest = hex::encode(Sha256::digest(text.as_bytes()));
    digest[digest.len() - 8..].to_string()
}

/// Strip a one-character field code, verifying it matches.
fn tagged(field: &str, code: char) -> Result<&str> {
    let mut chars = field.chars();
    if chars.next() != Some(code) {
        return Err(KeyError::Malformed);
    }
    Ok(chars.as_str())
}

fn parse_hex_u32(text: &str, width: usize) -> Result<u32> {
    if text.len() != width {
        return Err(KeyError::Malformed);
    }
    u32::from_str_radix(text, 16).map_err(|_| KeyError::Malformed)
}

fn parse_otp(text: &str) -> Result<[u8; 32]> {
    if text.len() != 64 {
        return Err(KeyError::Malformed);
    }
    let bytes = hex::decode(text).map_err(|_| KeyError::Malformed)?;
    let mut otp = [0u8; 32];
    otp.copy_from_slice(&bytes);
    Ok(otp)
}

/// Public half of a rotating identity key.
pub struct PublicKey {
    ctx: CryptoContext,
    point: ProjectivePoint,
    addr: SlotAddress,
    t0: u32,
    ts: u32,
    rotations: Vec<PublicRotation>,
    name: Option<String>,
    metadata: HashMap<String, String>,
    memo: Mutex<Option<(i64, ProjectivePoint)>>,
}

impl Clone for PublicKey {
    fn clone(&self) -> Self {
        Self {
            ctx: self.ctx,
            point: self.point,
            addr: self.addr,
            t0: self.t0,
            ts: self.ts,
            rotations: self.rotations.clone(),
            name: self.name.clone(),
            metadata: self.metadata.clone(),
            memo: Mutex::new(*self.memo.lock()),
        }
    }
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.point == other.point
            && self.addr == other.addr
            && self.t0 == other.t0
            && self.ts == other.ts
            && self.rotations == other.rotations
    }
}

impl PublicKey {
    fn from_parts(
        ctx: CryptoContext,
        point: ProjectivePoint,
        addr: SlotAddress,
        t0: u32,
        ts: u32,
        rotations: Vec<PublicRotation>,
    ) -> Self {
        Self {
            ctx,
            point,
            addr,
            t0,
            ts,
            rotations,
            name: None,
            metadata: HashMap::new(),
            memo: Mutex::new(None),
        }
    }

    pub fn context(&self) -> &CryptoContext {
        &self.ctx
    }

    /// Long-term identity point.
    pub fn point(&self) -> &ProjectivePoint {
        &self.point
    }

    pub fn addr(&self) -> SlotAddress {
        self.addr
    }

    pub fn t0(&self) -> u32 {
        self.t0
    }

    pub fn ts(&self) -> u32 {
        self.ts
    }

    pub fn rotations(&self) -> &[PublicRotation] {
        &self.rotations
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = Some(name.into());
    }

    /// Client-local metadata; never serialized.
    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.insert(key.into(), value.into());
    }

    pub fn get_metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// Short human-readable label: name plus the first 8 hex characters of
    /// the compressed identity point.
    pub fn label(&self) -> String {
        let short: String = compress_point_hex(&self.point).chars().take(8).collect();
        match &self.name {
            Some(name) => format!("{}_{}", name, short),
            None => short,
        }
    }

    /// Effective public point for a wall-clock time: the identity point plus
    /// the HOTP combination of all rotation points. Memoized per step.
    pub fn current_point_at(&self, time: i64) -> ProjectivePoint {
        let steps = steps_at(self.t0, self.ts, time);
        if let Some((cached, point)) = *self.memo.lock() {
            if cached == steps {
                return point;
            }
        }
        let mut point = self.point;
        for rotation in &self.rotations {
            point += rotation.point * rotation_offset(&rotation.otp, steps);
        }
        *self.memo.lock() = Some((steps, point));
        point
    }

    pub fn current_point(&self) -> ProjectivePoint {
        self.current_point_at(now_epoch() as i64)
    }

    /// ASCII serial form with uppercase field codes and a SHA-256 suffix
    /// checksum.
    pub fn serialize(&self) -> String {
        let mw = self.ctx.mask_hex_width();
        let mut out = format!("P{}", KEY_FORMAT_VERSION);
        out.push_str(&format!(":K{}", compress_point_hex(&self.point)));
        out.push_str(&format!(":M{:0mw$x}", self.addr.mask));
        out.push_str(&format!(":N{:0mw$x}", self.addr.target));
        out.push_str(&format!(":Z{:08x}", self.t0));
        out.push_str(&format!(":S{:08x}", self.ts));
        out.push_str(&format!(":R{:04x}", self.rotations.len()));
        for rotation in &self.rotations {
            out.push_str(&format!(":F{}", hex::encode(rotation.otp)));
            out.push_str(&format!(":T{}", compress_point_hex(&rotation.point)));
        }
        let check = checksum_suffix(&out);
        out.push_str(":C");
        out.push_str(&check);
        out
    }

    pub fn deserialize(ctx: &CryptoContext, text: &str) -> Result<Self> {
        let (body, check) = text.rsplit_once(":C").ok_or(KeyError::Malformed)?;
        if checksum_suffix(body) != check {
            return Err(KeyError::Malformed);
        }
        let fields: Vec<&str> = body.split(':').collect();
        if fields.len() < 7 {
            return Err(KeyError::Malformed);
        }
        if tagged(fields[0], 'P')? != KEY_FORMAT_VERSION {
            return Err(KeyError::Malformed);
        }
        let mw = ctx.mask_hex_width();
        let point = decompress_point_hex(tagged(fields[1], 'K')?)?;
        let mask = parse_hex_u32(tagged(fields[2], 'M')?, mw)?;
        let target = parse_hex_u32(tagged(fields[3], 'N')?, mw)?;
        let t0 = parse_hex_u32(tagged(fields[4], 'Z')?, 8)?;
        let ts = parse_hex_u32(tagged(fields[5], 'S')?, 8)?;
        let count = parse_hex_u32(tagged(fields[6], 'R')?, 4)? as usize;
        if fields.len() != 7 + 2 * count {
            return Err(KeyError::Malformed);
        }
        if ts == 0 || target & mask != target {
            return Err(KeyError::Malformed);
        }
        let mut rotations = Vec::with_capacity(count);
        for i in 0..count {
            let otp = parse_otp(tagged(fields[7 + 2 * i], 'F')?)?;
            let point = decompress_point_hex(tagged(fields[8 + 2 * i], 'T')?)?;
            rotations.push(PublicRotation { otp, point });
        }
        Ok(Self::from_parts(
            *ctx,
            point,
            SlotAddress { mask, target },
            t0,
            ts,
            rotations,
        ))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.serialize())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublicKey").field("label", &self.label()).finish()
    }
}

/// Private rotating identity key. Holds the public half alongside the
/// long-term scalar and per-rotation secret scalars.
pub struct PrivateKey {
    public: PublicKey,
    scalar: Scalar,
    rotations: Vec<SecretRotation>,
    memo: Mutex<Option<(i64, Scalar)>>,
}

impl Clone for PrivateKey {
    fn clone(&self) -> Self {
        Self {
            public: self.public.clone(),
            scalar: self.scalar,
            rotations: self.rotations.clone(),
            memo: Mutex::new(*self.memo.lock()),
        }
    }
}

impl PartialEq for PrivateKey {
    fn eq(&self, other: &Self) -> bool {
        self.scalar == other.scalar
            && self.rotations == other.rotations
            && self.public == other.public
    }
}

impl PrivateKey {
    pub(crate) fn from_secret_parts(
        ctx: CryptoContext,
        scalar: Scalar,
        secret_rotations: Vec<([u8; 32], Scalar)>,
        addr: SlotAddress,
        t0: u32,
        ts: u32,
    ) -> Self {
        let rotations: Vec<SecretRotation> = secret_rotations
            .into_iter()
            .map(|(otp, scalar)| SecretRotation { otp, scalar })
            .collect();
        let public_rotations = rotations
            .iter()
            .map(|r| PublicRotation {
                otp: r.otp,
                point: g_mul(&r.scalar),
            })
            .collect();
        let public = PublicKey::from_parts(ctx, g_mul(&scalar), addr, t0, ts, public_rotations);
        Self {
            public,
            scalar,
            rotations,
            memo: Mutex::new(None),
        }
    }

    /// Generate a fresh identity with `rotation_count` time-based rotations.
    pub fn generate(
        ctx: &CryptoContext,
        rotation_count: usize,
        rng: &mut (impl RngCore + CryptoRng),
    ) -> Self {
        let scalar = random_scalar(rng);
        let addr = SlotAddress::random(ctx, rng);
        let t0 = rng.gen_range(0..=now_epoch());
        let ts = loop {
            let draw = rng.gen_range(ctx.ts_target - ctx.ts_sigma..=ctx.ts_target + ctx.ts_sigma);
            if draw > ctx.ts_min && draw < ctx.ts_max {
                break draw;
            }
        };
        let mut rotations = Vec::with_capacity(rotation_count);
        for _ in 0..rotation_count {
            let mut otp = [0u8; 32];
            rng.fill_bytes(&mut otp);
            rotations.push((otp, random_scalar(rng)));
        }
        Self::from_secret_parts(*ctx, scalar, rotations, addr, t0, ts)
    }

    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    pub fn public_mut(&mut self) -> &mut PublicKey {
        &mut self.public
    }

    /// Detached copy of the public half.
    pub fn to_public(&self) -> PublicKey {
        self.public.clone()
    }

    pub fn context(&self) -> &CryptoContext {
        self.public.context()
    }

    pub fn addr(&self) -> SlotAddress {
        self.public.addr()
    }

    /// Short label from the secret scalar; `pubkey_label` gives the public
    /// form.
    pub fn label(&self) -> String {
        let short: String = scalar_to_hex(&self.scalar).chars().take(8).collect();
        match self.public.name() {
            Some(name) => format!("{}_{}", name, short),
            None => short,
        }
    }

    pub fn pubkey_label(&self) -> String {
        self.public.label()
    }

    /// Effective private scalar for a wall-clock time. Memoized per step;
    /// `current_scalar_at(t) * G == public().current_point_at(t)` for all t.
    pub fn current_scalar_at(&self, time: i64) -> Scalar {
        let steps = steps_at(self.public.t0, self.public.ts, time);
        if let Some((cached, scalar)) = *self.memo.lock() {
            if cached == steps {
                return scalar;
            }
        }
        let mut scalar = self.scalar;
        for rotation in &self.rotations {
            scalar += rotation.scalar * rotation_offset(&rotation.otp, steps);
        }
        *self.memo.lock() = Some((steps, scalar));
        scalar
    }

    pub fn current_scalar(&self) -> Scalar {
        self.current_scalar_at(now_epoch() as i64)
    }

    /// ASCII serial form with lowercase field codes; the rotation entries
    /// carry the secret scalars instead of points.
    pub fn serialize(&self) -> String {
        let mw = self.public.ctx.mask_hex_width();
        let mut out = format!("p{}", KEY_FORMAT_VERSION);
        out.push_str(&format!(":k{}", scalar_to_hex(&self.scalar)));
        out.push_str(&format!(":m{:0mw$x}", self.public.addr.mask));
        out.push_str(&format!(":n{:0mw$x}", self.public.addr.target));
        out.push_str(&format!(":z{:08x}", self.public.t0));
        out.push_str(&format!(":s{:08x}", self.public.ts));
        out.push_str(&format!(":r{:04x}", self.rotations.len()));
        for rotation in &self.rotations {
            out.push_str(&format!(":f{}", hex::encode(rotation.otp)));
            out.push_str(&format!(":t{}", scalar_to_hex(&rotation.scalar)));
        }
        let check = checksum_suffix(&out);
        out.push_str(":c");
        out.push_str(&check);
        out
    }

    pub fn deserialize(ctx: &CryptoContext, text: &str) -> Result<Self> {
        let (body, check) = text.rsplit_once(":c").ok_or(KeyError::Malformed)?;
        if checksum_suffix(body) != check {
            return Err(KeyError::Malformed);
        }
        let fields: Vec<&str> = body.split(':').collect();
        if fields.len() < 7 {
            return Err(KeyError::Malformed);
        }
        if tagged(fields[0], 'p')? != KEY_FORMAT_VERSION {
            return Err(KeyError::Malformed);
        }
        let mw = ctx.mask_hex_width();
        let scalar = scalar_from_hex(tagged(fields[1], 'k')?)?;
        let mask = parse_hex_u32(tagged(fields[2], 'm')?, mw)?;
        let target = parse_hex_u32(tagged(fields[3], 'n')?, mw)?;
        let t0 = parse_hex_u32(tagged(fields[4], 'z')?, 8)?;
        let ts = parse_hex_u32(tagged(fields[5], 's')?, 8)?;
        let count = parse_hex_u32(tagged(fields[6], 'r')?, 4)? as usize;
        if fields.len() != 7 + 2 * count {
            return Err(KeyError::Malformed);
        }
        if ts == 0 || target & mask != target || bool::from(scalar.is_zero()) {
            return Err(KeyError::Malformed);
        }
        let mut rotations = Vec::with_capacity(count);
        for i in 0..count {
            let otp = parse_otp(tagged(fields[7 + 2 * i], 'f')?)?;
            let t = scalar_from_hex(tagged(fields[8 + 2 * i], 't')?)?;
            if bool::from(t.is_zero()) {
                return Err(KeyError::Malformed);
            }
            rotations.push((otp, t));
        }
        Ok(Self::from_secret_parts(
            *ctx,
            scalar,
            rotations,
            SlotAddress { mask, target },
            t0,
            ts,
        ))
    }
}

impl fmt::Display for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.serialize())
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateKey").field("label", &self.label()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    fn ctx() -> CryptoContext {
        CryptoContext::standard()
    }

    #[test]
    fn test_current_scalar_matches_current_point() {
        let key = PrivateKey::generate(&ctx(), 4, &mut OsRng);
        let now = now_epoch() as i64;
        for offset in [0i64, 1, 3600, 86_400, 500_000, 30_000_000] {
            let t = now + offset;
            let scalar = key.current_scalar_at(t);
            let point = key.public().current_point_at(t);
            assert_eq!(g_mul(&scalar), point, "rotation mismatch at offset {}", offset);
        }
    }

    #[test]
    fn test_rotation_holds_before_t0() {
        let key = PrivateKey::generate(&ctx(), 2, &mut OsRng);
        let t = key.public().t0() as i64 - 12_345;
        assert_eq!(g_mul(&key.current_scalar_at(t)), key.public().current_point_at(t));
    }

    #[test]
    fn test_no_rotations_is_static() {
        let key = PrivateKey::generate(&ctx(), 0, &mut OsRng);
        let now = now_epoch() as i64;
        assert_eq!(key.public().current_point_at(now), *key.public().point());
        assert_eq!(key.current_scalar_at(now + 999_999), key.current_scalar_at(now));
    }

    #[test]
    fn test_mask_invariants() {
        let context = ctx();
        for _ in 0..8 {
            let addr = SlotAddress::random(&context, &mut OsRng);
            assert_eq!(addr.mask.count_ones(), context.mask_bits);
            assert_eq!(addr.target & addr.mask, addr.target);
        }
    }

    #[test]
    fn test_ts_within_window() {
        let context = ctx();
        let key = PrivateKey::generate(&context, 1, &mut OsRng);
        assert!(key.public().ts() > context.ts_min);
        assert!(key.public().ts() < context.ts_max);
    }

    #[test]
    fn test_public_serialize_roundtrip() {
        let context = ctx();
        let key = PrivateKey::generate(&context, 4, &mut OsRng);
        let serialized = key.public().serialize();
        assert!(serialized.starts_with("P0100:K"));
        let restored = PublicKey::deserialize(&context, &serialized).unwrap();
        assert_eq!(restored, *key.public());
        assert_eq!(restored.serialize(), serialized);
    }

    #[test]
    fn test_private_serialize_roundtrip() {
        let context = ctx();
        let key = PrivateKey::generate(&context, 3, &mut OsRng);
        let serialized = key.serialize();
        assert!(serialized.starts_with("p0100:k"));
        let restored = PrivateKey::deserialize(&context, &serialized).unwrap();
        assert_eq!(restored, key);
        assert_eq!(restored.serialize(), serialized);
        assert_eq!(restored.public().serialize(), key.public().serialize());
    }

    #[test]
    fn test_deserialize_rejects_tampered_checksum() {
        let context = ctx();
        let key = PrivateKey::generate(&context, 1, &mut OsRng);
        let mut serialized = key.public().serialize();
        // Flip a hex digit inside the identity point field.
        let flipped = if serialized.as_bytes()[10] == b'0' { '1' } else { '0' };
        serialized.replace_range(10..11, &flipped.to_string());
        assert_eq!(
            PublicKey::deserialize(&context, &serialized),
            Err(KeyError::Malformed)
        );
    }

    #[test]
    fn test_deserialize_rejects_wrong_field_code() {
        let context = ctx();
        let key = PrivateKey::generate(&context, 1, &mut OsRng);
        let serialized = key.public().serialize().replacen(":K", ":Q", 1);
        // Checksum no longer matches either, but even with a fixed checksum
        // the field code is invalid.
        assert!(PublicKey::deserialize(&context, &serialized).is_err());

        let body = serialized.rsplit_once(":C").unwrap().0.to_string();
        let refreshed = format!("{}:C{}", body, checksum_suffix(&body));
        assert_eq!(
            PublicKey::deserialize(&context, &refreshed),
            Err(KeyError::Malformed)
        );
    }

    #[test]
    fn test_deserialize_rejects_truncation() {
        let context = ctx();
        let key = PrivateKey::generate(&context, 2, &mut OsRng);
        let serialized = key.serialize();
        assert!(PrivateKey::deserialize(&context, &serialized[..serialized.len() - 1]).is_err());
        assert!(PrivateKey::deserialize(&context, "").is_err());
        assert!(PublicKey::deserialize(&context, &serialized).is_err());
    }

    #[test]
    fn test_memoization_returns_same_point() {
        let key = PrivateKey::generate(&ctx(), 2, &mut OsRng);
        let t = now_epoch() as i64;
        let first = key.public().current_point_at(t);
        let second = key.public().current_point_at(t);
        assert_eq!(first, second);
        // A different step invalidates the memo.
        let later = key.public().current_point_at(t + key.public().ts() as i64 * 2);
        assert_ne!(first, later);
    }

    #[test]
    fn test_label_and_metadata() {
        let context = ctx();
        let mut key = PrivateKey::generate(&context, 1, &mut OsRng);
        key.public_mut().set_name("alice");
        key.public_mut().set_metadata("phone", "555-555-1212");
        assert!(key.pubkey_label().starts_with("alice_"));
        assert_eq!(key.public().get_metadata("phone"), Some("555-555-1212"));
        assert_eq!(key.public().get_metadata("fax"), None);
        // Name and metadata do not affect the serial form.
        let plain = PrivateKey::deserialize(&context, &key.serialize()).unwrap();
        assert_eq!(plain, key);
    }
}
