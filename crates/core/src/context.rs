use std::time::{SystemTime, UNIX_EPOCH};

/// Curve and addressing parameters threaded through every constructor.
///
/// The reference deployment runs on secp256k1 (256-bit field, 33-byte
/// compressed points). Slot addressing uses the top `mask_size` bits of an
/// ephemeral point's x coordinate; rotating keys step once per `ts` seconds
/// with `ts` drawn from the `[ts_min, ts_max]` window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CryptoContext {
    /// Curve field bit length. Must be a multiple of 8.
    pub bits: u32,
    /// Slot mask width in bits: `min(32, bits)`.
    pub mask_size: u32,
    /// Number of set bits in a slot mask: `mask_size / 3`.
    pub mask_bits: u32,
    /// Target rotation period (seconds).
    pub ts_target: u32,
    /// Spread of the rotation period draw (seconds).
    pub ts_sigma: u32,
    /// Minimum rotation period (seconds).
    pub ts_min: u32,
    /// Maximum rotation period (seconds).
    pub ts_max: u32,
}

impl CryptoContext {
    /// Parameters for the secp256k1 deployment: 32-bit slot prefix with 10
    /// mask bits, rotation periods centered on 24h within [12h, 36h].
    pub fn standard() -> Self {
        let bits = 256;
        let mask_size = 32.min(bits);
        Self {
            bits,
            mask_size,
            mask_bits: mask_size / 3,
            ts_target: 60 * 60 * 24,
            ts_sigma: 60 * 60 * 4,
            ts_min: 60 * 60 * 12,
            ts_max: 60 * 60 * 36,
        }
    }

    /// Width in hex characters of a serialized scalar or x coordinate.
    pub fn scalar_hex_width(&self) -> usize {
        (((self.bits + 7) / 8) * 2) as usize
    }

    /// Width in hex characters of a serialized slot mask or target.
    pub fn mask_hex_width(&self) -> usize {
        (((self.mask_size + 7) / 8) * 2) as usize
    }

    /// All-ones mask covering `mask_size` bits.
    pub fn mask_all(&self) -> u32 {
        (((1u64 << self.mask_size) - 1) & 0xFFFF_FFFF) as u32
    }

    /// Top `mask_size` bits of the x coordinate of a compressed point,
    /// i.e. `x >> (bits - mask_size)`.
    pub fn slot_prefix(&self, compressed: &[u8; 33]) -> u32 {
        let top = u32::from_be_bytes([compressed[1], compressed[2], compressed[3], compressed[4]]);
        top >> (32 - self.mask_size)
    }
}

impl Default for CryptoContext {
    fn default() -> Self {
        Self::standard()
    }
}

/// Current wall-clock time as a 32-bit epoch.
pub fn now_epoch() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as u32
}
