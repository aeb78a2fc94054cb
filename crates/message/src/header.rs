//! Message headers and wire framing
//!
//! v1 is colon-delimited ASCII with hex fields; v2 is a fixed 192-byte
//! binary header carried as 256 base64 characters. Header points are kept in
//! compressed form until a caller explicitly asks for the decoded points, so
//! cache filtering does not pay EC decompression for headers that miss.

use std::cmp::Ordering;
use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use ciphrtxt_core::{compress_point, decompress_point, EcError, ProjectivePoint};
use ciphrtxt_keys::PrivateKey;

use crate::envelope::MessageError;

/// v1 wire magic, protocol version 1.0 in fixed point.
pub const V1_MAGIC: &str = "M0100";

/// v1 ASCII header length: magic, time, expire, and three compressed points.
pub const V1_HEADER_LEN: usize = 5 + 1 + 8 + 1 + 8 + 1 + 66 + 1 + 66 + 1 + 66;

/// v2 ciphertext block size in raw bytes (256 base64 characters).
pub const V2_BLOCK_SIZE: usize = 192;

/// v2 short header (identifies the message): raw bytes and base64 chars.
pub const V2_SHORT_HEADER_LEN: usize = 123;
pub const V2_SHORT_HEADER_B64_LEN: usize = 164;

/// v2 signature + nonce block: raw bytes and base64 chars.
pub const V2_SIGNONCE_LEN: usize = 69;
pub const V2_SIGNONCE_B64_LEN: usize = 92;

/// v2 long header (short header + signature + nonce) in base64 chars.
pub const V2_HEADER_B64_LEN: usize = V2_SHORT_HEADER_B64_LEN + V2_SIGNONCE_B64_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    V1,
    V2,
}

/// ECDSA signature as raw big-endian component bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SignatureBytes {
    pub r: [u8; 32],
    pub s: [u8; 32],
}

/// SEC1 compressed point kept undecoded. Ordering is byte-lexicographic,
/// which the header cache uses as its tie-break.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CompressedPoint([u8; 33]);

impl CompressedPoint {
    pub fn from_point(point: &ProjectivePoint) -> Self {
        Self(compress_point(point))
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, MessageError> {
        if bytes.len() != 33 || (bytes[0] != 0x02 && bytes[0] != 0x03) {
            return Err(MessageError::Malformed);
        }
        let mut out = [0u8; 33];
        out.copy_from_slice(bytes);
        Ok(Self(out))
    }

    pub fn from_hex(text: &str) -> Result<Self, MessageError> {
        let bytes = hex::decode(text).map_err(|_| MessageError::Malformed)?;
        Self::from_slice(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 33] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Decode to a curve point. Fails if the x coordinate is off-curve.
    pub fn decompress(&self) -> Result<ProjectivePoint, EcError> {
        decompress_point(&self.0)
    }
}

impl fmt::Debug for CompressedPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CompressedPoint({})", self.to_hex())
    }
}

/// Fully decoded header points, produced on demand from the compressed form.
#[derive(Debug, Clone, Copy)]
pub struct DecodedPoints {
    pub i: ProjectivePoint,
    pub j: ProjectivePoint,
    pub k: ProjectivePoint,
}

/// Routing header of a message: timestamps, the three ephemeral points, and
/// (when carried on the wire) the signature, block count, and PoW nonce.
#[derive(Debug, Clone)]
pub struct MessageHeader {
    pub version: Version,
    pub time: u32,
    pub expire: u32,
    pub i: CompressedPoint,
    pub j: CompressedPoint,
    pub k: CompressedPoint,
    /// Absent only on bare v1 headers, which do not carry the signature.
    pub sig: Option<SignatureBytes>,
    /// Ciphertext block count (v2).
    pub blocklen: u32,
    /// 40-bit proof-of-work witness (v2).
    pub nonce: u64,
}

impl PartialEq for MessageHeader {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time
            && self.expire == other.expire
            && self.i == other.i
            && self.j == other.j
            && self.k == other.k
    }
}

impl MessageHeader {
    /// v1 ASCII header string (the signed "extra" bytes for v1 messages).
    pub(crate) fn v1_header_string(&self) -> String {
        format!(
            "{}:{:08X}:{:08X}:{}:{}:{}",
            V1_MAGIC,
            self.time,
            self.expire,
            self.i.to_hex(),
            self.j.to_hex(),
            self.k.to_hex()
        )
    }

    /// v2 short header: the 123 raw bytes identifying the message.
    pub(crate) fn short_header_bytes(&self) -> [u8; V2_SHORT_HEADER_LEN] {
        let mut raw = [0u8; V2_SHORT_HEADER_LEN];
        raw[0] = b'M';
        raw[1] = 0x02;
        raw[4..8].copy_from_slice(&self.time.to_be_bytes());
        raw[8..12].copy_from_slice(&self.expire.to_be_bytes());
        raw[12..45].copy_from_slice(self.i.as_bytes());
        raw[45..78].copy_from_slice(self.j.as_bytes());
        raw[78..111].copy_from_slice(self.k.as_bytes());
        raw[111..115].copy_from_slice(&self.blocklen.to_be_bytes());
        raw
    }

    pub(crate) fn short_header_b64(&self) -> String {
        BASE64.encode(self.short_header_bytes())
    }

    /// v2 signature + nonce block: `r || s || nonce_be5`.
    pub(crate) fn signonce_bytes(&self) -> [u8; V2_SIGNONCE_LEN] {
        let sig = self.sig.unwrap_or_default();
        let mut raw = [0u8; V2_SIGNONCE_LEN];
        raw[..32].copy_from_slice(&sig.r);
        raw[32..64].copy_from_slice(&sig.s);
        raw[64..].copy_from_slice(&self.nonce.to_be_bytes()[3..]);
        raw
    }

    /// Wire form of the header alone: 224 ASCII chars (v1, unsigned) or 256
    /// base64 chars (v2, including signature and nonce).
    pub fn serialize(&self) -> String {
        match self.version {
            Version::V1 => self.v1_header_string(),
            Version::V2 => {
                format!("{}{}", self.short_header_b64(), BASE64.encode(self.signonce_bytes()))
            }
        }
    }

    /// Parse a header in either wire form. v1 input may be a full message
    /// string; only the leading header portion is read.
    pub fn deserialize(text: &str) -> Result<Self, MessageError> {
        if text.starts_with(V1_MAGIC) {
            let head = text.get(..V1_HEADER_LEN).ok_or(MessageError::Malformed)?;
            Self::parse_v1_header(head)
        } else {
            let head = text.get(..V2_HEADER_B64_LEN).ok_or(MessageError::Malformed)?;
            Self::parse_v2_header(head)
        }
    }

    pub(crate) fn parse_v1_header(head: &str) -> Result<Self, MessageError> {
        let fields: Vec<&str> = head.split(':').collect();
        if fields.len() != 6 || fields[0] != V1_MAGIC {
            return Err(MessageError::Malformed);
        }
        if fields[1].len() != 8 || fields[2].len() != 8 {
            return Err(MessageError::Malformed);
        }
        let time = u32::from_str_radix(fields[1], 16).map_err(|_| MessageError::Malformed)?;
        let expire = u32::from_str_radix(fields[2], 16).map_err(|_| MessageError::Malformed)?;
        Ok(Self {
            version: Version::V1,
            time,
            expire,
            i: CompressedPoint::from_hex(fields[3])?,
            j: CompressedPoint::from_hex(fields[4])?,
            k: CompressedPoint::from_hex(fields[5])?,
            sig: None,
            blocklen: 0,
            nonce: 0,
        })
    }

    pub(crate) fn parse_v2_raw(raw: &[u8]) -> Result<Self, MessageError> {
        if raw.len() != V2_SHORT_HEADER_LEN + V2_SIGNONCE_LEN {
            return Err(MessageError::Malformed);
        }
        if raw[0] != b'M' || raw[1] != 0x02 || raw[2] != 0x00 || raw[3] != 0x00 {
            return Err(MessageError::Malformed);
        }
        let time = u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]);
        let expire = u32::from_be_bytes([raw[8], raw[9], raw[10], raw[11]]);
        let i = CompressedPoint::from_slice(&raw[12..45])?;
        let j = CompressedPoint::from_slice(&raw[45..78])?;
        let k = CompressedPoint::from_slice(&raw[78..111])?;
        let blocklen = u32::from_be_bytes([raw[111], raw[112], raw[113], raw[114]]);
        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        r.copy_from_slice(&raw[123..155]);
        s.copy_from_slice(&raw[155..187]);
        let mut nonce_bytes = [0u8; 8];
        nonce_bytes[3..].copy_from_slice(&raw[187..192]);
        Ok(Self {
            version: Version::V2,
            time,
            expire,
            i,
            j,
            k,
            sig: Some(SignatureBytes { r, s }),
            blocklen,
            nonce: u64::from_be_bytes(nonce_bytes),
        })
    }

    fn parse_v2_header(head: &str) -> Result<Self, MessageError> {
        let raw = BASE64
            .decode(head.as_bytes())
            .map_err(|_| MessageError::Malformed)?;
        Self::parse_v2_raw(&raw)
    }

    /// Decode the three header points. The explicit "full" form; callers
    /// that only route on the slot prefix never need it.
    pub fn decode_points(&self) -> Result<DecodedPoints, MessageError> {
        Ok(DecodedPoints {
            i: self.i.decompress()?,
            j: self.j.decompress()?,
            k: self.k.decompress()?,
        })
    }

    /// Address check: the slot prefix of `I` must land in the recipient's
    /// bucket and `I * p(time)` must equal `J`.
    pub fn is_for(&self, privkey: &PrivateKey) -> bool {
        let ctx = privkey.context();
        if !privkey.addr().matches(ctx.slot_prefix(self.i.as_bytes())) {
            return false;
        }
        let (Ok(i), Ok(j)) = (self.i.decompress(), self.j.decompress()) else {
            return false;
        };
        i * privkey.current_scalar_at(self.time as i64) == j
    }

    /// Cache ordering: `(time, compressed I)`, compared ascending.
    pub fn cmp_order(&self, other: &Self) -> Ordering {
        (self.time, &self.i).cmp(&(other.time, &other.i))
    }
}

impl fmt::Display for MessageHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.serialize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ciphrtxt_core::g_mul;
    use k256::Scalar;

    fn test_point(n: u64) -> CompressedPoint {
        CompressedPoint::from_point(&g_mul(&Scalar::from(n)))
    }

    fn test_header(version: Version, time: u32) -> MessageHeader {
        MessageHeader {
            version,
            time,
            expire: time + 3600,
            i: test_point(5),
            j: test_point(7),
            k: test_point(11),
            sig: Some(SignatureBytes {
                r: [0xAA; 32],
                s: [0xBB; 32],
            }),
            blocklen: 2,
            nonce: 0x12_3456_789A,
        }
    }

    #[test]
    fn test_v1_header_roundtrip() {
        let header = test_header(Version::V1, 0x5000_0000);
        let text = header.serialize();
        assert_eq!(text.len(), V1_HEADER_LEN);
        assert!(text.starts_with("M0100:50000000:"));
        let parsed = MessageHeader::deserialize(&text).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.serialize(), text);
    }

    #[test]
    fn test_v2_header_roundtrip() {
        let header = test_header(Version::V2, 0x5000_0000);
        let text = header.serialize();
        assert_eq!(text.len(), V2_HEADER_B64_LEN);
        let parsed = MessageHeader::deserialize(&text).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.sig, header.sig);
        assert_eq!(parsed.blocklen, 2);
        assert_eq!(parsed.nonce, 0x12_3456_789A);
        assert_eq!(parsed.serialize(), text);
    }

    #[test]
    fn test_v2_short_header_layout() {
        let header = test_header(Version::V2, 0x01020304);
        let raw = header.short_header_bytes();
        assert_eq!(raw[0], b'M');
        assert_eq!(&raw[1..4], &[0x02, 0x00, 0x00]);
        assert_eq!(&raw[4..8], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&raw[12..45], header.i.as_bytes());
        assert_eq!(&raw[111..115], &[0, 0, 0, 2]);
        assert_eq!(&raw[115..123], &[0u8; 8]);
        assert_eq!(header.short_header_b64().len(), V2_SHORT_HEADER_B64_LEN);
    }

    #[test]
    fn test_deserialize_rejects_garbage() {
        assert!(MessageHeader::deserialize("").is_err());
        assert!(MessageHeader::deserialize("M0100:zzzz").is_err());
        assert!(MessageHeader::deserialize(&"!".repeat(V2_HEADER_B64_LEN)).is_err());
        // Valid base64, wrong magic.
        let bogus = BASE64.encode([0u8; 192]);
        assert!(MessageHeader::deserialize(&bogus).is_err());
    }

    #[test]
    fn test_deserialize_rejects_bad_point_prefix() {
        let header = test_header(Version::V1, 100);
        let text = header.serialize().replace(":02", ":04").replace(":03", ":04");
        assert!(MessageHeader::deserialize(&text).is_err());
    }

    #[test]
    fn test_ordering_by_time_then_point() {
        let a = test_header(Version::V2, 100);
        let b = test_header(Version::V2, 200);
        assert_eq!(a.cmp_order(&b), Ordering::Less);

        let mut c = test_header(Version::V2, 100);
        c.i = test_point(13);
        let expected = a.i.as_bytes().cmp(c.i.as_bytes());
        assert_eq!(a.cmp_order(&c), expected);
    }

    #[test]
    fn test_equality_ignores_sig_and_nonce() {
        let a = test_header(Version::V2, 100);
        let mut b = a.clone();
        b.sig = None;
        b.nonce = 0;
        assert_eq!(a, b);

        let mut c = a.clone();
        c.expire += 1;
        assert_ne!(a, c);
    }
}
