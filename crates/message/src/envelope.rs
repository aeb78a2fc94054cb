//! Message envelope
//!
//! Builds and opens the two wire formats. The encoder mines an ephemeral
//! point into the recipient's slot, derives the AES-CTR key from an ECDH
//! shared point, signs ciphertext plus header with a key derived from the
//! same shared point, and (v2) attaches a hashcash nonce over the signed
//! header.

use aes::Aes128;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use k256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use k256::ecdsa::{Signature, SigningKey};
use sha2::{Digest, Sha256};
use thiserror::Error;

use ciphrtxt_core::{
    compress_point, compress_point_hex, g_mul, hash_to_scalar, leading_zero_bits, now_epoch,
    random_scalar, scalar_from_hex, scalar_from_repr, scalar_to_hex, CryptoContext, EcError,
    ProjectivePoint, Scalar,
};
use ciphrtxt_keys::{PrivateKey, PublicKey};

use crate::header::{
    CompressedPoint, MessageHeader, SignatureBytes, Version, V1_HEADER_LEN, V1_MAGIC,
    V2_BLOCK_SIZE, V2_HEADER_B64_LEN,
};
use crate::mining::{mine_pow, mine_slot, CancelToken, MiningEvent, ProgressFn};

type Aes128Ctr = Ctr128BE<Aes128>;

/// Default message lifetime: 7 days.
pub const DEFAULT_TTL: u32 = 7 * 24 * 60 * 60;

/// Default v2 proof-of-work difficulty in leading zero bits.
pub const DEFAULT_POW_BITS: u32 = 16;

/// Offset of the plaintext within a v2 stuffed block: 32-byte ephemeral
/// scalar plus 8-byte length.
const V2_STUFF_PREFIX: usize = 40;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("Message of zero length")]
    EmptyPlaintext,

    #[error("Sender private key required")]
    SenderRequired,

    #[error("Malformed message")]
    Malformed,

    #[error("Signing failed")]
    Signing,

    #[error("Mining aborted")]
    Aborted,

    #[error("Proof-of-work search exhausted")]
    PowExhausted,

    #[error("No auxiliary key available")]
    MissingAltKey,
}

impl From<EcError> for MessageError {
    fn from(_: EcError) -> Self {
        MessageError::Malformed
    }
}

pub type Result<T> = std::result::Result<T, MessageError>;

/// A single-shot message: header, ciphertext, and (after a successful
/// encode or decode) the client-side plaintext and auxiliary values.
#[derive(Clone)]
pub struct Message {
    pub header: MessageHeader,
    pub ctxt: Vec<u8>,
    s: Option<Scalar>,
    ptxt: Option<Vec<u8>>,
    h: Option<Scalar>,
    alt_k: Option<ProjectivePoint>,
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.header == other.header && self.ctxt == other.ctxt
    }
}

impl Message {
    /// Plaintext recovered by decode (or retained from encode).
    pub fn plaintext(&self) -> Option<&[u8]> {
        self.ptxt.as_deref()
    }

    /// Ephemeral scalar `s` with `I = s * G`.
    pub fn ephemeral_scalar(&self) -> Option<Scalar> {
        self.s
    }

    /// Content digest `h` used for sender binding.
    pub fn digest_scalar(&self) -> Option<Scalar> {
        self.h
    }

    /// Auxiliary point `P*h` (or `Q*h` for impersonated messages) that lets
    /// the sender decode their own sent message.
    pub fn alt_key(&self) -> Option<&ProjectivePoint> {
        self.alt_k.as_ref()
    }

    /// Wire form: colon-delimited ASCII for v1, base64 header plus base64
    /// ciphertext blocks for v2.
    pub fn serialize(&self) -> String {
        match self.header.version {
            Version::V1 => {
                let sig = self.header.sig.unwrap_or_default();
                format!(
                    "{}:{}:{}:{}",
                    self.header.v1_header_string(),
                    hex::encode(sig.r),
                    hex::encode(sig.s),
                    BASE64.encode(&self.ctxt)
                )
            }
            Version::V2 => {
                let mut out = self.header.serialize();
                for block in self.ctxt.chunks(V2_BLOCK_SIZE) {
                    out.push_str(&BASE64.encode(block));
                }
                out
            }
        }
    }

    pub fn deserialize(text: &str) -> Result<Self> {
        if text.starts_with(V1_MAGIC) {
            Self::parse_v1(text)
        } else {
            Self::parse_v2(text)
        }
    }

    fn parse_v1(text: &str) -> Result<Self> {
        let fields: Vec<&str> = text.split(':').collect();
        if fields.len() != 9 {
            return Err(MessageError::Malformed);
        }
        let head = text.get(..V1_HEADER_LEN).ok_or(MessageError::Malformed)?;
        let mut header = MessageHeader::parse_v1_header(head)?;
        if fields[6].len() != 64 || fields[7].len() != 64 {
            return Err(MessageError::Malformed);
        }
        let r: [u8; 32] = hex::decode(fields[6])
            .map_err(|_| MessageError::Malformed)?
            .try_into()
            .map_err(|_| MessageError::Malformed)?;
        let s: [u8; 32] = hex::decode(fields[7])
            .map_err(|_| MessageError::Malformed)?
            .try_into()
            .map_err(|_| MessageError::Malformed)?;
        header.sig = Some(SignatureBytes { r, s });
        let ctxt = BASE64
            .decode(fields[8].as_bytes())
            .map_err(|_| MessageError::Malformed)?;
        Ok(Self {
            header,
            ctxt,
            s: None,
            ptxt: None,
            h: None,
            alt_k: None,
        })
    }

    fn parse_v2(text: &str) -> Result<Self> {
        // A v2 message is the 256-char header plus one 256-char chunk per
        // ciphertext block; anything else is malformed.
        if text.len() % 256 != 0 || text.len() < 2 * V2_HEADER_B64_LEN {
            return Err(MessageError::Malformed);
        }
        let raw = BASE64
            .decode(text.as_bytes())
            .map_err(|_| MessageError::Malformed)?;
        let header = MessageHeader::parse_v2_raw(&raw[..192])?;
        let ctxt = raw[192..].to_vec();
        if ctxt.len() % V2_BLOCK_SIZE != 0
            || header.blocklen as usize != ctxt.len() / V2_BLOCK_SIZE
        {
            return Err(MessageError::Malformed);
        }
        Ok(Self {
            header,
            ctxt,
            s: None,
            ptxt: None,
            h: None,
            alt_k: None,
        })
    }

    /// Decode addressed to us: address check, signature verify, decrypt,
    /// and consistency checks. Returns false on any failure with no partial
    /// plaintext exposed.
    pub fn decode(&mut self, privkey: &PrivateKey) -> bool {
        if !self.header.is_for(privkey) {
            return false;
        }
        let Ok(k_point) = self.header.k.decompress() else {
            return false;
        };
        let dh = k_point * privkey.current_scalar_at(self.header.time as i64);
        self.decode_with_dh(&dh)
    }

    /// Decode a message we sent, using the auxiliary key. The passed key is
    /// authoritative; the stored one (populated by encode) is the fallback.
    pub fn decode_sent(
        &mut self,
        privkey: &PrivateKey,
        alt_key: Option<&ProjectivePoint>,
    ) -> Result<bool> {
        let alt = match alt_key {
            Some(point) => *point,
            None => self.alt_k.ok_or(MessageError::MissingAltKey)?,
        };
        let dh = alt * privkey.current_scalar_at(self.header.time as i64);
        let ok = self.decode_with_dh(&dh);
        if ok {
            self.alt_k = Some(alt);
        }
        Ok(ok)
    }

    /// Sender authentication: `K == h * pub.P(time)`. Requires a prior
    /// successful decode (or local encode). Anonymous messages fail against
    /// every key.
    pub fn is_from(&self, pubkey: &PublicKey) -> bool {
        let Some(h) = self.h else {
            return false;
        };
        let Ok(k_point) = self.header.k.decompress() else {
            return false;
        };
        k_point == pubkey.current_point_at(self.header.time as i64) * h
    }

    /// Check the v2 hashcash witness against a difficulty target.
    pub fn verify_pow(&self, nbits: u32) -> bool {
        if self.header.version != Version::V2 {
            return false;
        }
        let mut hasher = Sha256::new();
        hasher.update(self.header.short_header_b64().as_bytes());
        hasher.update(BASE64.encode(self.header.signonce_bytes()).as_bytes());
        leading_zero_bits(&hasher.finalize()) >= nbits
    }

    fn signed_bytes(&self) -> Vec<u8> {
        match self.header.version {
            Version::V1 => self.header.v1_header_string().into_bytes(),
            Version::V2 => self.header.short_header_b64().into_bytes(),
        }
    }

    fn decode_with_dh(&mut self, dh: &ProjectivePoint) -> bool {
        let Some(sig) = self.header.sig else {
            return false;
        };
        // The signing key is derived from the shared point, so a valid
        // signature proves the ciphertext and header were produced by
        // someone holding the ECDH secret.
        let sigpriv = hash_to_scalar(compress_point_hex(dh).as_bytes());
        let Ok(signing) = SigningKey::from_bytes(&sigpriv.to_bytes()) else {
            return false;
        };
        let Ok(signature) = Signature::from_scalars(sig.r, sig.s) else {
            return false;
        };
        let digest = {
            let mut hasher = Sha256::new();
            hasher.update(&self.ctxt);
            hasher.update(self.signed_bytes());
            hasher.finalize()
        };
        if signing
            .verifying_key()
            .verify_prehash(&digest, &signature)
            .is_err()
        {
            return false;
        }

        let mut etxt = self.ctxt.clone();
        apply_ctr(
            &message_key(dh),
            &tail16(self.header.i.as_bytes()),
            &mut etxt,
        );

        let Ok(i_point) = self.header.i.decompress() else {
            return false;
        };
        match self.header.version {
            Version::V1 => self.finish_v1(&etxt, &i_point),
            Version::V2 => self.finish_v2(&etxt, &i_point),
        }
    }

    fn finish_v1(&mut self, etxt: &[u8], i_point: &ProjectivePoint) -> bool {
        let parts: Vec<&[u8]> = etxt.split(|&b| b == b':').collect();
        if parts.len() != 2 || parts[0].len() != 64 {
            return false;
        }
        let Ok(s_hex) = std::str::from_utf8(parts[0]) else {
            return false;
        };
        let Ok(s) = scalar_from_hex(s_hex) else {
            return false;
        };
        if g_mul(&s) != *i_point {
            return false;
        }
        let Ok(ptxt) = BASE64.decode(parts[1]) else {
            return false;
        };
        let mut digest_input = parts[0].to_vec();
        digest_input.extend_from_slice(&ptxt);
        self.h = Some(hash_to_scalar(&digest_input));
        self.s = Some(s);
        self.ptxt = Some(ptxt);
        true
    }

    fn finish_v2(&mut self, etxt: &[u8], i_point: &ProjectivePoint) -> bool {
        if etxt.len() < V2_STUFF_PREFIX {
            return false;
        }
        let mut repr = [0u8; 32];
        repr.copy_from_slice(&etxt[..32]);
        let Ok(s) = scalar_from_repr(repr) else {
            return false;
        };
        if g_mul(&s) != *i_point {
            return false;
        }
        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&etxt[32..40]);
        let len = u64::from_be_bytes(len_bytes) as usize;
        if V2_STUFF_PREFIX + len > etxt.len() {
            return false;
        }
        self.h = Some(hash_to_scalar(etxt));
        self.s = Some(s);
        self.ptxt = Some(etxt[V2_STUFF_PREFIX..V2_STUFF_PREFIX + len].to_vec());
        true
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("version", &self.header.version)
            .field("time", &self.header.time)
            .field("blocks", &self.ctxt.len())
            .finish()
    }
}

/// Builder for encoding a message to a recipient.
///
/// Defaults: v2 format, 7-day TTL, 16-bit proof of work, anonymous sender.
pub struct MessageEncoder<'a> {
    ctx: &'a CryptoContext,
    recipient: &'a PublicKey,
    sender: Option<&'a PrivateKey>,
    version: Version,
    ttl: u32,
    pow_bits: u32,
    progress: Option<ProgressFn<'a>>,
    cancel: Option<&'a CancelToken>,
}

impl<'a> MessageEncoder<'a> {
    pub fn new(ctx: &'a CryptoContext, recipient: &'a PublicKey) -> Self {
        Self {
            ctx,
            recipient,
            sender: None,
            version: Version::V2,
            ttl: DEFAULT_TTL,
            pow_bits: DEFAULT_POW_BITS,
            progress: None,
            cancel: None,
        }
    }

    /// Authenticate as this sender; without one the message is anonymous.
    pub fn sender(mut self, sender: &'a PrivateKey) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    pub fn ttl(mut self, ttl: u32) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn pow_bits(mut self, nbits: u32) -> Self {
        self.pow_bits = nbits;
        self
    }

    pub fn progress(mut self, callback: impl FnMut(&MiningEvent) + 'a) -> Self {
        self.progress = Some(Box::new(callback));
        self
    }

    pub fn cancel_token(mut self, token: &'a CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Encode for the recipient, mining the ephemeral point into the
    /// recipient's slot.
    pub fn encode(self, ptxt: &[u8]) -> Result<Message> {
        self.encode_inner(ptxt, false)
    }

    /// Impersonate encoding: mined into the *sender's* slot and keyed so the
    /// result is indistinguishable from a message the sender addressed to
    /// themselves. Requires a sender key.
    pub fn encode_impersonate(self, ptxt: &[u8]) -> Result<Message> {
        self.encode_inner(ptxt, true)
    }

    fn encode_inner(mut self, ptxt: &[u8], impersonate: bool) -> Result<Message> {
        if ptxt.is_empty() {
            return Err(MessageError::EmptyPlaintext);
        }
        let time = now_epoch();
        let expire = time.saturating_add(self.ttl);
        let pr = self.recipient.current_point_at(time as i64);

        // q is the sender's rotating scalar, or random for anonymous mail.
        // Impersonated messages are mined against the sender's own slot and
        // bind J to the sender's rotating point.
        let (q, j_base, mine_addr) = if impersonate {
            let sender = self.sender.ok_or(MessageError::SenderRequired)?;
            (
                sender.current_scalar_at(time as i64),
                sender.public().current_point_at(time as i64),
                sender.addr(),
            )
        } else {
            let q = match self.sender {
                Some(sender) => sender.current_scalar_at(time as i64),
                None => random_scalar(&mut rand::rngs::OsRng),
            };
            (q, pr, self.recipient.addr())
        };

        let (s, _i_point, i_compressed) =
            mine_slot(self.ctx, mine_addr, &mut self.progress, self.cancel)?;
        let j = j_base * s;

        // Plaintext packaging and content digest.
        let (h, body) = match self.version {
            Version::V1 => {
                let s_hex = scalar_to_hex(&s);
                let mut digest_input = s_hex.clone().into_bytes();
                digest_input.extend_from_slice(ptxt);
                let h = hash_to_scalar(&digest_input);
                let mut body = s_hex.into_bytes();
                body.push(b':');
                body.extend_from_slice(BASE64.encode(ptxt).as_bytes());
                (h, body)
            }
            Version::V2 => {
                let mut stxt = s.to_bytes().to_vec();
                stxt.extend_from_slice(&(ptxt.len() as u64).to_be_bytes());
                stxt.extend_from_slice(ptxt);
                let pad_len = V2_BLOCK_SIZE - ((ptxt.len() + V2_STUFF_PREFIX) % V2_BLOCK_SIZE);
                stxt.resize(stxt.len() + pad_len, pad_len as u8);
                (hash_to_scalar(&stxt), stxt)
            }
        };

        let k = q * h;
        let k_point = if impersonate { pr * h } else { g_mul(&k) };
        let dh = pr * k;
        let alt_k = j_base * h;

        let mut ctxt = body;
        apply_ctr(&message_key(&dh), &tail16(&i_compressed), &mut ctxt);

        let mut header = MessageHeader {
            version: self.version,
            time,
            expire,
            i: CompressedPoint::from_slice(&i_compressed)?,
            j: CompressedPoint::from_point(&j),
            k: CompressedPoint::from_point(&k_point),
            sig: None,
            blocklen: match self.version {
                Version::V1 => 0,
                Version::V2 => (ctxt.len() / V2_BLOCK_SIZE) as u32,
            },
            nonce: 0,
        };

        let sigpriv = hash_to_scalar(compress_point_hex(&dh).as_bytes());
        let signing =
            SigningKey::from_bytes(&sigpriv.to_bytes()).map_err(|_| MessageError::Signing)?;
        let digest = {
            let mut hasher = Sha256::new();
            hasher.update(&ctxt);
            match self.version {
                Version::V1 => hasher.update(header.v1_header_string().as_bytes()),
                Version::V2 => hasher.update(header.short_header_b64().as_bytes()),
            }
            hasher.finalize()
        };
        let signature: Signature = signing
            .sign_prehash(&digest)
            .map_err(|_| MessageError::Signing)?;
        let sig_bytes = signature.to_bytes();
        let mut r = [0u8; 32];
        let mut s_bytes = [0u8; 32];
        r.copy_from_slice(&sig_bytes[..32]);
        s_bytes.copy_from_slice(&sig_bytes[32..]);
        let sig = SignatureBytes { r, s: s_bytes };
        header.sig = Some(sig);

        if self.version == Version::V2 {
            header.nonce = mine_pow(
                &header.short_header_b64(),
                &sig,
                self.pow_bits,
                &mut self.progress,
                self.cancel,
            )?;
        }

        Ok(Message {
            header,
            ctxt,
            s: Some(s),
            ptxt: Some(ptxt.to_vec()),
            h: Some(h),
            alt_k: Some(alt_k),
        })
    }
}

/// AES-128 key for a message: the last 16 bytes of the compressed ECDH
/// point.
fn message_key(dh: &ProjectivePoint) -> [u8; 16] {
    tail16(&compress_point(dh))
}

/// Last 16 bytes of a compressed point; the message IV comes from `I`.
fn tail16(compressed: &[u8; 33]) -> [u8; 16] {
    let mut out = [0u8; 16];
    out.copy_from_slice(&compressed[17..]);
    out
}

fn apply_ctr(key: &[u8; 16], iv: &[u8; 16], data: &mut [u8]) {
    let mut cipher = Aes128Ctr::new(key.into(), iv.into());
    cipher.apply_keystream(data);
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    fn ctx() -> CryptoContext {
        CryptoContext::standard()
    }

    fn quick_key(context: &CryptoContext) -> PrivateKey {
        PrivateKey::generate(context, 1, &mut OsRng)
    }

    #[test]
    fn test_v1_wire_roundtrip() {
        let context = ctx();
        let bob = quick_key(&context);
        let message = MessageEncoder::new(&context, bob.public())
            .version(Version::V1)
            .encode(b"hello v1")
            .unwrap();
        let text = message.serialize();
        assert!(text.starts_with("M0100:"));
        let parsed = Message::deserialize(&text).unwrap();
        assert_eq!(parsed, message);
        assert_eq!(parsed.serialize(), text);
    }

    #[test]
    fn test_v2_wire_roundtrip_framing() {
        let context = ctx();
        let bob = quick_key(&context);
        let message = MessageEncoder::new(&context, bob.public())
            .pow_bits(4)
            .encode(b"hello v2")
            .unwrap();
        let text = message.serialize();
        assert_eq!(text.len() % 256, 0);
        assert_eq!(
            text.len(),
            V2_HEADER_B64_LEN + 256 * message.header.blocklen as usize
        );
        let parsed = Message::deserialize(&text).unwrap();
        assert_eq!(parsed, message);
        assert_eq!(parsed.serialize(), text);
    }

    #[test]
    fn test_v2_block_count() {
        let context = ctx();
        let bob = quick_key(&context);
        // 152 bytes of plaintext fit exactly one 192-byte stuffed block.
        let one_block = MessageEncoder::new(&context, bob.public())
            .pow_bits(2)
            .encode(&[0x41u8; 152])
            .unwrap();
        assert_eq!(one_block.header.blocklen, 2); // full pad block appended
        let small = MessageEncoder::new(&context, bob.public())
            .pow_bits(2)
            .encode(&[0x42u8; 100])
            .unwrap();
        assert_eq!(small.header.blocklen, 1);
    }

    #[test]
    fn test_v2_rejects_bad_length() {
        let context = ctx();
        let bob = quick_key(&context);
        let message = MessageEncoder::new(&context, bob.public())
            .pow_bits(2)
            .encode(b"framing")
            .unwrap();
        let text = message.serialize();
        assert!(Message::deserialize(&text[..text.len() - 1]).is_err());
        assert!(Message::deserialize(&text[..V2_HEADER_B64_LEN]).is_err());

        // Inconsistent block count: drop a whole ciphertext block.
        let truncated = &text[..text.len() - 256];
        assert!(Message::deserialize(truncated).is_err());
    }

    #[test]
    fn test_empty_plaintext_rejected() {
        let context = ctx();
        let bob = quick_key(&context);
        assert_eq!(
            MessageEncoder::new(&context, bob.public()).encode(b""),
            Err(MessageError::EmptyPlaintext)
        );
    }

    #[test]
    fn test_impersonate_requires_sender() {
        let context = ctx();
        let bob = quick_key(&context);
        assert_eq!(
            MessageEncoder::new(&context, bob.public()).encode_impersonate(b"x"),
            Err(MessageError::SenderRequired)
        );
    }

    #[test]
    fn test_cancelled_encode_aborts() {
        let context = ctx();
        let bob = quick_key(&context);
        let token = CancelToken::new();
        token.cancel();
        let result = MessageEncoder::new(&context, bob.public())
            .cancel_token(&token)
            .encode(b"never");
        assert_eq!(result, Err(MessageError::Aborted));
    }

    #[test]
    fn test_decode_sent_requires_alt_key() {
        let context = ctx();
        let bob = quick_key(&context);
        let message = MessageEncoder::new(&context, bob.public())
            .version(Version::V1)
            .encode(b"audit")
            .unwrap();
        let mut stripped = Message::deserialize(&message.serialize()).unwrap();
        assert_eq!(
            stripped.decode_sent(&bob, None),
            Err(MessageError::MissingAltKey)
        );
    }
}
