//! Onion request wrapping
//!
//! A request travels through a chain of relays as nested hybrid-encrypted
//! envelopes: each layer is AES-CTR under a key derived by ECDH between a
//! fresh session key and the relay's published point, so a relay learns only
//! the next hop. The outermost body is attested by a NAK signature.

use std::collections::HashMap;

use aes::Aes128;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use k256::ecdsa::signature::Verifier;
use k256::ecdsa::{Signature, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

use ciphrtxt_core::{
    compress_point_hex, decompress_point, decompress_point_hex, g_mul, random_nonzero_scalar,
    NonZeroScalar, ProjectivePoint,
};

use crate::nak::{Nak, NakError};

type Aes128Ctr = Ctr128BE<Aes128>;

#[derive(Error, Debug)]
pub enum OnionError {
    #[error("Onion host key not known")]
    MissingHostKey,

    #[error("Malformed onion payload")]
    Malformed,

    #[error("Reply signature verification failed")]
    VerifyFailed,

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("NAK error: {0}")]
    Nak(#[from] NakError),
}

/// A relay node reachable for onion routing.
#[derive(Debug, Clone, PartialEq)]
pub struct OnionHost {
    pub host: String,
    pub port: u16,
    /// Published node point, from `GET /api/status/`.
    pub pubkey: Option<ProjectivePoint>,
}

impl OnionHost {
    pub const DEFAULT_PORT: u16 = 7754;

    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            pubkey: None,
        }
    }

    pub fn with_pubkey(host: impl Into<String>, port: u16, pubkey: ProjectivePoint) -> Self {
        Self {
            host: host.into(),
            port,
            pubkey: Some(pubkey),
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}/", self.host, self.port)
    }
}

/// Innermost request payload presented to the destination relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InnerRequest {
    pub local: bool,
    pub url: String,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    pub replykey: String,
}

/// JSON form of a wrapped layer, as seen by the relay that peels it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnionEnvelope {
    pub local: bool,
    pub host: String,
    pub port: u16,
    /// Session pubkey for this layer's ECDH, compressed hex.
    pub pubkey: String,
    /// base64 of `iv || ciphertext`.
    pub body: String,
}

/// One encrypted layer with its body still in raw bytes.
#[derive(Debug, Clone)]
pub struct WrappedLayer {
    pub host: String,
    pub port: u16,
    pub session_pubkey_hex: String,
    /// `iv_be16 || ciphertext`.
    pub body: Vec<u8>,
}

impl WrappedLayer {
    /// Nested JSON form used when this layer is wrapped inside another.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, OnionError> {
        Ok(serde_json::to_vec(&OnionEnvelope {
            local: false,
            host: self.host.clone(),
            port: self.port,
            pubkey: self.session_pubkey_hex.clone(),
            body: BASE64.encode(&self.body),
        })?)
    }
}

/// AES-128 key for a layer: leading bytes of SHA-256 over the ASCII hex of
/// the compressed ECDH point.
fn layer_key(ecdh: &ProjectivePoint) -> [u8; 16] {
    let digest: [u8; 32] = Sha256::digest(compress_point_hex(ecdh).as_bytes()).into();
    let mut key = [0u8; 16];
    key.copy_from_slice(&digest[..16]);
    key
}

fn apply_ctr(key: &[u8; 16], iv: &[u8; 16], data: &mut [u8]) {
    let mut cipher = Aes128Ctr::new(key.into(), iv.into());
    cipher.apply_keystream(data);
}

/// Encrypt `plaintext` for one relay under a fresh session key.
pub fn wrap_layer(node: &OnionHost, plaintext: &[u8]) -> Result<WrappedLayer, OnionError> {
    let node_key = node.pubkey.ok_or(OnionError::MissingHostKey)?;
    let session_scalar = *random_nonzero_scalar(&mut OsRng).as_ref();
    let session_pub = g_mul(&session_scalar);
    let ecdh = node_key * session_scalar;

    let mut iv = [0u8; 16];
    OsRng.fill_bytes(&mut iv);
    let mut ciphertext = plaintext.to_vec();
    apply_ctr(&layer_key(&ecdh), &iv, &mut ciphertext);

    let mut body = Vec::with_capacity(16 + ciphertext.len());
    body.extend_from_slice(&iv);
    body.extend_from_slice(&ciphertext);
    Ok(WrappedLayer {
        host: node.host.clone(),
        port: node.port,
        session_pubkey_hex: compress_point_hex(&session_pub),
        body,
    })
}

/// Decrypt one layer given the relay's private scalar and the layer's
/// session pubkey. The relay-side inverse of [`wrap_layer`]; clients use it
/// only in tests and tooling.
pub fn peel_layer(
    node_priv: &NonZeroScalar,
    session_pubkey: &ProjectivePoint,
    body: &[u8],
) -> Result<Vec<u8>, OnionError> {
    if body.len() < 16 {
        return Err(OnionError::Malformed);
    }
    let ecdh = *session_pubkey * *node_priv.as_ref();
    let mut iv = [0u8; 16];
    iv.copy_from_slice(&body[..16]);
    let mut plaintext = body[16..].to_vec();
    apply_ctr(&layer_key(&ecdh), &iv, &mut plaintext);
    Ok(plaintext)
}

/// A fully built onion request, ready to POST. Immutable once built; the
/// one-shot reply key decrypts the response.
pub struct OnionRequest {
    /// `http://{entry}/onion/{session_pubkey_hex}`.
    pub url: String,
    /// base64 transport body: `nak_pubkey || nak_sig || outer_body`.
    pub body: String,
    reply_priv: NonZeroScalar,
    target_key: ProjectivePoint,
}

impl OnionRequest {
    /// Verify and decrypt the destination's reply:
    /// `base64(sig_r || sig_s || iv || ciphertext)` signed by the target.
    pub fn decrypt_reply(&self, reply_b64: &str) -> Result<Vec<u8>, OnionError> {
        let raw = BASE64
            .decode(reply_b64.trim().as_bytes())
            .map_err(|_| OnionError::Malformed)?;
        if raw.len() < 80 {
            return Err(OnionError::Malformed);
        }
        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        r.copy_from_slice(&raw[..32]);
        s.copy_from_slice(&raw[32..64]);
        let verifying = VerifyingKey::from_affine(self.target_key.to_affine())
            .map_err(|_| OnionError::VerifyFailed)?;
        let signature =
            Signature::from_scalars(r, s).map_err(|_| OnionError::VerifyFailed)?;
        verifying
            .verify(&raw[64..], &signature)
            .map_err(|_| OnionError::VerifyFailed)?;

        let ecdh = self.target_key * *self.reply_priv.as_ref();
        let mut iv = [0u8; 16];
        iv.copy_from_slice(&raw[64..80]);
        let mut plaintext = raw[80..].to_vec();
        apply_ctr(&layer_key(&ecdh), &iv, &mut plaintext);
        Ok(plaintext)
    }
}

/// Builds an onion request by wrapping the inner payload for the target and
/// then for each hop from the exit inward, entry hop last.
pub struct OnionRequestBuilder<'a> {
    target: &'a OnionHost,
    hops: Vec<&'a OnionHost>,
    headers: Option<HashMap<String, String>>,
}

impl<'a> OnionRequestBuilder<'a> {
    pub fn new(target: &'a OnionHost) -> Self {
        Self {
            target,
            hops: Vec::new(),
            headers: None,
        }
    }

    /// Append a relay hop; hops are given entry-first.
    pub fn hop(mut self, hop: &'a OnionHost) -> Self {
        self.hops.push(hop);
        self
    }

    pub fn hops(mut self, hops: impl IntoIterator<Item = &'a OnionHost>) -> Self {
        self.hops.extend(hops);
        self
    }

    pub fn header(mut self, key: &str, value: &str) -> Self {
        self.headers
            .get_or_insert_with(HashMap::new)
            .insert(key.to_string(), value.to_string());
        self
    }

    /// Build a GET request through the chain.
    pub fn get(self, path: &str, nak: &Nak) -> Result<OnionRequest, OnionError> {
        self.build(path, "GET", None, nak)
    }

    /// Build a POST request through the chain.
    pub fn post(self, path: &str, body: &str, nak: &Nak) -> Result<OnionRequest, OnionError> {
        self.build(path, "POST", Some(body.to_string()), nak)
    }

    fn build(
        self,
        path: &str,
        action: &str,
        body: Option<String>,
        nak: &Nak,
    ) -> Result<OnionRequest, OnionError> {
        let target_key = self.target.pubkey.ok_or(OnionError::MissingHostKey)?;
        let reply_priv = random_nonzero_scalar(&mut OsRng);
        let reply_pub = g_mul(reply_priv.as_ref());

        let inner = InnerRequest {
            local: true,
            url: path.to_string(),
            action: action.to_string(),
            headers: self.headers,
            body,
            replykey: compress_point_hex(&reply_pub),
        };

        let mut layer = wrap_layer(self.target, &serde_json::to_vec(&inner)?)?;
        for hop in self.hops.iter().rev() {
            let nested = layer.to_json_bytes()?;
            layer = wrap_layer(hop, &nested)?;
        }
        debug!(
            target_host = %self.target.host,
            hops = self.hops.len(),
            "wrapped onion request"
        );

        let nak_sig = nak.sign(&layer.body)?;
        let mut transport = Vec::with_capacity(33 + 64 + layer.body.len());
        transport.extend_from_slice(&nak.pubkey_bytes());
        transport.extend_from_slice(&nak_sig.r);
        transport.extend_from_slice(&nak_sig.s);
        transport.extend_from_slice(&layer.body);

        Ok(OnionRequest {
            url: format!(
                "http://{}:{}/onion/{}",
                layer.host, layer.port, layer.session_pubkey_hex
            ),
            body: BASE64.encode(transport),
            reply_priv,
            target_key,
        })
    }
}

/// Parse the transport body of an onion POST back into its parts:
/// `(nak_pubkey_hex, nak_sig, outer_body)`. Used by tests and relay tools.
pub fn split_transport_body(body_b64: &str) -> Result<(String, [u8; 64], Vec<u8>), OnionError> {
    let raw = BASE64
        .decode(body_b64.as_bytes())
        .map_err(|_| OnionError::Malformed)?;
    if raw.len() < 97 {
        return Err(OnionError::Malformed);
    }
    decompress_point(&raw[..33]).map_err(|_| OnionError::Malformed)?;
    let mut sig = [0u8; 64];
    sig.copy_from_slice(&raw[33..97]);
    Ok((hex::encode(&raw[..33]), sig, raw[97..].to_vec()))
}
