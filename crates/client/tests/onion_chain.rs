//! Three-hop onion wrap exercised end to end: each relay key peels exactly
//! one layer, the innermost payload matches the original request, and the
//! destination's reply decrypts with the one-shot reply key.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use k256::ecdsa::signature::Signer;
use k256::ecdsa::{Signature, SigningKey};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

use ciphrtxt_client::{
    peel_layer, split_transport_body, InnerRequest, Nak, OnionEnvelope, OnionHost,
    OnionRequestBuilder,
};
use ciphrtxt_core::{
    compress_point_hex, decompress_point_hex, g_mul, random_nonzero_scalar, NonZeroScalar,
};

fn node(name: &str) -> (OnionHost, NonZeroScalar) {
    let privkey = random_nonzero_scalar(&mut OsRng);
    let point = g_mul(privkey.as_ref());
    (
        OnionHost::with_pubkey(name, OnionHost::DEFAULT_PORT, point),
        privkey,
    )
}

/// Peel one layer with a relay's private key and parse the nested envelope.
fn peel_envelope(privkey: &NonZeroScalar, pubkey_hex: &str, body: &[u8]) -> OnionEnvelope {
    let session = decompress_point_hex(pubkey_hex).unwrap();
    let plaintext = peel_layer(privkey, &session, body).unwrap();
    serde_json::from_slice(&plaintext).unwrap()
}

#[test]
fn three_hop_chain_peels_to_inner_request() {
    let (target, target_priv) = node("store.example");
    let (hop1, hop1_priv) = node("entry.example");
    let (hop2, hop2_priv) = node("middle.example");
    let (hop3, hop3_priv) = node("exit.example");

    let nak = Nak::generate(&mut OsRng);
    let request = OnionRequestBuilder::new(&target)
        .hop(&hop1)
        .hop(&hop2)
        .hop(&hop3)
        .header("Accept", "application/json")
        .get("api/header/list/since/0", &nak)
        .unwrap();

    // The POST lands on the entry hop, addressed by the outer session key.
    let prefix = format!("http://{}:{}/onion/", hop1.host, hop1.port);
    assert!(request.url.starts_with(&prefix));
    let outer_session_hex = request.url.rsplit('/').next().unwrap();

    // Transport body carries the NAK attestation over the outer layer.
    let (nak_pubkey_hex, nak_sig, outer_body) = split_transport_body(&request.body).unwrap();
    assert_eq!(nak_pubkey_hex, hex::encode(nak.pubkey_bytes()));
    let sig = ciphrtxt_message::SignatureBytes {
        r: nak_sig[..32].try_into().unwrap(),
        s: nak_sig[32..].try_into().unwrap(),
    };
    assert!(nak.verify(&sig, &outer_body));

    // Entry hop peels to the middle hop.
    let env2 = peel_envelope(&hop1_priv, outer_session_hex, &outer_body);
    assert!(!env2.local);
    assert_eq!(env2.host, hop2.host);

    // Middle hop peels to the exit hop.
    let body2 = BASE64.decode(&env2.body).unwrap();
    let env3 = peel_envelope(&hop2_priv, &env2.pubkey, &body2);
    assert_eq!(env3.host, hop3.host);

    // Exit hop peels to the destination store.
    let body3 = BASE64.decode(&env3.body).unwrap();
    let env4 = peel_envelope(&hop3_priv, &env3.pubkey, &body3);
    assert_eq!(env4.host, target.host);

    // The destination peels the innermost layer to the plaintext request.
    let body4 = BASE64.decode(&env4.body).unwrap();
    let session4 = decompress_point_hex(&env4.pubkey).unwrap();
    let inner_raw = peel_layer(&target_priv, &session4, &body4).unwrap();
    let inner: InnerRequest = serde_json::from_slice(&inner_raw).unwrap();

    assert!(inner.local);
    assert_eq!(inner.action, "GET");
    assert_eq!(inner.url, "api/header/list/since/0");
    assert_eq!(
        inner.headers.unwrap().get("Accept").map(String::as_str),
        Some("application/json")
    );
    assert!(inner.body.is_none());

    // The reply key is a valid point the destination can encrypt to.
    decompress_point_hex(&inner.replykey).unwrap();
}

#[test]
fn reply_decrypts_with_one_shot_key() {
    let (target, target_priv) = node("store.example");
    let nak = Nak::generate(&mut OsRng);

    let request = OnionRequestBuilder::new(&target)
        .get("api/time/", &nak)
        .unwrap();

    // Recover the reply point the way the destination would.
    let (_, _, outer_body) = split_transport_body(&request.body).unwrap();
    let outer_session_hex = request.url.rsplit('/').next().unwrap();
    let session = decompress_point_hex(outer_session_hex).unwrap();
    let inner: InnerRequest =
        serde_json::from_slice(&peel_layer(&target_priv, &session, &outer_body).unwrap()).unwrap();
    let reply_point = decompress_point_hex(&inner.replykey).unwrap();

    // Destination encrypts its response to the reply key and signs iv||ct.
    let response_body = br#"{"time": 1700000000}"#;
    let ecdh = reply_point * *target_priv.as_ref();
    let key: [u8; 32] = Sha256::digest(compress_point_hex(&ecdh).as_bytes()).into();
    let mut iv = [0u8; 16];
    OsRng.fill_bytes(&mut iv);
    let mut ciphertext = response_body.to_vec();
    {
        use aes::Aes128;
        use ctr::cipher::{KeyIvInit, StreamCipher};
        let mut key16 = [0u8; 16];
        key16.copy_from_slice(&key[..16]);
        let mut cipher = ctr::Ctr128BE::<Aes128>::new((&key16).into(), (&iv).into());
        cipher.apply_keystream(&mut ciphertext);
    }
    let mut signed_part = iv.to_vec();
    signed_part.extend_from_slice(&ciphertext);
    let signing = SigningKey::from_bytes(&target_priv.as_ref().to_bytes()).unwrap();
    let signature: Signature = signing.sign(&signed_part);

    let mut reply = signature.to_bytes().to_vec();
    reply.extend_from_slice(&signed_part);
    let reply_b64 = BASE64.encode(reply);

    let plaintext = request.decrypt_reply(&reply_b64).unwrap();
    assert_eq!(plaintext, response_body);

    // A tampered reply fails signature verification.
    let mut tampered = BASE64.decode(reply_b64.as_bytes()).unwrap();
    let last = tampered.len() - 1;
    tampered[last] ^= 0x01;
    assert!(request.decrypt_reply(&BASE64.encode(tampered)).is_err());
}
