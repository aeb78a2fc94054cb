//! Wallet address encoding
//!
//! Bitcoin-style base58check addresses and WIF private key serialization for
//! the coin networks the protocol interoperates with. Peripheral to the
//! messaging core.

use rand::{CryptoRng, RngCore};
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};
use thiserror::Error;

use ciphrtxt_core::{g_mul, random_scalar, scalar_from_repr, ProjectivePoint, Scalar};
use k256::elliptic_curve::sec1::ToEncodedPoint;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WalletError {
    #[error("Malformed base58 input")]
    Malformed,

    #[error("Checksum mismatch")]
    ChecksumMismatch,

    #[error("Format error")]
    FormatError,
}

/// Coin network version bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WalletNetwork {
    #[default]
    CtIndigo,
    CtRed,
    BtMain,
    BtTest,
    BtSimtest,
}

impl WalletNetwork {
    pub fn pub_version(&self) -> u8 {
        match self {
            Self::CtIndigo => 0x1C,
            Self::CtRed => 0x50,
            Self::BtMain => 0x00,
            Self::BtTest => 0x6F,
            Self::BtSimtest => 0x3F,
        }
    }

    pub fn priv_version(&self) -> u8 {
        match self {
            Self::CtIndigo => 0xBB,
            Self::CtRed => 0xA3,
            Self::BtMain => 0x80,
            Self::BtTest => 0xEF,
            Self::BtSimtest => 0x64,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ct-indigo" => Some(Self::CtIndigo),
            "ct-red" => Some(Self::CtRed),
            "bt-main" => Some(Self::BtMain),
            "bt-test" => Some(Self::BtTest),
            "bt-simtest" => Some(Self::BtSimtest),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::CtIndigo => "ct-indigo",
            Self::CtRed => "ct-red",
            Self::BtMain => "bt-main",
            Self::BtTest => "bt-test",
            Self::BtSimtest => "bt-simtest",
        }
    }
}

fn base58check(payload: &[u8]) -> String {
    let check: [u8; 32] = Sha256::digest(Sha256::digest(payload)).into();
    let mut data = payload.to_vec();
    data.extend_from_slice(&check[..4]);
    bs58::encode(data).into_string()
}

fn base58check_decode(text: &str) -> Result<Vec<u8>, WalletError> {
    let raw = bs58::decode(text)
        .into_vec()
        .map_err(|_| WalletError::Malformed)?;
    if raw.len() < 5 {
        return Err(WalletError::Malformed);
    }
    let (payload, check) = raw.split_at(raw.len() - 4);
    let expected: [u8; 32] = Sha256::digest(Sha256::digest(payload)).into();
    if check != &expected[..4] {
        return Err(WalletError::ChecksumMismatch);
    }
    Ok(payload.to_vec())
}

fn hash160(data: &[u8]) -> [u8; 20] {
    Ripemd160::digest(Sha256::digest(data)).into()
}

/// Public wallet key: encodes version-1 addresses from the identity point.
#[derive(Debug, Clone, PartialEq)]
pub struct WalletPubkey {
    network: WalletNetwork,
    point: ProjectivePoint,
}

impl WalletPubkey {
    pub fn new(network: WalletNetwork, point: ProjectivePoint) -> Self {
        Self { network, point }
    }

    pub fn network(&self) -> WalletNetwork {
        self.network
    }

    pub fn point(&self) -> &ProjectivePoint {
        &self.point
    }

    /// Address over the uncompressed SEC1 encoding:
    /// `base58check(version || RIPEMD160(SHA256(04 || x || y)))`.
    pub fn address(&self) -> String {
        let encoded = self.point.to_affine().to_encoded_point(false);
        let mut payload = vec![self.network.pub_version()];
        payload.extend_from_slice(&hash160(encoded.as_bytes()));
        base58check(&payload)
    }

    /// Address over the compressed SEC1 encoding.
    pub fn address_compressed(&self) -> String {
        let encoded = self.point.to_affine().to_encoded_point(true);
        let mut payload = vec![self.network.pub_version()];
        payload.extend_from_slice(&hash160(encoded.as_bytes()));
        base58check(&payload)
    }
}

/// Private wallet key with WIF serialization.
#[derive(Clone, Debug, PartialEq)]
pub struct WalletPrivkey {
    network: WalletNetwork,
    scalar: Scalar,
    point: ProjectivePoint,
}

impl WalletPrivkey {
    pub fn new(network: WalletNetwork, scalar: Scalar) -> Self {
        let point = g_mul(&scalar);
        Self {
            network,
            scalar,
            point,
        }
    }

    pub fn generate(network: WalletNetwork, rng: &mut (impl RngCore + CryptoRng)) -> Self {
        Self::new(network, random_scalar(rng))
    }

    pub fn scalar(&self) -> &Scalar {
        &self.scalar
    }

    pub fn pubkey(&self) -> WalletPubkey {
        WalletPubkey::new(self.network, self.point)
    }

    /// WIF form: `base58check(version || p)`.
    pub fn wif(&self) -> String {
        let mut payload = vec![self.network.priv_version()];
        payload.extend_from_slice(&self.scalar.to_bytes());
        base58check(&payload)
    }

    /// Compressed-pubkey WIF form: `base58check(version || p || 0x01)`.
    pub fn wif_compressed(&self) -> String {
        let mut payload = vec![self.network.priv_version()];
        payload.extend_from_slice(&self.scalar.to_bytes());
        payload.push(0x01);
        base58check(&payload)
    }

    pub fn from_wif(network: WalletNetwork, text: &str) -> Result<Self, WalletError> {
        let payload = base58check_decode(text)?;
        if payload.len() != 33 || payload[0] != network.priv_version() {
            return Err(WalletError::FormatError);
        }
        let mut repr = [0u8; 32];
        repr.copy_from_slice(&payload[1..]);
        let scalar = scalar_from_repr(repr).map_err(|_| WalletError::FormatError)?;
        Ok(Self::new(network, scalar))
    }

    pub fn from_wif_compressed(network: WalletNetwork, text: &str) -> Result<Self, WalletError> {
        let payload = base58check_decode(text)?;
        if payload.len() != 34 || payload[0] != network.priv_version() || payload[33] != 0x01 {
            return Err(WalletError::FormatError);
        }
        let mut repr = [0u8; 32];
        repr.copy_from_slice(&payload[1..33]);
        let scalar = scalar_from_repr(repr).map_err(|_| WalletError::FormatError)?;
        Ok(Self::new(network, scalar))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    // Reference vectors from the version-1 address / WIF documentation.
    const WIKI_PRIV_HEX: &str = "0c28fca386c7a227600b2fe50b7cae11ec86d3bf1fbe471be89827e19d72aa1d";
    const WIKI_WIF: &str = "5HueCGU8rMjxEXxiPuD5BDku4MkFqeZyd4dZ1jvhTVqvbTLvyTJ";
    const WIKI_WIF_COMPRESSED: &str = "KwdMAjGmerYanjeui5SHS7JkmpZvVipYvB2LJGU1ZxJwYvP98617";

    fn wiki_key() -> WalletPrivkey {
        let bytes: [u8; 32] = hex::decode(WIKI_PRIV_HEX).unwrap().try_into().unwrap();
        WalletPrivkey::new(WalletNetwork::BtMain, scalar_from_repr(bytes).unwrap())
    }

    #[test]
    fn test_wif_known_vector() {
        let key = wiki_key();
        assert_eq!(key.wif(), WIKI_WIF);
        assert_eq!(key.wif_compressed(), WIKI_WIF_COMPRESSED);
    }

    #[test]
    fn test_wif_deserialize_known_vector() {
        let key = WalletPrivkey::from_wif(WalletNetwork::BtMain, WIKI_WIF).unwrap();
        assert_eq!(key, wiki_key());
        let key = WalletPrivkey::from_wif_compressed(WalletNetwork::BtMain, WIKI_WIF_COMPRESSED)
            .unwrap();
        assert_eq!(key, wiki_key());
    }

    #[test]
    fn test_address_known_vectors() {
        // G * 1 has well-known addresses on the main network.
        let key = WalletPrivkey::new(WalletNetwork::BtMain, Scalar::ONE);
        assert_eq!(key.pubkey().address(), "1EHNa6Q4Jz2uvNExL497mE43ikXhwF6kZm");
        assert_eq!(
            key.pubkey().address_compressed(),
            "1BgGZ9tcN4rm9KBzDn7KprQz87SZ26SAMH"
        );
    }

    #[test]
    fn test_wif_roundtrip_random() {
        for network in [
            WalletNetwork::CtIndigo,
            WalletNetwork::CtRed,
            WalletNetwork::BtTest,
            WalletNetwork::BtSimtest,
        ] {
            let key = WalletPrivkey::generate(network, &mut OsRng);
            assert_eq!(WalletPrivkey::from_wif(network, &key.wif()).unwrap(), key);
            assert_eq!(
                WalletPrivkey::from_wif_compressed(network, &key.wif_compressed()).unwrap(),
                key
            );
        }
    }

    #[test]
    fn test_wif_rejects_tamper_and_wrong_network() {
        let key = WalletPrivkey::generate(WalletNetwork::CtIndigo, &mut OsRng);
        let wif = key.wif();

        // Corrupt one character.
        let mut tampered = wif.clone().into_bytes();
        tampered[10] = if tampered[10] == b'2' { b'3' } else { b'2' };
        let tampered = String::from_utf8(tampered).unwrap();
        assert!(WalletPrivkey::from_wif(WalletNetwork::CtIndigo, &tampered).is_err());

        // Wrong network version byte.
        assert_eq!(
            WalletPrivkey::from_wif(WalletNetwork::BtMain, &wif),
            Err(WalletError::FormatError)
        );

        // Uncompressed WIF is not a valid compressed WIF.
        assert_eq!(
            WalletPrivkey::from_wif_compressed(WalletNetwork::CtIndigo, &wif),
            Err(WalletError::FormatError)
        );
    }

    #[test]
    fn test_network_names() {
        assert_eq!(WalletNetwork::from_name("ct-indigo"), Some(WalletNetwork::CtIndigo));
        assert_eq!(WalletNetwork::from_name("bt-simtest"), Some(WalletNetwork::BtSimtest));
        assert_eq!(WalletNetwork::from_name("dogecoin"), None);
        assert_eq!(WalletNetwork::CtRed.name(), "ct-red");
    }
}
