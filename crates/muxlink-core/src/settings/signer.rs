//! Signed settings packets
//!
//! Once a device is locked it only applies settings delivered as a
//! [`SignedPacket`]: the document travels base64-encoded in `cnt`, and `sig`
//! carries an AES-CCM authentication tag computed over the base64 bytes with
//! one of the device's stored keys. Only the device can check the tag; the
//! host never verifies, it only signs.
//!
//! The CCM nonce is thirteen zero bytes for every message ever signed with a
//! given key. That authenticates each `cnt` but gives no freshness: a
//! captured packet remains a valid signature over its own content forever.
//! This mirrors the device firmware and is deliberately not "fixed" here.

use aes::Aes256;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ccm::aead::generic_array::GenericArray;
use ccm::aead::{AeadInPlace, KeyInit};
use ccm::consts::{U13, U16};
use ccm::Ccm;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::document::SettingsDocument;
use crate::ProtocolError;

/// Authentication key size in bytes.
pub const KEY_LEN: usize = 32;
/// CCM nonce size in bytes.
pub const NONCE_LEN: usize = 13;
/// CCM authentication tag size in bytes.
pub const TAG_LEN: usize = 16;

/// The fixed all-zero nonce the device expects.
const SIGNING_NONCE: [u8; NONCE_LEN] = [0; NONCE_LEN];

type Aes256Ccm = Ccm<Aes256, U16, U13>;

/// A 32-byte device authentication key.
///
/// Write-only on the device: once stored in a key slot it can never be read
/// back. `Debug` does not print key material.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthKey([u8; KEY_LEN]);

impl AuthKey {
    /// Build from raw bytes; anything but 32 bytes is rejected.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let bytes: [u8; KEY_LEN] =
            bytes
                .try_into()
                .map_err(|_| ProtocolError::InvalidLength {
                    what: "authentication key",
                    expected: KEY_LEN,
                    actual: bytes.len(),
                })?;
        Ok(Self(bytes))
    }

    /// Decode a base64-encoded key.
    pub fn from_base64(encoded: &str) -> Result<Self, ProtocolError> {
        let bytes = BASE64.decode(encoded)?;
        Self::from_bytes(&bytes)
    }

    /// Base64 wire encoding, as written to `settings/key_N`.
    pub fn encode(&self) -> String {
        BASE64.encode(self.0)
    }

    /// The raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for AuthKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AuthKey(..)")
    }
}

/// Authenticated-encryption capability used for signing.
///
/// Narrow by design so the protocol logic can be tested with fakes and the
/// primitive swapped for a hardware-backed one.
pub trait Seal: Send {
    /// Compute the authentication tag for `plaintext` under `key`/`nonce`.
    fn seal(
        &self,
        key: &AuthKey,
        nonce: &[u8; NONCE_LEN],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, ProtocolError>;
}

/// AES-256-CCM implementation of [`Seal`] (16-byte tag, 13-byte nonce).
#[derive(Debug, Default, Clone, Copy)]
pub struct CcmSeal;

impl Seal for CcmSeal {
    fn seal(
        &self,
        key: &AuthKey,
        nonce: &[u8; NONCE_LEN],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, ProtocolError> {
        let cipher = Aes256Ccm::new(GenericArray::from_slice(key.as_bytes()));
        // CCM's tag is computed over the plaintext; the ciphertext itself is
        // discarded since the message travels in clear.
        let mut buffer = plaintext.to_vec();
        let tag = cipher
            .encrypt_in_place_detached(GenericArray::from_slice(nonce), b"", &mut buffer)
            .map_err(|e| ProtocolError::Seal(e.to_string()))?;
        Ok(tag.to_vec())
    }
}

/// The envelope a locked device requires around every write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPacket {
    /// Base64 of the serialized settings document
    pub cnt: String,
    /// Base64 of the authentication tag over the `cnt` bytes
    pub sig: String,
}

impl SignedPacket {
    /// Recover the signed document from `cnt`.
    pub fn content(&self) -> Result<SettingsDocument, ProtocolError> {
        let bytes = BASE64.decode(&self.cnt)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Wire bytes sent on the settings channel.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Builds signed packets for one key.
pub struct Signer {
    key: AuthKey,
    seal: Box<dyn Seal>,
}

impl Signer {
    /// Signer using the built-in AES-CCM primitive.
    pub fn new(key: AuthKey) -> Self {
        Self::with_seal(key, Box::new(CcmSeal))
    }

    /// Signer with an injected sealing primitive.
    pub fn with_seal(key: AuthKey, seal: Box<dyn Seal>) -> Self {
        Self { key, seal }
    }

    /// Wrap a document in a [`SignedPacket`].
    ///
    /// The document is serialized, base64-encoded into `cnt`, and the tag is
    /// computed over those base64 bytes with the fixed zero nonce.
    /// Deterministic: a given `(document, key)` always yields the same `sig`.
    pub fn sign(&self, document: &SettingsDocument) -> Result<SignedPacket, ProtocolError> {
        let cnt = BASE64.encode(document.to_bytes()?);
        let tag = self.seal.seal(&self.key, &SIGNING_NONCE, cnt.as_bytes())?;
        let packet = SignedPacket {
            cnt,
            sig: BASE64.encode(&tag),
        };
        debug!(paths = document.len(), "signed settings packet");
        Ok(packet)
    }
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn test_key() -> AuthKey {
        AuthKey::from_bytes(&[0x42; KEY_LEN]).unwrap()
    }

    #[test]
    fn test_key_length_enforced() {
        assert!(AuthKey::from_bytes(&[0; 32]).is_ok());
        let err = AuthKey::from_bytes(&[0; 31]).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::InvalidLength {
                what: "authentication key",
                expected: 32,
                actual: 31,
            }
        ));
        assert!(AuthKey::from_bytes(&[0; 33]).is_err());
    }

    #[test]
    fn test_key_base64_roundtrip() {
        let key = test_key();
        assert_eq!(AuthKey::from_base64(&key.encode()).unwrap(), key);
    }

    #[test]
    fn test_debug_never_prints_key_material() {
        assert_eq!(format!("{:?}", test_key()), "AuthKey(..)");
    }

    #[test]
    fn test_ccm_tag_is_16_bytes() {
        let tag = CcmSeal
            .seal(&test_key(), &[0; NONCE_LEN], b"payload")
            .unwrap();
        assert_eq!(tag.len(), TAG_LEN);
    }

    #[test]
    fn test_sign_is_deterministic() {
        let doc = SettingsDocument::new()
            .with("app/brightness", 25)
            .with("save", true);
        let first = Signer::new(test_key()).sign(&doc).unwrap();
        let second = Signer::new(test_key()).sign(&doc).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_different_keys_produce_different_tags() {
        let doc = SettingsDocument::new().with("app/brightness", 25);
        let a = Signer::new(test_key()).sign(&doc).unwrap();
        let b = Signer::new(AuthKey::from_bytes(&[0x43; KEY_LEN]).unwrap())
            .sign(&doc)
            .unwrap();
        assert_eq!(a.cnt, b.cnt);
        assert_ne!(a.sig, b.sig);
    }

    #[test]
    fn test_cnt_decodes_back_to_the_document() {
        let doc = SettingsDocument::new()
            .with("app/brightness", 5)
            .with("sn", "DT-1234");
        let packet = Signer::new(test_key()).sign(&doc).unwrap();
        assert_eq!(packet.content().unwrap(), doc);
    }

    #[test]
    fn test_wire_shape() {
        let packet = Signer::new(test_key())
            .sign(&SettingsDocument::new().with("save", true))
            .unwrap();
        let wire: serde_json::Value =
            serde_json::from_slice(&packet.to_bytes().unwrap()).unwrap();
        let object = wire.as_object().unwrap();
        assert_eq!(object.len(), 2);
        assert_eq!(object["cnt"], json!(packet.cnt));
        assert_eq!(object["sig"], json!(packet.sig));
    }

    #[test]
    fn test_injected_seal_is_used() {
        struct FixedSeal;
        impl Seal for FixedSeal {
            fn seal(
                &self,
                _key: &AuthKey,
                _nonce: &[u8; NONCE_LEN],
                _plaintext: &[u8],
            ) -> Result<Vec<u8>, ProtocolError> {
                Ok(vec![0xAB; TAG_LEN])
            }
        }

        let packet = Signer::with_seal(test_key(), Box::new(FixedSeal))
            .sign(&SettingsDocument::new())
            .unwrap();
        assert_eq!(packet.sig, BASE64.encode([0xAB; TAG_LEN]));
    }
}
