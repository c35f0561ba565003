//! Access-control vectors
//!
//! Each key slot on the device is paired with a 256-bit access vector: bit
//! *g* grants the key write access to configuration group *g*. On the wire
//! the vector travels base64-encoded in `settings/acl_N`, and unlike the key
//! itself it can be read back for verification.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::ProtocolError;

/// Size of an access vector in bytes (256 group bits).
pub const ACL_LEN: usize = 32;

/// A 256-bit access-control bitmap.
///
/// Group *g* lives in byte `g / 8`, at bit position `g % 8` counted from the
/// least-significant bit. The group index is a `u8`, so every representable
/// index is in range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AclVector([u8; ACL_LEN]);

impl AclVector {
    /// Vector granting access to no groups.
    pub fn zero() -> Self {
        Self([0; ACL_LEN])
    }

    /// Vector granting access to every group.
    pub fn all() -> Self {
        Self([0xFF; ACL_LEN])
    }

    /// Build from raw bytes; anything but 32 bytes is rejected.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let bytes: [u8; ACL_LEN] =
            bytes
                .try_into()
                .map_err(|_| ProtocolError::InvalidLength {
                    what: "ACL vector",
                    expected: ACL_LEN,
                    actual: bytes.len(),
                })?;
        Ok(Self(bytes))
    }

    /// Grant access to a group.
    pub fn set(&mut self, group: u8) -> &mut Self {
        self.0[usize::from(group) / 8] |= 1 << (group % 8);
        self
    }

    /// Revoke access to a group.
    pub fn clear(&mut self, group: u8) -> &mut Self {
        self.0[usize::from(group) / 8] &= !(1 << (group % 8));
        self
    }

    /// True if the vector grants access to a group.
    pub fn test(&self, group: u8) -> bool {
        self.0[usize::from(group) / 8] & (1 << (group % 8)) != 0
    }

    /// The raw 32-byte bitmap.
    pub fn as_bytes(&self) -> &[u8; ACL_LEN] {
        &self.0
    }

    /// Base64 wire encoding.
    pub fn encode(&self) -> String {
        BASE64.encode(self.0)
    }

    /// Decode the base64 wire encoding; fails unless exactly 32 bytes.
    pub fn decode(encoded: &str) -> Result<Self, ProtocolError> {
        let bytes = BASE64.decode(encoded)?;
        Self::from_bytes(&bytes)
    }
}

impl Default for AclVector {
    fn default() -> Self {
        Self::zero()
    }
}

impl Serialize for AclVector {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.encode())
    }
}

impl<'de> Deserialize<'de> for AclVector {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        Self::decode(&encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_set_then_test_every_group() {
        for group in 0..=255u8 {
            let mut vector = AclVector::zero();
            vector.set(group);
            assert!(vector.test(group), "group {} not set", group);
            for other in 0..=255u8 {
                if other != group {
                    assert!(!vector.test(other), "group {} bled into {}", group, other);
                }
            }
        }
    }

    #[test]
    fn test_clear_undoes_set() {
        let mut vector = AclVector::all();
        vector.clear(200);
        assert!(!vector.test(200));
        assert!(vector.test(199));
        assert!(vector.test(201));
    }

    #[test]
    fn test_group_10_byte_layout() {
        let mut vector = AclVector::zero();
        vector.set(10);
        assert_eq!(vector.as_bytes()[1], 0x04);
        assert_eq!(vector.encode(), "AAQAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=");
    }

    #[test]
    fn test_all_access_encoding() {
        assert_eq!(
            AclVector::all().encode(),
            "//////////////////////////////////////////8="
        );
    }

    #[test]
    fn test_decode_roundtrip() {
        let mut vector = AclVector::zero();
        vector.set(0).set(7).set(255);
        let decoded = AclVector::decode(&vector.encode()).unwrap();
        assert_eq!(decoded, vector);
    }

    #[test]
    fn test_decode_rejects_wrong_length() {
        // 16 bytes of zeros
        let err = AclVector::decode("AAAAAAAAAAAAAAAAAAAAAA==").unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::InvalidLength {
                what: "ACL vector",
                expected: 32,
                actual: 16,
            }
        ));
    }

    #[test]
    fn test_decode_rejects_bad_base64() {
        assert!(matches!(
            AclVector::decode("not base64!"),
            Err(ProtocolError::Base64(_))
        ));
    }

    #[test]
    fn test_serde_as_base64_string() {
        let mut vector = AclVector::zero();
        vector.set(10);
        let text = serde_json::to_string(&vector).unwrap();
        assert_eq!(text, "\"AAQAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=\"");
        let back: AclVector = serde_json::from_str(&text).unwrap();
        assert_eq!(back, vector);
    }
}
