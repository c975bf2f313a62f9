//! Identity fingerprint: SHA3-512 of the ML-DSA signing public key.
//!
//! The fingerprint is a pure projection of the public key — it is never
//! stored as an independent writable field, so a record whose key and
//! fingerprint disagree cannot be constructed through this type.

use std::fmt;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha3::{Digest, Sha3_512};
use subtle::ConstantTimeEq;

use crate::error::CryptoError;

/// 64-byte identity fingerprint, rendered as 128 lower-hex characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 64]);

impl Fingerprint {
    pub const LEN: usize = 64;
    pub const HEX_LEN: usize = 128;

    /// Compute the fingerprint of a signing public key.
    pub fn of_signing_key(pubkey_bytes: &[u8]) -> Self {
        let digest = Sha3_512::digest(pubkey_bytes);
        let mut out = [0u8; 64];
        out.copy_from_slice(&digest);
        Self(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; 64] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidFingerprint(format!("expected 64 bytes, got {}", bytes.len()))
        })?;
        Ok(Self(arr))
    }

    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        if s.len() != Self::HEX_LEN {
            return Err(CryptoError::InvalidFingerprint(format!(
                "expected {} hex chars, got {}",
                Self::HEX_LEN,
                s.len()
            )));
        }
        let bytes = hex::decode(s)?;
        Self::from_bytes(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Constant-time equality for verification paths.
    pub fn ct_eq(&self, other: &Fingerprint) -> bool {
        self.0.ct_eq(&other.0).into()
    }

    /// Short prefix for log lines. Not a substitute for full comparison.
    pub fn abbrev(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({}…)", self.abbrev())
    }
}

impl FromStr for Fingerprint {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Fingerprint::from_hex(&s).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_roundtrip() {
        let fp = Fingerprint::of_signing_key(b"some public key bytes");
        let parsed = Fingerprint::from_hex(&fp.to_hex()).unwrap();
        assert_eq!(fp, parsed);
        assert!(fp.ct_eq(&parsed));
        assert_eq!(fp.to_hex().len(), Fingerprint::HEX_LEN);
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(Fingerprint::from_hex("abcd").is_err());
        assert!(Fingerprint::from_bytes(&[0u8; 63]).is_err());
    }

    #[test]
    fn distinct_keys_distinct_fingerprints() {
        let a = Fingerprint::of_signing_key(b"key a");
        let b = Fingerprint::of_signing_key(b"key b");
        assert_ne!(a, b);
        assert!(!a.ct_eq(&b));
    }
}
