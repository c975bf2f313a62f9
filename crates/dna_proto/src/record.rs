//! Identity record and name index — the keyserver's data model.
//!
//! The identity record is the authoritative self-description of a
//! fingerprint: both public keys, the optional registered name with its
//! registration window, a bounded profile, a strictly-increasing version
//! and a timestamp, all self-signed by the embedded signing key.
//!
//! Verification rejects any record whose signing key does not hash to the
//! fingerprint the caller asked about, so a stolen name index entry cannot
//! redirect a lookup to a different keypair.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use dna_crypto::keys::{verify_detached, KemPublicKey, SigningKeyPair, SigningPublicKey};
use dna_crypto::Fingerprint;

use crate::error::ProtoError;

pub const NAME_MIN_LEN: usize = 3;
pub const NAME_MAX_LEN: usize = 20;

/// Registered names live for one year, then the index slot frees up.
pub const NAME_TTL_SECS: i64 = 365 * 86400;

// ── Name handling ────────────────────────────────────────────────────────────

/// Enforce `[A-Za-z0-9_]{3,20}`.
pub fn validate_name(name: &str) -> Result<(), ProtoError> {
    if name.len() < NAME_MIN_LEN || name.len() > NAME_MAX_LEN {
        return Err(ProtoError::NameInvalid(format!(
            "name must be {NAME_MIN_LEN}-{NAME_MAX_LEN} characters"
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(ProtoError::NameInvalid(
            "name may contain only letters, digits and underscore".into(),
        ));
    }
    Ok(())
}

/// Index form of a name. The alphabet is ASCII, so lowercasing is the
/// entire normalization; original casing stays in the record for display.
pub fn normalize_name(name: &str) -> String {
    name.to_ascii_lowercase()
}

// ── Profile ──────────────────────────────────────────────────────────────────

const BIO_MAX: usize = 512;
const LOCATION_MAX: usize = 128;
const WEBSITE_MAX: usize = 256;
const SOCIAL_MAX: usize = 128;
const WALLET_MAX: usize = 128;
const AVATAR_B64_MAX: usize = 64 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Socials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telegram: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletAddresses {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backbone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eth: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sol: Option<String>,
}

/// Public profile carried in the identity record. All fields bounded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bio: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    #[serde(default)]
    pub socials: Socials,
    #[serde(default)]
    pub wallets: WalletAddresses,
    /// Base64 avatar image, small enough to live in the record itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

impl Profile {
    pub fn validate(&self) -> Result<(), ProtoError> {
        let bounds: [(&Option<String>, usize, &str); 4] = [
            (&self.bio, BIO_MAX, "bio"),
            (&self.location, LOCATION_MAX, "location"),
            (&self.website, WEBSITE_MAX, "website"),
            (&self.avatar, AVATAR_B64_MAX, "avatar"),
        ];
        for (field, max, label) in bounds {
            if let Some(v) = field {
                if v.len() > max {
                    return Err(ProtoError::Malformed(format!("{label} exceeds {max} bytes")));
                }
            }
        }
        for v in [&self.socials.x, &self.socials.telegram, &self.socials.github]
            .into_iter()
            .flatten()
        {
            if v.len() > SOCIAL_MAX {
                return Err(ProtoError::Malformed("social handle too long".into()));
            }
        }
        for v in [&self.wallets.backbone, &self.wallets.eth, &self.wallets.sol]
            .into_iter()
            .flatten()
        {
            if v.len() > WALLET_MAX {
                return Err(ProtoError::Malformed("wallet address too long".into()));
            }
        }
        Ok(())
    }
}

// ── Identity record ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityRecord {
    /// Base64 ML-DSA-87 public key (2592 bytes raw).
    pub signing_pubkey: String,
    /// Base64 ML-KEM-1024 public key (1568 bytes raw).
    pub kem_pubkey: String,
    /// Registered name in its display casing, when held.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registered_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_registered_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_expires_at: Option<i64>,
    #[serde(default)]
    pub profile: Profile,
    /// Strictly increasing on every re-publish.
    pub version: u64,
    /// Seconds since epoch.
    pub timestamp: i64,
    /// Base64 detached signature over the canonical form.
    pub signature: String,
}

impl IdentityRecord {
    /// Build and self-sign a fresh record.
    pub fn build(
        signing: &SigningKeyPair,
        kem_pubkey: &KemPublicKey,
        registered_name: Option<(String, i64)>,
        profile: Profile,
        version: u64,
        now: i64,
    ) -> Result<Self, ProtoError> {
        profile.validate()?;
        if let Some((name, _)) = &registered_name {
            validate_name(name)?;
        }
        let (registered_name, name_registered_at, name_expires_at) = match registered_name {
            Some((name, at)) => (Some(name), Some(at), Some(at + NAME_TTL_SECS)),
            None => (None, None, None),
        };
        let mut record = Self {
            signing_pubkey: B64.encode(signing.public().as_bytes()),
            kem_pubkey: B64.encode(kem_pubkey.as_bytes()),
            registered_name,
            name_registered_at,
            name_expires_at,
            profile,
            version,
            timestamp: now,
            signature: String::new(),
        };
        let sig = signing.sign(&record.canonical_bytes()?)?;
        record.signature = B64.encode(sig);
        Ok(record)
    }

    /// Deterministic signing payload — every field except the signature,
    /// serialized with stable key order.
    fn canonical_bytes(&self) -> Result<Vec<u8>, ProtoError> {
        let canonical = serde_json::json!({
            "kem_pubkey": self.kem_pubkey,
            "name_expires_at": self.name_expires_at,
            "name_registered_at": self.name_registered_at,
            "profile": self.profile,
            "registered_name": self.registered_name,
            "signing_pubkey": self.signing_pubkey,
            "timestamp": self.timestamp,
            "version": self.version,
        });
        Ok(serde_json::to_vec(&canonical)?)
    }

    /// Verify the self-signature and structural bounds; returns the
    /// fingerprint this record proves ownership of.
    pub fn verify(&self) -> Result<Fingerprint, ProtoError> {
        self.profile.validate()?;
        if let Some(name) = &self.registered_name {
            validate_name(name)?;
        }
        let pk = self.signing_pubkey_bytes()?;
        let sig = B64
            .decode(&self.signature)
            .map_err(|_| ProtoError::Malformed("signature not base64".into()))?;
        verify_detached(&pk, &self.canonical_bytes()?, &sig)
            .map_err(|_| ProtoError::BadSignature)?;
        Ok(Fingerprint::of_signing_key(&pk))
    }

    /// Verify against a caller-expected fingerprint (lookup path).
    pub fn verify_for(&self, expected: &Fingerprint) -> Result<(), ProtoError> {
        let actual = self.verify()?;
        if !actual.ct_eq(expected) {
            return Err(ProtoError::FingerprintMismatch);
        }
        Ok(())
    }

    pub fn signing_pubkey_bytes(&self) -> Result<Vec<u8>, ProtoError> {
        B64.decode(&self.signing_pubkey)
            .map_err(|_| ProtoError::Malformed("signing pubkey not base64".into()))
    }

    pub fn signing_key(&self) -> Result<SigningPublicKey, ProtoError> {
        Ok(SigningPublicKey::from_bytes(&self.signing_pubkey_bytes()?)?)
    }

    pub fn kem_key(&self) -> Result<KemPublicKey, ProtoError> {
        let bytes = B64
            .decode(&self.kem_pubkey)
            .map_err(|_| ProtoError::Malformed("kem pubkey not base64".into()))?;
        Ok(KemPublicKey::from_bytes(&bytes)?)
    }

    pub fn fingerprint(&self) -> Result<Fingerprint, ProtoError> {
        Ok(Fingerprint::of_signing_key(&self.signing_pubkey_bytes()?))
    }

    /// A name registration counts only while unexpired.
    pub fn name_valid_at(&self, now: i64) -> bool {
        matches!(
            (&self.registered_name, self.name_expires_at),
            (Some(_), Some(expires)) if expires > now
        )
    }
}

// ── Name index ───────────────────────────────────────────────────────────────

/// Secondary index entry mapping a normalized name to a fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NameIndexRecord {
    /// Normalized (lowercase) name.
    pub name: String,
    pub fingerprint: Fingerprint,
    pub registered_at: i64,
    pub expires_at: i64,
    /// Base64 owner signature over the canonical form.
    pub signature: String,
}

impl NameIndexRecord {
    pub fn build(
        name: &str,
        owner: &SigningKeyPair,
        registered_at: i64,
    ) -> Result<Self, ProtoError> {
        validate_name(name)?;
        let mut record = Self {
            name: normalize_name(name),
            fingerprint: owner.fingerprint(),
            registered_at,
            expires_at: registered_at + NAME_TTL_SECS,
            signature: String::new(),
        };
        let sig = owner.sign(&record.canonical_bytes()?)?;
        record.signature = B64.encode(sig);
        Ok(record)
    }

    fn canonical_bytes(&self) -> Result<Vec<u8>, ProtoError> {
        let canonical = serde_json::json!({
            "expires_at": self.expires_at,
            "fingerprint": self.fingerprint,
            "name": self.name,
            "registered_at": self.registered_at,
        });
        Ok(serde_json::to_vec(&canonical)?)
    }

    /// Verify against the owner's signing key (from their identity record).
    pub fn verify(&self, owner_key: &SigningPublicKey) -> Result<(), ProtoError> {
        if !owner_key.fingerprint().ct_eq(&self.fingerprint) {
            return Err(ProtoError::FingerprintMismatch);
        }
        let sig = B64
            .decode(&self.signature)
            .map_err(|_| ProtoError::Malformed("signature not base64".into()))?;
        verify_detached(owner_key.as_bytes(), &self.canonical_bytes()?, &sig)
            .map_err(|_| ProtoError::BadSignature)
    }

    pub fn expired_at(&self, now: i64) -> bool {
        self.expires_at <= now
    }
}
