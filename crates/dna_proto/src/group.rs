//! Group metadata record and group message blob.
//!
//! The group record is the authoritative descriptor of a group at a
//! GEK version: owner, ordered member set (with each member's KEM key,
//! which the owner needs to build the next IKP), and the version itself.
//! Only the owner's key may sign mutations, and `gek_version` strictly
//! increases — verification enforces both.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use zeroize::Zeroizing;

use dna_crypto::aead;
use dna_crypto::keys::{
    verify_detached, KemPublicKey, SigningKeyPair, SigningPublicKey, SIGNATURE_LEN,
};
use dna_crypto::Fingerprint;

use crate::error::ProtoError;

/// 32-byte symmetric Group Encryption Key. Never serialized in the clear.
pub type Gek = Zeroizing<[u8; 32]>;

pub const GROUP_NAME_MAX: usize = 64;

// ── Group record ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMember {
    pub fp: Fingerprint,
    /// Base64 ML-KEM-1024 public key.
    pub kem_pubkey: String,
    pub added_at: i64,
}

impl GroupMember {
    pub fn new(fp: Fingerprint, kem: &KemPublicKey, added_at: i64) -> Self {
        Self {
            fp,
            kem_pubkey: B64.encode(kem.as_bytes()),
            added_at,
        }
    }

    pub fn kem_key(&self) -> Result<KemPublicKey, ProtoError> {
        let bytes = B64
            .decode(&self.kem_pubkey)
            .map_err(|_| ProtoError::Malformed("member kem pubkey not base64".into()))?;
        Ok(KemPublicKey::from_bytes(&bytes)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupRecord {
    pub uuid: Uuid,
    pub name: String,
    pub owner_fp: Fingerprint,
    /// Base64 owner signing key, so the record verifies self-contained.
    pub owner_signing_pubkey: String,
    /// Ordered member set; order fixes the IKP entry indices.
    pub members: Vec<GroupMember>,
    pub gek_version: u32,
    pub created_at: i64,
    pub updated_at: i64,
    pub signature: String,
}

impl GroupRecord {
    pub fn build(
        uuid: Uuid,
        name: &str,
        owner: &SigningKeyPair,
        members: Vec<GroupMember>,
        gek_version: u32,
        created_at: i64,
        now: i64,
    ) -> Result<Self, ProtoError> {
        if name.is_empty() || name.len() > GROUP_NAME_MAX {
            return Err(ProtoError::Malformed("group name length".into()));
        }
        if gek_version == 0 {
            return Err(ProtoError::WrongVersion);
        }
        let mut record = Self {
            uuid,
            name: name.to_string(),
            owner_fp: owner.fingerprint(),
            owner_signing_pubkey: B64.encode(owner.public().as_bytes()),
            members,
            gek_version,
            created_at,
            updated_at: now,
            signature: String::new(),
        };
        let sig = owner.sign(&record.canonical_bytes()?)?;
        record.signature = B64.encode(sig);
        Ok(record)
    }

    fn canonical_bytes(&self) -> Result<Vec<u8>, ProtoError> {
        let canonical = serde_json::json!({
            "created_at": self.created_at,
            "gek_version": self.gek_version,
            "members": self.members,
            "name": self.name,
            "owner_fp": self.owner_fp,
            "owner_signing_pubkey": self.owner_signing_pubkey,
            "updated_at": self.updated_at,
            "uuid": self.uuid,
        });
        Ok(serde_json::to_vec(&canonical)?)
    }

    /// Verify owner signature and the owner-fp/key binding.
    pub fn verify(&self) -> Result<(), ProtoError> {
        let pk = B64
            .decode(&self.owner_signing_pubkey)
            .map_err(|_| ProtoError::Malformed("owner pubkey not base64".into()))?;
        if !Fingerprint::of_signing_key(&pk).ct_eq(&self.owner_fp) {
            return Err(ProtoError::FingerprintMismatch);
        }
        if self.gek_version == 0 || self.members.is_empty() {
            return Err(ProtoError::Malformed("empty group or zero version".into()));
        }
        let sig = B64
            .decode(&self.signature)
            .map_err(|_| ProtoError::Malformed("signature not base64".into()))?;
        verify_detached(&pk, &self.canonical_bytes()?, &sig)
            .map_err(|_| ProtoError::BadSignature)
    }

    /// Verify a mutation of `prior`: same uuid and owner, higher version.
    pub fn verify_supersedes(&self, prior: &GroupRecord) -> Result<(), ProtoError> {
        self.verify()?;
        if self.uuid != prior.uuid || self.owner_fp != prior.owner_fp {
            return Err(ProtoError::FingerprintMismatch);
        }
        if self.gek_version <= prior.gek_version {
            return Err(ProtoError::WrongVersion);
        }
        Ok(())
    }

    /// The owner's signing key, already bound to `owner_fp` by `verify`.
    pub fn owner_key(&self) -> Result<SigningPublicKey, ProtoError> {
        let pk = B64
            .decode(&self.owner_signing_pubkey)
            .map_err(|_| ProtoError::Malformed("owner pubkey not base64".into()))?;
        Ok(SigningPublicKey::from_bytes(&pk)?)
    }

    pub fn member(&self, fp: &Fingerprint) -> Option<&GroupMember> {
        self.members.iter().find(|m| m.fp == *fp)
    }

    pub fn member_fps(&self) -> Vec<Fingerprint> {
        self.members.iter().map(|m| m.fp).collect()
    }
}

// ── Group message ────────────────────────────────────────────────────────────
//
// magic(4)="DNAG" ‖ gek_version(4 BE) ‖ sender_fp(64) ‖ timestamp(8 BE)
// ‖ nonce(12) ‖ ct_len(4 BE) ‖ AES-256-GCM ct+tag ‖ sender_sig(4627)
//
// AAD = group_uuid(16) ‖ gek_version(4 BE). The outer signature covers
// every preceding byte so recipients can attribute before decrypting.

const GMSG_MAGIC: &[u8; 4] = b"DNAG";
const GMSG_FIXED: usize = 4 + 4 + 64 + 8 + aead::NONCE_LEN + 4;

fn gmsg_aad(group: &Uuid, version: u32) -> Vec<u8> {
    let mut aad = Vec::with_capacity(16 + 4);
    aad.extend_from_slice(group.as_bytes());
    aad.extend_from_slice(&version.to_be_bytes());
    aad
}

/// Encrypt and sign a group message under the given GEK version.
pub fn seal_group_message(
    group: &Uuid,
    gek_version: u32,
    gek: &Gek,
    sender: &SigningKeyPair,
    timestamp: i64,
    plaintext: &[u8],
) -> Result<Vec<u8>, ProtoError> {
    let nonce = aead::random_nonce();
    let ciphertext = aead::encrypt(gek, &nonce, plaintext, &gmsg_aad(group, gek_version))?;

    let mut out = Vec::with_capacity(GMSG_FIXED + ciphertext.len() + SIGNATURE_LEN);
    out.extend_from_slice(GMSG_MAGIC);
    out.extend_from_slice(&gek_version.to_be_bytes());
    out.extend_from_slice(sender.fingerprint().as_bytes());
    out.extend_from_slice(&timestamp.to_be_bytes());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&(ciphertext.len() as u32).to_be_bytes());
    out.extend_from_slice(&ciphertext);
    let sig = sender.sign(&out)?;
    out.extend_from_slice(&sig);
    Ok(out)
}

/// A structurally-decoded group message, not yet attributed or decrypted.
#[derive(Debug, Clone)]
pub struct GroupMessage {
    pub gek_version: u32,
    pub sender_fp: Fingerprint,
    pub timestamp: i64,
    nonce: [u8; aead::NONCE_LEN],
    ciphertext: Vec<u8>,
    signed_len: usize,
    raw: Vec<u8>,
}

impl GroupMessage {
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtoError> {
        if bytes.len() < GMSG_FIXED + aead::TAG_LEN + SIGNATURE_LEN {
            return Err(ProtoError::Malformed("group message too short".into()));
        }
        if &bytes[0..4] != GMSG_MAGIC {
            return Err(ProtoError::Malformed("bad group message magic".into()));
        }
        let gek_version = u32::from_be_bytes(bytes[4..8].try_into().unwrap());
        let sender_fp = Fingerprint::from_bytes(&bytes[8..72])?;
        let timestamp = i64::from_be_bytes(bytes[72..80].try_into().unwrap());
        let mut nonce = [0u8; aead::NONCE_LEN];
        nonce.copy_from_slice(&bytes[80..92]);
        let ct_len = u32::from_be_bytes(bytes[92..96].try_into().unwrap()) as usize;
        if bytes.len() != GMSG_FIXED + ct_len + SIGNATURE_LEN {
            return Err(ProtoError::Malformed("group message length mismatch".into()));
        }
        Ok(Self {
            gek_version,
            sender_fp,
            timestamp,
            nonce,
            ciphertext: bytes[GMSG_FIXED..GMSG_FIXED + ct_len].to_vec(),
            signed_len: GMSG_FIXED + ct_len,
            raw: bytes.to_vec(),
        })
    }

    /// Verify the outer signature against the claimed sender's key.
    pub fn verify_sender(&self, sender_key: &SigningPublicKey) -> Result<(), ProtoError> {
        if !sender_key.fingerprint().ct_eq(&self.sender_fp) {
            return Err(ProtoError::FingerprintMismatch);
        }
        sender_key
            .verify(&self.raw[..self.signed_len], &self.raw[self.signed_len..])
            .map_err(|_| ProtoError::BadSignature)
    }

    /// Decrypt with the GEK for `self.gek_version`.
    pub fn decrypt(&self, group: &Uuid, gek: &Gek) -> Result<Zeroizing<Vec<u8>>, ProtoError> {
        aead::decrypt(
            gek,
            &self.nonce,
            &self.ciphertext,
            &gmsg_aad(group, self.gek_version),
        )
        .map(|pt| Zeroizing::new(pt.to_vec()))
        .map_err(|_| ProtoError::DecryptFailure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dna_crypto::keys::KemKeyPair;

    fn gek(byte: u8) -> Gek {
        Zeroizing::new([byte; 32])
    }

    fn owner() -> SigningKeyPair {
        SigningKeyPair::from_seed(&[50u8; 32]).unwrap()
    }

    fn members(owner: &SigningKeyPair) -> Vec<GroupMember> {
        let kem = KemKeyPair::from_seed(&[51u8; 32]).unwrap();
        vec![GroupMember::new(owner.fingerprint(), kem.public(), 0)]
    }

    #[test]
    fn record_verifies_and_enforces_monotonic_version() {
        let owner = owner();
        let uuid = Uuid::new_v4();
        let v1 = GroupRecord::build(uuid, "team", &owner, members(&owner), 1, 0, 0).unwrap();
        v1.verify().unwrap();

        let v2 = GroupRecord::build(uuid, "team", &owner, members(&owner), 2, 0, 1).unwrap();
        v2.verify_supersedes(&v1).unwrap();
        assert!(matches!(
            v1.verify_supersedes(&v2),
            Err(ProtoError::WrongVersion)
        ));
    }

    #[test]
    fn non_owner_mutation_is_rejected() {
        let owner = owner();
        let uuid = Uuid::new_v4();
        let v1 = GroupRecord::build(uuid, "team", &owner, members(&owner), 1, 0, 0).unwrap();

        let impostor = SigningKeyPair::from_seed(&[60u8; 32]).unwrap();
        let mut forged =
            GroupRecord::build(uuid, "team", &impostor, members(&owner), 2, 0, 1).unwrap();
        // Claim the real owner's fingerprint — the key binding must fail.
        forged.owner_fp = owner.fingerprint();
        assert!(matches!(
            forged.verify(),
            Err(ProtoError::FingerprintMismatch)
        ));
        assert!(forged.verify_supersedes(&v1).is_err());
    }

    #[test]
    fn group_message_roundtrip() {
        let sender = owner();
        let uuid = Uuid::new_v4();
        let key = gek(7);

        let bytes =
            seal_group_message(&uuid, 3, &key, &sender, 1_700_000_000, b"group hello").unwrap();
        let msg = GroupMessage::decode(&bytes).unwrap();
        assert_eq!(msg.gek_version, 3);
        assert_eq!(msg.sender_fp, sender.fingerprint());
        msg.verify_sender(sender.public()).unwrap();
        assert_eq!(&**msg.decrypt(&uuid, &key).unwrap(), b"group hello");
    }

    #[test]
    fn wrong_gek_or_group_fails_decrypt() {
        let sender = owner();
        let uuid = Uuid::new_v4();
        let bytes = seal_group_message(&uuid, 1, &gek(7), &sender, 0, b"x").unwrap();
        let msg = GroupMessage::decode(&bytes).unwrap();
        assert!(msg.decrypt(&uuid, &gek(8)).is_err());
        assert!(msg.decrypt(&Uuid::new_v4(), &gek(7)).is_err());
    }
}
