//! Initial Key Packet — GEK distribution.
//!
//! One IKP exists per (group, gek_version). Each member entry seals the
//! GEK to that member alone: a fresh ML-KEM-1024 encapsulation yields the
//! wrapping secret, and AES-256-GCM wraps the 32-byte GEK under it with
//! the entry index as nonce and `"ikp" ‖ group_uuid ‖ version` as AAD.
//!
//! ```text
//! magic(4)="DNAI" ‖ version(4 BE) ‖ n(2 BE)
//! ‖ [ fp(64) ‖ kem_ct(1568) ‖ wrap(48) ]*n ‖ owner_sig(4627)
//! ```
//!
//! `wrap` = 32-byte GEK ciphertext + 16-byte GCM tag.

use uuid::Uuid;
use zeroize::Zeroizing;

use dna_crypto::aead;
use dna_crypto::keys::{
    KemKeyPair, KemPublicKey, SigningKeyPair, SigningPublicKey, KEM_CIPHERTEXT_LEN, SIGNATURE_LEN,
};
use dna_crypto::Fingerprint;

use crate::error::ProtoError;
use crate::group::Gek;

pub const MAGIC: &[u8; 4] = b"DNAI";

const WRAP_LEN: usize = 32 + aead::TAG_LEN;
const ENTRY_LEN: usize = 64 + KEM_CIPHERTEXT_LEN + WRAP_LEN;
const FIXED_LEN: usize = 4 + 4 + 2;

fn ikp_aad(group: &Uuid, version: u32) -> Vec<u8> {
    let mut aad = Vec::with_capacity(3 + 16 + 4);
    aad.extend_from_slice(b"ikp");
    aad.extend_from_slice(group.as_bytes());
    aad.extend_from_slice(&version.to_be_bytes());
    aad
}

fn entry_nonce(index: u16) -> [u8; aead::NONCE_LEN] {
    let mut nonce = [0u8; aead::NONCE_LEN];
    nonce[aead::NONCE_LEN - 4..].copy_from_slice(&(index as u32).to_be_bytes());
    nonce
}

/// Build the IKP for an ordered member list. Entry order fixes the nonce
/// indices, so callers must pass the group record's member order.
pub fn build(
    group: &Uuid,
    version: u32,
    gek: &Gek,
    members: &[(Fingerprint, KemPublicKey)],
    owner: &SigningKeyPair,
) -> Result<Vec<u8>, ProtoError> {
    if members.is_empty() || members.len() > u16::MAX as usize {
        return Err(ProtoError::Malformed("member count out of range".into()));
    }
    let aad = ikp_aad(group, version);

    let mut out = Vec::with_capacity(FIXED_LEN + members.len() * ENTRY_LEN + SIGNATURE_LEN);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&version.to_be_bytes());
    out.extend_from_slice(&(members.len() as u16).to_be_bytes());

    for (index, (fp, kem_pub)) in members.iter().enumerate() {
        let (wrap_key, kem_ct) = kem_pub.encapsulate()?;
        let wrap = aead::encrypt(&wrap_key, &entry_nonce(index as u16), &**gek, &aad)?;
        debug_assert_eq!(wrap.len(), WRAP_LEN);
        out.extend_from_slice(fp.as_bytes());
        out.extend_from_slice(&kem_ct);
        out.extend_from_slice(&wrap);
    }

    let sig = owner.sign(&out)?;
    out.extend_from_slice(&sig);
    Ok(out)
}

/// The member fingerprints listed in an IKP, in entry order.
/// Structural read only — run `extract` or verify the signature before
/// trusting the list.
pub fn listed_members(bytes: &[u8]) -> Result<Vec<Fingerprint>, ProtoError> {
    let (count, _) = parse_header(bytes)?;
    let mut out = Vec::with_capacity(count);
    for index in 0..count {
        let start = FIXED_LEN + index * ENTRY_LEN;
        out.push(Fingerprint::from_bytes(&bytes[start..start + 64])?);
    }
    Ok(out)
}

fn parse_header(bytes: &[u8]) -> Result<(usize, u32), ProtoError> {
    if bytes.len() < FIXED_LEN + SIGNATURE_LEN {
        return Err(ProtoError::Malformed("IKP too short".into()));
    }
    if &bytes[0..4] != MAGIC {
        return Err(ProtoError::Malformed("bad IKP magic".into()));
    }
    let version = u32::from_be_bytes(bytes[4..8].try_into().unwrap());
    let count = u16::from_be_bytes(bytes[8..10].try_into().unwrap()) as usize;
    if bytes.len() != FIXED_LEN + count * ENTRY_LEN + SIGNATURE_LEN {
        return Err(ProtoError::Malformed("IKP length mismatch".into()));
    }
    Ok((count, version))
}

/// Locate our entry, verify the owner signature, decapsulate and unwrap.
/// Returns the GEK and the packet's version.
pub fn extract(
    bytes: &[u8],
    group: &Uuid,
    expected_version: Option<u32>,
    own_fp: &Fingerprint,
    own_kem: &KemKeyPair,
    owner_key: &SigningPublicKey,
) -> Result<(Gek, u32), ProtoError> {
    let (count, version) = parse_header(bytes)?;
    if let Some(expected) = expected_version {
        if version != expected {
            return Err(ProtoError::WrongVersion);
        }
    }

    let signed_len = FIXED_LEN + count * ENTRY_LEN;
    owner_key
        .verify(&bytes[..signed_len], &bytes[signed_len..])
        .map_err(|_| ProtoError::BadSignature)?;

    let aad = ikp_aad(group, version);
    for index in 0..count {
        let start = FIXED_LEN + index * ENTRY_LEN;
        let fp = Fingerprint::from_bytes(&bytes[start..start + 64])?;
        if !fp.ct_eq(own_fp) {
            continue;
        }
        let kem_ct = &bytes[start + 64..start + 64 + KEM_CIPHERTEXT_LEN];
        let wrap = &bytes[start + 64 + KEM_CIPHERTEXT_LEN..start + ENTRY_LEN];

        let wrap_key = own_kem.decapsulate(kem_ct)?;
        let plaintext = aead::decrypt(&wrap_key, &entry_nonce(index as u16), wrap, &aad)
            .map_err(|_| ProtoError::WrongVersion)?;
        let gek_bytes: [u8; 32] = plaintext
            .as_slice()
            .try_into()
            .map_err(|_| ProtoError::Malformed("wrapped GEK wrong length".into()))?;
        return Ok((Zeroizing::new(gek_bytes), version));
    }

    Err(ProtoError::NotMember)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Member {
        fp: Fingerprint,
        kem: KemKeyPair,
    }

    fn member(byte: u8) -> Member {
        let signing = SigningKeyPair::from_seed(&[byte; 32]).unwrap();
        Member {
            fp: signing.fingerprint(),
            kem: KemKeyPair::from_seed(&[byte + 100; 32]).unwrap(),
        }
    }

    fn gek() -> Gek {
        Zeroizing::new([0x5Au8; 32])
    }

    #[test]
    fn every_listed_member_extracts_the_same_gek() {
        let owner = SigningKeyPair::from_seed(&[1u8; 32]).unwrap();
        let group = Uuid::new_v4();
        let members: Vec<Member> = (10u8..13).map(member).collect();
        let list: Vec<(Fingerprint, KemPublicKey)> = members
            .iter()
            .map(|m| (m.fp, m.kem.public().clone()))
            .collect();

        let bytes = build(&group, 1, &gek(), &list, &owner).unwrap();
        assert_eq!(
            listed_members(&bytes).unwrap(),
            members.iter().map(|m| m.fp).collect::<Vec<_>>()
        );

        for m in &members {
            let (extracted, version) =
                extract(&bytes, &group, Some(1), &m.fp, &m.kem, owner.public()).unwrap();
            assert_eq!(*extracted, *gek());
            assert_eq!(version, 1);
        }
    }

    #[test]
    fn non_member_gets_not_member() {
        let owner = SigningKeyPair::from_seed(&[1u8; 32]).unwrap();
        let group = Uuid::new_v4();
        let m = member(10);
        let bytes = build(
            &group,
            1,
            &gek(),
            &[(m.fp, m.kem.public().clone())],
            &owner,
        )
        .unwrap();

        let outsider = member(42);
        assert!(matches!(
            extract(&bytes, &group, None, &outsider.fp, &outsider.kem, owner.public()),
            Err(ProtoError::NotMember)
        ));
    }

    #[test]
    fn forged_owner_signature_is_rejected() {
        let owner = SigningKeyPair::from_seed(&[1u8; 32]).unwrap();
        let impostor = SigningKeyPair::from_seed(&[2u8; 32]).unwrap();
        let group = Uuid::new_v4();
        let m = member(10);
        let bytes = build(
            &group,
            1,
            &gek(),
            &[(m.fp, m.kem.public().clone())],
            &impostor,
        )
        .unwrap();

        assert!(matches!(
            extract(&bytes, &group, None, &m.fp, &m.kem, owner.public()),
            Err(ProtoError::BadSignature)
        ));
    }

    #[test]
    fn version_and_aad_mismatches() {
        let owner = SigningKeyPair::from_seed(&[1u8; 32]).unwrap();
        let group = Uuid::new_v4();
        let m = member(10);
        let bytes = build(
            &group,
            2,
            &gek(),
            &[(m.fp, m.kem.public().clone())],
            &owner,
        )
        .unwrap();

        // Expected-version mismatch short-circuits.
        assert!(matches!(
            extract(&bytes, &group, Some(3), &m.fp, &m.kem, owner.public()),
            Err(ProtoError::WrongVersion)
        ));
        // Wrong group breaks the wrap AAD after signature passes.
        assert!(matches!(
            extract(&bytes, &Uuid::new_v4(), Some(2), &m.fp, &m.kem, owner.public()),
            Err(ProtoError::WrongVersion)
        ));
    }

    #[test]
    fn truncation_is_malformed() {
        let owner = SigningKeyPair::from_seed(&[1u8; 32]).unwrap();
        let group = Uuid::new_v4();
        let m = member(10);
        let bytes = build(
            &group,
            1,
            &gek(),
            &[(m.fp, m.kem.public().clone())],
            &owner,
        )
        .unwrap();
        assert!(matches!(
            extract(&bytes[..bytes.len() - 1], &group, None, &m.fp, &m.kem, owner.public()),
            Err(ProtoError::Malformed(_))
        ));
    }
}
