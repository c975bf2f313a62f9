//! Sealed direct-message envelope — what the DHT sees for a DM.
//!
//! Byte-exact wire format:
//!
//! ```text
//! magic(4)="DNAM" ‖ version(1)=0x02 ‖ sender_fp(64) ‖ recipient_fp(64)
//! ‖ seq_num(8 BE) ‖ timestamp(8 BE) ‖ kem_ct(1568) ‖ nonce(12)
//! ‖ AES-256-GCM(K_session, nonce, aad, plaintext ‖ inner_sig) ‖ tag(16)
//! ```
//!
//! AAD = `"dna.dm" ‖ version ‖ sender_fp`. The inner signature is the
//! sender's detached ML-DSA-87 signature over the plaintext alone, so
//! attribution survives even if the outer transport record is re-wrapped.
//!
//! Opening is two-phase: `open()` needs only the recipient's KEM key and
//! yields the plaintext plus the unverified inner signature;
//! `OpenedEnvelope::verify_sender()` checks it against the sender's
//! signing key once the identity record is at hand.

use dna_crypto::aead;
use dna_crypto::keys::{
    KemKeyPair, KemPublicKey, SigningKeyPair, SigningPublicKey, KEM_CIPHERTEXT_LEN, SIGNATURE_LEN,
};
use dna_crypto::Fingerprint;
use zeroize::Zeroizing;

use crate::error::ProtoError;

pub const MAGIC: &[u8; 4] = b"DNAM";
pub const VERSION: u8 = 0x02;

const AAD_TAG: &[u8] = b"dna.dm";
const HEADER_LEN: usize = 4 + 1 + 64 + 64 + 8 + 8;
const MIN_LEN: usize = HEADER_LEN + KEM_CIPHERTEXT_LEN + aead::NONCE_LEN + aead::TAG_LEN;

fn build_aad(sender_fp: &Fingerprint) -> Vec<u8> {
    let mut aad = Vec::with_capacity(AAD_TAG.len() + 1 + 64);
    aad.extend_from_slice(AAD_TAG);
    aad.push(VERSION);
    aad.extend_from_slice(sender_fp.as_bytes());
    aad
}

/// Seal a plaintext to one recipient.
pub fn seal(
    sender: &SigningKeyPair,
    recipient_fp: &Fingerprint,
    recipient_kem: &KemPublicKey,
    seq_num: u64,
    timestamp: i64,
    plaintext: &[u8],
) -> Result<Vec<u8>, ProtoError> {
    let sender_fp = sender.fingerprint();
    let (session_key, kem_ct) = recipient_kem.encapsulate()?;
    let nonce = aead::random_nonce();

    let inner_sig = sender.sign(plaintext)?;
    let mut inner = Zeroizing::new(Vec::with_capacity(plaintext.len() + inner_sig.len()));
    inner.extend_from_slice(plaintext);
    inner.extend_from_slice(&inner_sig);

    let ciphertext = aead::encrypt(&session_key, &nonce, &inner, &build_aad(&sender_fp))?;

    let mut out = Vec::with_capacity(MIN_LEN + plaintext.len() + SIGNATURE_LEN);
    out.extend_from_slice(MAGIC);
    out.push(VERSION);
    out.extend_from_slice(sender_fp.as_bytes());
    out.extend_from_slice(recipient_fp.as_bytes());
    out.extend_from_slice(&seq_num.to_be_bytes());
    out.extend_from_slice(&timestamp.to_be_bytes());
    out.extend_from_slice(&kem_ct);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Envelope header fields, readable without any key material.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvelopeHeader {
    pub sender_fp: Fingerprint,
    pub recipient_fp: Fingerprint,
    pub seq_num: u64,
    pub timestamp: i64,
}

/// Parse the cleartext header; used by the sweep to filter before decrypting.
pub fn peek_header(bytes: &[u8]) -> Result<EnvelopeHeader, ProtoError> {
    if bytes.len() < MIN_LEN {
        return Err(ProtoError::Malformed("envelope too short".into()));
    }
    if &bytes[0..4] != MAGIC {
        return Err(ProtoError::Malformed("bad envelope magic".into()));
    }
    if bytes[4] != VERSION {
        return Err(ProtoError::WrongVersion);
    }
    Ok(EnvelopeHeader {
        sender_fp: Fingerprint::from_bytes(&bytes[5..69])?,
        recipient_fp: Fingerprint::from_bytes(&bytes[69..133])?,
        seq_num: u64::from_be_bytes(bytes[133..141].try_into().unwrap()),
        timestamp: i64::from_be_bytes(bytes[141..149].try_into().unwrap()),
    })
}

/// A decrypted envelope whose inner signature is not yet checked.
pub struct OpenedEnvelope {
    pub header: EnvelopeHeader,
    pub plaintext: Zeroizing<Vec<u8>>,
    inner_sig: Vec<u8>,
}

impl OpenedEnvelope {
    /// Verify the inner signature against the sender's signing key.
    /// A mismatching key is an integrity failure, never retried.
    pub fn verify_sender(&self, sender_key: &SigningPublicKey) -> Result<(), ProtoError> {
        if !sender_key.fingerprint().ct_eq(&self.header.sender_fp) {
            return Err(ProtoError::FingerprintMismatch);
        }
        sender_key
            .verify(&self.plaintext, &self.inner_sig)
            .map_err(|_| ProtoError::BadSignature)
    }
}

/// Unwrap the KEM, authenticate and decrypt, split plaintext from the
/// inner signature.
pub fn open(bytes: &[u8], own_kem: &KemKeyPair) -> Result<OpenedEnvelope, ProtoError> {
    let header = peek_header(bytes)?;

    let kem_ct = &bytes[HEADER_LEN..HEADER_LEN + KEM_CIPHERTEXT_LEN];
    let nonce_start = HEADER_LEN + KEM_CIPHERTEXT_LEN;
    let nonce: [u8; aead::NONCE_LEN] = bytes[nonce_start..nonce_start + aead::NONCE_LEN]
        .try_into()
        .unwrap();
    let ciphertext = &bytes[nonce_start + aead::NONCE_LEN..];

    let session_key = own_kem.decapsulate(kem_ct)?;
    let inner = aead::decrypt(
        &session_key,
        &nonce,
        ciphertext,
        &build_aad(&header.sender_fp),
    )
    .map_err(|_| ProtoError::DecryptFailure)?;

    if inner.len() < SIGNATURE_LEN {
        return Err(ProtoError::Malformed("inner payload shorter than signature".into()));
    }
    let split = inner.len() - SIGNATURE_LEN;
    let plaintext = Zeroizing::new(inner[..split].to_vec());
    let inner_sig = inner[split..].to_vec();

    Ok(OpenedEnvelope {
        header,
        plaintext,
        inner_sig,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Party {
        signing: SigningKeyPair,
        kem: KemKeyPair,
    }

    fn party(byte: u8) -> Party {
        Party {
            signing: SigningKeyPair::from_seed(&[byte; 32]).unwrap(),
            kem: KemKeyPair::from_seed(&[byte + 1; 32]).unwrap(),
        }
    }

    #[test]
    fn seal_open_roundtrip_with_attribution() {
        let bob = party(20);
        let alice = party(30);
        let alice_fp = alice.signing.fingerprint();

        let bytes = seal(
            &bob.signing,
            &alice_fp,
            alice.kem.public(),
            1,
            1_700_000_000,
            b"hi",
        )
        .unwrap();

        let header = peek_header(&bytes).unwrap();
        assert_eq!(header.sender_fp, bob.signing.fingerprint());
        assert_eq!(header.recipient_fp, alice_fp);
        assert_eq!(header.seq_num, 1);

        let opened = open(&bytes, &alice.kem).unwrap();
        assert_eq!(&**opened.plaintext, b"hi");
        opened.verify_sender(bob.signing.public()).unwrap();
    }

    #[test]
    fn wrong_sender_key_fails_attribution() {
        let bob = party(20);
        let alice = party(30);
        let eve = party(40);

        let bytes = seal(
            &bob.signing,
            &alice.signing.fingerprint(),
            alice.kem.public(),
            1,
            0,
            b"hi",
        )
        .unwrap();
        let opened = open(&bytes, &alice.kem).unwrap();
        assert!(opened.verify_sender(eve.signing.public()).is_err());
    }

    #[test]
    fn sender_fp_tampering_breaks_aad() {
        let bob = party(20);
        let alice = party(30);

        let mut bytes = seal(
            &bob.signing,
            &alice.signing.fingerprint(),
            alice.kem.public(),
            1,
            0,
            b"hi",
        )
        .unwrap();
        bytes[5] ^= 0xff; // first byte of sender_fp
        assert!(open(&bytes, &alice.kem).is_err());
    }

    #[test]
    fn truncated_envelope_is_malformed() {
        assert!(matches!(
            peek_header(b"DNAM\x02short"),
            Err(ProtoError::Malformed(_))
        ));
    }
}
