//! Outbox bucket entries, ACK records and contact requests.
//!
//! An outbox entry is what the sender appends to its own per-day bucket:
//! the sealed envelope plus routing fields, under an outer detached
//! signature so a recipient can discard forgeries before paying for a
//! KEM decapsulation.
//!
//! Entry encoding:
//!
//! ```text
//! recipient_fp(64) ‖ seq_num(8 BE) ‖ ct_len(4 BE) ‖ ciphertext ‖ sig(4627)
//! ```

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use dna_crypto::keys::{SigningKeyPair, SigningPublicKey, SIGNATURE_LEN};
use dna_crypto::Fingerprint;

use crate::error::ProtoError;

/// Seconds per outbox day bucket.
pub const SECS_PER_DAY: i64 = 86_400;

/// The bucket index a wall-clock second falls into.
pub fn day_index(unix_secs: i64) -> u64 {
    (unix_secs / SECS_PER_DAY).max(0) as u64
}

// ── Outbox entry ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxEntry {
    pub recipient_fp: Fingerprint,
    pub seq_num: u64,
    /// Sealed DM envelope bytes (`envelope` module).
    pub ciphertext: Vec<u8>,
}

impl OutboxEntry {
    fn signing_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + 8 + 4 + self.ciphertext.len());
        out.extend_from_slice(self.recipient_fp.as_bytes());
        out.extend_from_slice(&self.seq_num.to_be_bytes());
        out.extend_from_slice(&(self.ciphertext.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.ciphertext);
        out
    }

    /// Encode with the sender's outer signature appended.
    pub fn encode_signed(&self, sender: &SigningKeyPair) -> Result<Vec<u8>, ProtoError> {
        let mut out = self.signing_payload();
        let sig = sender.sign(&out)?;
        out.extend_from_slice(&sig);
        Ok(out)
    }

    /// Decode and verify the outer signature against the sender's key.
    pub fn decode_verified(
        bytes: &[u8],
        sender_key: &SigningPublicKey,
    ) -> Result<Self, ProtoError> {
        let entry = Self::decode_unverified(bytes)?;
        let payload_len = bytes.len() - SIGNATURE_LEN;
        sender_key
            .verify(&bytes[..payload_len], &bytes[payload_len..])
            .map_err(|_| ProtoError::BadSignature)?;
        Ok(entry)
    }

    /// Structural decode only. The sweep uses this to read routing fields
    /// before it has resolved the sender's identity record.
    pub fn decode_unverified(bytes: &[u8]) -> Result<Self, ProtoError> {
        const FIXED: usize = 64 + 8 + 4;
        if bytes.len() < FIXED + SIGNATURE_LEN {
            return Err(ProtoError::Malformed("outbox entry too short".into()));
        }
        let recipient_fp = Fingerprint::from_bytes(&bytes[0..64])?;
        let seq_num = u64::from_be_bytes(bytes[64..72].try_into().unwrap());
        let ct_len = u32::from_be_bytes(bytes[72..76].try_into().unwrap()) as usize;
        if bytes.len() != FIXED + ct_len + SIGNATURE_LEN {
            return Err(ProtoError::Malformed("outbox entry length mismatch".into()));
        }
        Ok(Self {
            recipient_fp,
            seq_num,
            ciphertext: bytes[FIXED..FIXED + ct_len].to_vec(),
        })
    }
}

// ── ACK record ───────────────────────────────────────────────────────────────

/// Declares the highest contiguously-stored seq_num a recipient has seen
/// from a sender. Idempotent: later ACKs supersede earlier ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckRecord {
    /// Whose outbox is being acknowledged.
    pub sender_fp: Fingerprint,
    /// Who observed the messages and signs this record.
    pub recipient_fp: Fingerprint,
    pub seq_num: u64,
    pub timestamp: i64,
    pub signature: String,
}

impl AckRecord {
    pub fn build(
        sender_fp: Fingerprint,
        recipient: &SigningKeyPair,
        seq_num: u64,
        now: i64,
    ) -> Result<Self, ProtoError> {
        let mut record = Self {
            sender_fp,
            recipient_fp: recipient.fingerprint(),
            seq_num,
            timestamp: now,
            signature: String::new(),
        };
        let sig = recipient.sign(&record.canonical_bytes()?)?;
        record.signature = B64.encode(sig);
        Ok(record)
    }

    fn canonical_bytes(&self) -> Result<Vec<u8>, ProtoError> {
        let canonical = serde_json::json!({
            "recipient_fp": self.recipient_fp,
            "sender_fp": self.sender_fp,
            "seq_num": self.seq_num,
            "timestamp": self.timestamp,
        });
        Ok(serde_json::to_vec(&canonical)?)
    }

    /// Verify against the recipient's signing key.
    pub fn verify(&self, recipient_key: &SigningPublicKey) -> Result<(), ProtoError> {
        if !recipient_key.fingerprint().ct_eq(&self.recipient_fp) {
            return Err(ProtoError::FingerprintMismatch);
        }
        let sig = B64
            .decode(&self.signature)
            .map_err(|_| ProtoError::Malformed("signature not base64".into()))?;
        dna_crypto::keys::verify_detached(
            recipient_key.as_bytes(),
            &self.canonical_bytes()?,
            &sig,
        )
        .map_err(|_| ProtoError::BadSignature)
    }
}

// ── Contact request ──────────────────────────────────────────────────────────

/// A knock on someone's door: published to the recipient's request channel,
/// verified two-hop through the requester's identity record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactRequest {
    pub from_fp: Fingerprint,
    pub display_name: String,
    pub greeting: String,
    pub timestamp: i64,
    pub signature: String,
}

impl ContactRequest {
    pub const GREETING_MAX: usize = 256;

    pub fn build(
        requester: &SigningKeyPair,
        display_name: &str,
        greeting: &str,
        now: i64,
    ) -> Result<Self, ProtoError> {
        if greeting.len() > Self::GREETING_MAX {
            return Err(ProtoError::Malformed("greeting too long".into()));
        }
        let mut record = Self {
            from_fp: requester.fingerprint(),
            display_name: display_name.to_string(),
            greeting: greeting.to_string(),
            timestamp: now,
            signature: String::new(),
        };
        let sig = requester.sign(&record.canonical_bytes()?)?;
        record.signature = B64.encode(sig);
        Ok(record)
    }

    fn canonical_bytes(&self) -> Result<Vec<u8>, ProtoError> {
        let canonical = serde_json::json!({
            "display_name": self.display_name,
            "from_fp": self.from_fp,
            "greeting": self.greeting,
            "timestamp": self.timestamp,
        });
        Ok(serde_json::to_vec(&canonical)?)
    }

    pub fn verify(&self, requester_key: &SigningPublicKey) -> Result<(), ProtoError> {
        if !requester_key.fingerprint().ct_eq(&self.from_fp) {
            return Err(ProtoError::FingerprintMismatch);
        }
        let sig = B64
            .decode(&self.signature)
            .map_err(|_| ProtoError::Malformed("signature not base64".into()))?;
        dna_crypto::keys::verify_detached(
            requester_key.as_bytes(),
            &self.canonical_bytes()?,
            &sig,
        )
        .map_err(|_| ProtoError::BadSignature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn day_index_boundaries() {
        assert_eq!(day_index(0), 0);
        assert_eq!(day_index(SECS_PER_DAY - 1), 0);
        assert_eq!(day_index(SECS_PER_DAY), 1);
        assert_eq!(day_index(-5), 0);
    }

    #[test]
    fn entry_roundtrip_and_forgery_rejection() {
        let sender = SigningKeyPair::from_seed(&[1u8; 32]).unwrap();
        let entry = OutboxEntry {
            recipient_fp: Fingerprint::of_signing_key(b"recipient"),
            seq_num: 42,
            ciphertext: vec![0xAB; 100],
        };
        let bytes = entry.encode_signed(&sender).unwrap();
        let decoded = OutboxEntry::decode_verified(&bytes, sender.public()).unwrap();
        assert_eq!(decoded, entry);

        let forger = SigningKeyPair::from_seed(&[2u8; 32]).unwrap();
        assert!(matches!(
            OutboxEntry::decode_verified(&bytes, forger.public()),
            Err(ProtoError::BadSignature)
        ));

        let mut tampered = bytes.clone();
        tampered[64] ^= 0x01; // seq_num byte
        assert!(OutboxEntry::decode_verified(&tampered, sender.public()).is_err());
    }

    #[test]
    fn ack_roundtrip() {
        let recipient = SigningKeyPair::from_seed(&[3u8; 32]).unwrap();
        let sender_fp = Fingerprint::of_signing_key(b"sender");
        let ack = AckRecord::build(sender_fp, &recipient, 7, 1_700_000_000).unwrap();
        ack.verify(recipient.public()).unwrap();

        let mut forged = ack.clone();
        forged.seq_num = 99;
        assert!(forged.verify(recipient.public()).is_err());
    }

    #[test]
    fn contact_request_roundtrip() {
        let requester = SigningKeyPair::from_seed(&[4u8; 32]).unwrap();
        let req = ContactRequest::build(&requester, "carol", "hello there", 1_700_000_000).unwrap();
        req.verify(requester.public()).unwrap();

        let other = SigningKeyPair::from_seed(&[5u8; 32]).unwrap();
        assert!(req.verify(other.public()).is_err());
    }
}
