//! DHT key derivations.
//!
//! Every channel key is `SHA3-512(domain-tag ‖ fields)`, 64 raw bytes.
//! Keeping the derivations in one place keeps the tag set auditable.

use sha3::{Digest, Sha3_512};
use uuid::Uuid;

use dna_crypto::Fingerprint;

pub const KEY_LEN: usize = 64;

fn hash(parts: &[&[u8]]) -> [u8; KEY_LEN] {
    let mut hasher = Sha3_512::new();
    for part in parts {
        hasher.update(part);
    }
    let mut out = [0u8; KEY_LEN];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// Identity record location: `H(signing_pubkey)`.
pub fn identity(signing_pubkey: &[u8]) -> [u8; KEY_LEN] {
    hash(&[signing_pubkey])
}

/// Name index: `H("name:" ‖ lowercase(name))`.
pub fn name_index(normalized_name: &str) -> [u8; KEY_LEN] {
    hash(&[b"name:", normalized_name.as_bytes()])
}

/// Presence: `H("presence" ‖ fp)`.
pub fn presence(fp: &Fingerprint) -> [u8; KEY_LEN] {
    hash(&[b"presence", fp.as_bytes()])
}

/// Sender-owned daily DM outbox bucket: `H("dm_outbox" ‖ sender_fp ‖ day)`.
pub fn dm_outbox(sender: &Fingerprint, day: u64) -> [u8; KEY_LEN] {
    hash(&[b"dm_outbox", sender.as_bytes(), &day.to_be_bytes()])
}

/// ACK channel recipient→sender: `H("ack" ‖ sender_fp ‖ recipient_fp)`.
pub fn ack(sender: &Fingerprint, recipient: &Fingerprint) -> [u8; KEY_LEN] {
    hash(&[b"ack", sender.as_bytes(), recipient.as_bytes()])
}

/// Initial Key Packet: `H("ikp" ‖ group_uuid ‖ gek_version)`.
pub fn ikp(group: &Uuid, version: u32) -> [u8; KEY_LEN] {
    hash(&[b"ikp", group.as_bytes(), &version.to_be_bytes()])
}

/// Group metadata record: `H("group" ‖ group_uuid)`.
pub fn group(group: &Uuid) -> [u8; KEY_LEN] {
    hash(&[b"group", group.as_bytes()])
}

/// Daily group message channel: `H("gmsg" ‖ group_uuid ‖ day)`.
pub fn group_messages(group: &Uuid, day: u64) -> [u8; KEY_LEN] {
    hash(&[b"gmsg", group.as_bytes(), &day.to_be_bytes()])
}

/// Pending contact requests for a recipient: `H("creq" ‖ recipient_fp)`.
pub fn contact_requests(recipient: &Fingerprint) -> [u8; KEY_LEN] {
    hash(&[b"creq", recipient.as_bytes()])
}

/// Owner-encrypted contact-list backup: `H("backup" ‖ fp)`.
pub fn contact_backup(owner: &Fingerprint) -> [u8; KEY_LEN] {
    hash(&[b"backup", owner.as_bytes()])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channels_are_domain_separated() {
        let fp = Fingerprint::of_signing_key(b"pk");
        let other = Fingerprint::of_signing_key(b"pk2");
        assert_ne!(presence(&fp), contact_requests(&fp));
        assert_ne!(dm_outbox(&fp, 1), dm_outbox(&fp, 2));
        assert_ne!(dm_outbox(&fp, 1), dm_outbox(&other, 1));
        // ACK direction matters: ack(A→B) readers differ from ack(B→A).
        assert_ne!(ack(&fp, &other), ack(&other, &fp));
    }
}
