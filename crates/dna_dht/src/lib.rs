//! dna_dht — the DHT contract the messaging core consumes.
//!
//! The network DHT itself is an external collaborator; the core talks to
//! it only through the [`Dht`] trait: signed puts with replacement
//! semantics (`value_id`), multi-value gets, and prefix subscriptions.
//! The core never trusts unsigned values for identity, presence, name
//! index, GEK, IKP or ACK channels — [`SignedRecord`] carries the signer
//! pubkey and an ML-DSA signature over `key ‖ value ‖ value_id ‖ ttl`.
//!
//! [`MemoryDht`] is the in-process implementation used by every
//! integration test, and the reference semantics for network adapters.

pub mod memory;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use dna_crypto::keys::{verify_detached, SigningKeyPair};

pub use memory::MemoryDht;

/// DHT keys are raw bytes (SHA3-512 outputs in this protocol); a prefix
/// of a key addresses a subscription.
pub type DhtKey = Vec<u8>;

#[derive(Debug, Error)]
pub enum DhtError {
    #[error("DHT is not ready")]
    NotReady,

    #[error("DHT operation timed out")]
    Timeout,

    #[error("Record signature rejected")]
    BadSignature,

    #[error("DHT failure: {0}")]
    Unavailable(String),
}

/// One stored value at a key.
#[derive(Debug, Clone)]
pub struct DhtEntry {
    pub value: Vec<u8>,
    pub value_id: u64,
    /// ML-DSA public key of the signer; `None` for plain puts.
    pub signer_pubkey: Option<Vec<u8>>,
    /// Absolute expiry, seconds since epoch.
    pub expires_at: i64,
}

/// Change notification delivered to subscribers.
#[derive(Debug, Clone)]
pub struct DhtEvent {
    pub key: DhtKey,
    pub entry: DhtEntry,
}

/// Live subscription. Dropping the handle unsubscribes.
pub struct Subscription {
    pub id: u64,
    pub events: mpsc::UnboundedReceiver<DhtEvent>,
}

/// A signed, replaceable record. Two puts by the same signer with the
/// same `value_id` replace each other; distinct signers coexist.
#[derive(Debug, Clone)]
pub struct SignedRecord {
    pub key: DhtKey,
    pub value: Vec<u8>,
    pub value_id: u64,
    pub ttl_secs: u64,
    pub signer_pubkey: Vec<u8>,
    pub signature: Vec<u8>,
}

impl SignedRecord {
    fn signing_payload(
        key: &[u8],
        value: &[u8],
        value_id: u64,
        ttl_secs: u64,
    ) -> Vec<u8> {
        let mut out = Vec::with_capacity(key.len() + value.len() + 16);
        out.extend_from_slice(key);
        out.extend_from_slice(value);
        out.extend_from_slice(&value_id.to_be_bytes());
        out.extend_from_slice(&ttl_secs.to_be_bytes());
        out
    }

    /// Sign a record with the local identity key.
    pub fn create(
        key: DhtKey,
        value: Vec<u8>,
        value_id: u64,
        ttl_secs: u64,
        signer: &SigningKeyPair,
    ) -> Result<Self, DhtError> {
        let payload = Self::signing_payload(&key, &value, value_id, ttl_secs);
        let signature = signer
            .sign(&payload)
            .map_err(|e| DhtError::Unavailable(e.to_string()))?;
        Ok(Self {
            key,
            value,
            value_id,
            ttl_secs,
            signer_pubkey: signer.public().as_bytes().to_vec(),
            signature,
        })
    }

    /// Verify the embedded signature.
    pub fn verify(&self) -> Result<(), DhtError> {
        let payload =
            Self::signing_payload(&self.key, &self.value, self.value_id, self.ttl_secs);
        verify_detached(&self.signer_pubkey, &payload, &self.signature)
            .map_err(|_| DhtError::BadSignature)
    }
}

/// The store the messaging core runs on.
#[async_trait]
pub trait Dht: Send + Sync {
    /// Append an unsigned value. Only opaque front-end channels use this;
    /// every core record goes through `put_signed`.
    async fn put(&self, key: DhtKey, value: Vec<u8>, ttl_secs: u64) -> Result<(), DhtError>;

    /// Store a signed record with replacement semantics.
    async fn put_signed(&self, record: SignedRecord) -> Result<(), DhtError>;

    /// All live values at a key. Unknown keys yield an empty list.
    async fn get(&self, key: &[u8]) -> Result<Vec<DhtEntry>, DhtError>;

    /// Notifications for every subsequent put under keys starting with
    /// `prefix`.
    async fn subscribe(&self, prefix: DhtKey) -> Result<Subscription, DhtError>;

    fn is_ready(&self) -> bool;
}
