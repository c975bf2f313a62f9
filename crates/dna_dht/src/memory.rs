//! In-process DHT with the full contract semantics: signed-put
//! verification, per-signer value-id replacement, TTL expiry and prefix
//! subscriptions. Insertion order is preserved per key — the first
//! accepted record wins a same-slot race, which is what the group
//! engine's rotation conflict detection relies on.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::{Dht, DhtEntry, DhtError, DhtEvent, DhtKey, SignedRecord, Subscription};

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

struct Stored {
    entry: DhtEntry,
}

struct Subscriber {
    id: u64,
    prefix: Vec<u8>,
    tx: mpsc::UnboundedSender<DhtEvent>,
}

#[derive(Default)]
struct State {
    records: BTreeMap<Vec<u8>, Vec<Stored>>,
    subscribers: Vec<Subscriber>,
}

/// Shared in-memory DHT. Clones address the same store.
#[derive(Clone)]
pub struct MemoryDht {
    state: Arc<Mutex<State>>,
    next_sub_id: Arc<AtomicU64>,
    ready: Arc<AtomicBool>,
}

impl Default for MemoryDht {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDht {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            next_sub_id: Arc::new(AtomicU64::new(1)),
            ready: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Simulate an outage for listener-backoff tests.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    fn insert(&self, key: DhtKey, entry: DhtEntry) {
        let mut state = self.state.lock().expect("dht state lock");
        let now = now_secs();
        let values = state.records.entry(key.clone()).or_default();
        values.retain(|s| s.entry.expires_at > now);

        // Same signer + same value_id replaces in place.
        let replaced = values.iter_mut().any(|stored| {
            if stored.entry.value_id == entry.value_id
                && stored.entry.signer_pubkey == entry.signer_pubkey
            {
                stored.entry = entry.clone();
                true
            } else {
                false
            }
        });
        if !replaced {
            values.push(Stored {
                entry: entry.clone(),
            });
        }

        // Fan out, dropping hung-up subscribers.
        state.subscribers.retain(|sub| {
            if key.starts_with(&sub.prefix) {
                sub.tx
                    .send(DhtEvent {
                        key: key.clone(),
                        entry: entry.clone(),
                    })
                    .is_ok()
            } else {
                true
            }
        });
    }

    fn check_ready(&self) -> Result<(), DhtError> {
        if self.ready.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DhtError::NotReady)
        }
    }
}

#[async_trait]
impl Dht for MemoryDht {
    async fn put(&self, key: DhtKey, value: Vec<u8>, ttl_secs: u64) -> Result<(), DhtError> {
        self.check_ready()?;
        self.insert(
            key,
            DhtEntry {
                value,
                value_id: 0,
                signer_pubkey: None,
                expires_at: now_secs() + ttl_secs as i64,
            },
        );
        Ok(())
    }

    async fn put_signed(&self, record: SignedRecord) -> Result<(), DhtError> {
        self.check_ready()?;
        record.verify().map_err(|e| {
            debug!(key = %hex::encode(&record.key[..record.key.len().min(8)]), "rejected signed put");
            e
        })?;
        let expires_at = now_secs() + record.ttl_secs as i64;
        self.insert(
            record.key,
            DhtEntry {
                value: record.value,
                value_id: record.value_id,
                signer_pubkey: Some(record.signer_pubkey),
                expires_at,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &[u8]) -> Result<Vec<DhtEntry>, DhtError> {
        self.check_ready()?;
        let mut state = self.state.lock().expect("dht state lock");
        let now = now_secs();
        match state.records.get_mut(key) {
            Some(values) => {
                values.retain(|s| s.entry.expires_at > now);
                Ok(values.iter().map(|s| s.entry.clone()).collect())
            }
            None => Ok(Vec::new()),
        }
    }

    async fn subscribe(&self, prefix: DhtKey) -> Result<Subscription, DhtError> {
        self.check_ready()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_sub_id.fetch_add(1, Ordering::SeqCst);
        self.state
            .lock()
            .expect("dht state lock")
            .subscribers
            .push(Subscriber { id, prefix, tx });
        Ok(Subscription { id, events: rx })
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}
