//! Shared service context: config, DHT handle, store, key vault.
//!
//! Every background task and verb body works through a cloned `Services`;
//! DHT calls go through the deadline helpers so no caller forgets the
//! timeout policy.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dna_dht::{Dht, DhtEntry, SignedRecord};
use dna_store::Store;

use crate::config::EngineConfig;
use crate::error::ErrorKind;
use crate::identity::KeyVault;

pub(crate) fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[derive(Clone)]
pub(crate) struct Services {
    pub config: Arc<EngineConfig>,
    pub dht: Arc<dyn Dht>,
    pub store: Store,
    pub vault: KeyVault,
}

impl Services {
    /// DHT get under the configured deadline.
    pub async fn dht_get(&self, key: &[u8]) -> Result<Vec<DhtEntry>, ErrorKind> {
        let deadline = Duration::from_secs(self.config.dht_get_timeout_secs);
        tokio::time::timeout(deadline, self.dht.get(key))
            .await
            .map_err(|_| ErrorKind::Timeout)?
            .map_err(ErrorKind::from)
    }

    /// Signed DHT put under the configured deadline.
    pub async fn dht_put_signed(&self, record: SignedRecord) -> Result<(), ErrorKind> {
        let deadline = Duration::from_secs(self.config.dht_put_timeout_secs);
        tokio::time::timeout(deadline, self.dht.put_signed(record))
            .await
            .map_err(|_| ErrorKind::Timeout)?
            .map_err(ErrorKind::from)
    }
}
