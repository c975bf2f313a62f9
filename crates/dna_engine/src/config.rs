//! Engine configuration, TOML-loadable with serde defaults for every
//! knob so a partial file (or none at all) still yields a working engine.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root of the on-disk layout (`keys/`, `messages.db`, `cache/`, `logs/`).
    pub data_dir: PathBuf,

    /// Permit key files with the private section in the clear. Off by
    /// default; identity creation without a password fails unless set.
    pub allow_unencrypted_keys: bool,

    pub dht_get_timeout_secs: u64,
    pub dht_put_timeout_secs: u64,

    /// Smart-sync windows (days of outbox buckets to scan).
    pub recent_sync_days: u64,
    pub full_sync_days: u64,

    pub outbox_ttl_secs: u64,
    pub identity_ttl_secs: u64,
    pub ikp_ttl_secs: u64,
    pub group_msg_ttl_secs: u64,
    pub ack_ttl_secs: u64,
    pub contact_request_ttl_secs: u64,

    pub presence_period_secs: u64,
    pub presence_ttl_secs: u64,

    /// Delivery retry policy: exponential backoff base/cap, queue tick.
    pub retry_base_secs: u64,
    pub retry_cap_secs: u64,
    pub retry_tick_secs: u64,

    /// Upper bound on concurrent ACK publications per sweep.
    pub ack_parallelism: usize,

    /// Worker pool size; 0 means `min(8, 2 * cpus)`.
    pub worker_concurrency: usize,

    /// Listener reconnect backoff bounds.
    pub listener_backoff_base_secs: u64,
    pub listener_backoff_cap_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            allow_unencrypted_keys: false,
            dht_get_timeout_secs: 10,
            dht_put_timeout_secs: 30,
            recent_sync_days: 3,
            full_sync_days: 8,
            outbox_ttl_secs: 8 * 86_400,
            identity_ttl_secs: 30 * 86_400,
            ikp_ttl_secs: 30 * 86_400,
            group_msg_ttl_secs: 8 * 86_400,
            ack_ttl_secs: 8 * 86_400,
            contact_request_ttl_secs: 8 * 86_400,
            presence_period_secs: 60,
            presence_ttl_secs: 7 * 86_400,
            retry_base_secs: 5,
            retry_cap_secs: 900,
            retry_tick_secs: 5,
            ack_parallelism: 8,
            worker_concurrency: 0,
            listener_backoff_base_secs: 1,
            listener_backoff_cap_secs: 60,
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("dna-messenger")
}

impl EngineConfig {
    /// Defaults rooted at an explicit data directory.
    pub fn for_data_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: dir.into(),
            ..Self::default()
        }
    }

    /// Load from a TOML file; missing keys fall back to defaults.
    pub fn load(path: &Path) -> Result<Self, ErrorKind> {
        let text = std::fs::read_to_string(path).map_err(|_| ErrorKind::InvalidArgument)?;
        toml::from_str(&text).map_err(|_| ErrorKind::InvalidArgument)
    }

    pub fn keys_dir(&self) -> PathBuf {
        self.data_dir.join("keys")
    }

    pub fn signing_key_path(&self) -> PathBuf {
        self.keys_dir().join("identity.dsa")
    }

    pub fn kem_key_path(&self) -> PathBuf {
        self.keys_dir().join("identity.kem")
    }

    pub fn mnemonic_path(&self) -> PathBuf {
        self.keys_dir().join("identity.mnem")
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("messages.db")
    }

    pub fn gek_cache_dir(&self) -> PathBuf {
        self.data_dir.join("cache").join("gek")
    }

    pub fn resolved_worker_concurrency(&self) -> usize {
        if self.worker_concurrency > 0 {
            self.worker_concurrency
        } else {
            (2 * num_cpus::get()).min(8).max(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg: EngineConfig =
            toml::from_str("data_dir = \"/tmp/x\"\nretry_base_secs = 1\n").unwrap();
        assert_eq!(cfg.data_dir, PathBuf::from("/tmp/x"));
        assert_eq!(cfg.retry_base_secs, 1);
        assert_eq!(cfg.full_sync_days, 8);
        assert_eq!(cfg.presence_ttl_secs, 7 * 86_400);
    }

    #[test]
    fn layout_paths() {
        let cfg = EngineConfig::for_data_dir("/tmp/dna");
        assert_eq!(cfg.signing_key_path(), PathBuf::from("/tmp/dna/keys/identity.dsa"));
        assert_eq!(cfg.db_path(), PathBuf::from("/tmp/dna/messages.db"));
        assert_eq!(cfg.gek_cache_dir(), PathBuf::from("/tmp/dna/cache/gek"));
    }
}
