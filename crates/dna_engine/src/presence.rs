//! Presence service: periodic signed liveness publication.
//!
//! Timestamp-only JSON at `H("presence" ‖ fp)`, replacement slot 1,
//! 7-day TTL. Skipped while paused, while no identity is loaded, and
//! while the DHT is down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

use dna_crypto::Fingerprint;
use dna_dht::SignedRecord;
use dna_proto::dht_keys;
use dna_proto::presence::{PresenceRecord, PresenceStatus};

use crate::error::ErrorKind;
use crate::services::{now_secs, Services};

const VALUE_ID_PRESENCE: u64 = 1;

/// Publish one presence record for the loaded identity.
pub(crate) async fn publish_once(svc: &Services) -> Result<(), ErrorKind> {
    let keys = svc.vault.get().await?;
    let fp = keys.fingerprint();
    let record = PresenceRecord::at(now_secs());
    let put = SignedRecord::create(
        dht_keys::presence(&fp).to_vec(),
        record.to_bytes()?,
        VALUE_ID_PRESENCE,
        svc.config.presence_ttl_secs,
        &keys.signing,
    )
    .map_err(ErrorKind::from)?;
    svc.dht_put_signed(put).await?;
    debug!(fp = %fp.abbrev(), "presence published");
    Ok(())
}

/// Read a peer's presence and classify it.
///
/// Distinct signers coexist at one DHT key, and the record itself is
/// timestamp-only, so the signer binding is the entire authenticity
/// check: only entries whose signing key hashes to the queried
/// fingerprint count.
pub(crate) async fn status_of(
    svc: &Services,
    fp: &Fingerprint,
) -> Result<PresenceStatus, ErrorKind> {
    let entries = svc.dht_get(&dht_keys::presence(fp)).await?;
    let now = now_secs();
    let mut freshest: Option<i64> = None;
    for entry in entries {
        let signer = match &entry.signer_pubkey {
            Some(pk) => pk,
            None => continue,
        };
        if !Fingerprint::of_signing_key(signer).ct_eq(fp) {
            debug!(fp = %fp.abbrev(), "dropping presence record from foreign signer");
            continue;
        }
        if let Ok(record) = PresenceRecord::from_bytes(&entry.value) {
            freshest = Some(freshest.map_or(record.timestamp, |f| f.max(record.timestamp)));
        }
    }
    Ok(match freshest {
        Some(ts) => PresenceStatus::classify(now, ts),
        None => PresenceStatus::Offline,
    })
}

/// Timer-driven publication loop.
pub(crate) fn spawn_task(
    svc: Services,
    paused: Arc<AtomicBool>,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let period = Duration::from_secs(svc.config.presence_period_secs.max(1));
        loop {
            tokio::select! {
                _ = tokio::time::sleep(period) => {}
                _ = shutdown.changed() => return,
            }
            if *shutdown.borrow() {
                return;
            }
            if paused.load(Ordering::SeqCst) || !svc.vault.is_loaded().await || !svc.dht.is_ready()
            {
                continue;
            }
            if let Err(kind) = publish_once(&svc).await {
                warn!(error = %kind, "presence publication failed");
            }
        }
    })
}
