//! Per-contact outbox listeners: push delivery via DHT subscriptions.
//!
//! One task per subscribed contact, watching the contact's current-day
//! bucket. A notification triggers a targeted sweep (which publishes the
//! ACK). The task survives DHT outages with jittered exponential backoff
//! and re-subscribes when the day rolls over. Cancellation is
//! cooperative: the in-flight sweep finishes, then the task exits.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use dna_crypto::Fingerprint;
use dna_proto::dht_keys;
use dna_proto::outbox::{day_index, SECS_PER_DAY};

use crate::outbox;
use crate::retry::Backoff;
use crate::services::{now_secs, Services};

struct ListenerHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// The set of live per-contact listeners.
#[derive(Clone, Default)]
pub(crate) struct ListenerSet {
    listeners: Arc<Mutex<HashMap<Fingerprint, ListenerHandle>>>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a listener for a contact. Idempotent per fingerprint.
    pub async fn subscribe(&self, svc: Services, contact: Fingerprint) {
        let mut listeners = self.listeners.lock().await;
        if listeners.contains_key(&contact) {
            return;
        }
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(listen_loop(svc, contact, stop_rx));
        listeners.insert(
            contact,
            ListenerHandle {
                stop: stop_tx,
                task,
            },
        );
        info!(contact = %contact.abbrev(), "listener started");
    }

    /// Signal every listener to stop and wait for them to finish their
    /// in-flight sweeps.
    pub async fn cancel_all(&self) {
        let mut listeners = self.listeners.lock().await;
        for (_, handle) in listeners.iter() {
            let _ = handle.stop.send(true);
        }
        for (contact, handle) in listeners.drain() {
            if handle.task.await.is_err() {
                warn!(contact = %contact.abbrev(), "listener ended abnormally");
            }
        }
    }

    pub async fn active_count(&self) -> usize {
        self.listeners.lock().await.len()
    }
}

/// Seconds until the next UTC day boundary (plus a small grace).
fn secs_to_day_rollover(now: i64) -> u64 {
    let into_day = now.rem_euclid(SECS_PER_DAY);
    (SECS_PER_DAY - into_day) as u64 + 1
}

async fn listen_loop(svc: Services, contact: Fingerprint, mut stop: watch::Receiver<bool>) {
    let mut backoff = Backoff::new(
        svc.config.listener_backoff_base_secs,
        svc.config.listener_backoff_cap_secs,
    );

    'outer: loop {
        if *stop.borrow() {
            break;
        }
        let now = now_secs();
        let bucket = dht_keys::dm_outbox(&contact, day_index(now));
        let mut subscription = match svc.dht.subscribe(bucket.to_vec()).await {
            Ok(sub) => sub,
            Err(e) => {
                let delay = backoff.next_delay();
                debug!(contact = %contact.abbrev(), error = %e, ?delay, "subscribe failed, backing off");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => continue 'outer,
                    _ = stop.changed() => break 'outer,
                }
            }
        };
        backoff.reset();
        let rollover = tokio::time::sleep(Duration::from_secs(secs_to_day_rollover(now)));
        tokio::pin!(rollover);

        loop {
            tokio::select! {
                event = subscription.events.recv() => {
                    match event {
                        Some(_) => {
                            // Finish the sweep even if a stop arrives meanwhile.
                            if let Err(kind) = outbox::targeted_sweep(&svc, &contact).await {
                                debug!(contact = %contact.abbrev(), error = %kind, "targeted sweep failed");
                            }
                            if *stop.borrow() {
                                break 'outer;
                            }
                        }
                        // Subscription dropped by the DHT: resubscribe.
                        None => continue 'outer,
                    }
                }
                _ = &mut rollover => {
                    // New day, new bucket key.
                    continue 'outer;
                }
                _ = stop.changed() => break 'outer,
            }
        }
    }
    debug!(contact = %contact.abbrev(), "listener stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rollover_is_within_a_day() {
        let secs = secs_to_day_rollover(1_700_000_000);
        assert!(secs >= 1 && secs <= SECS_PER_DAY as u64 + 1);
        assert_eq!(secs_to_day_rollover(0), SECS_PER_DAY as u64 + 1);
    }
}
