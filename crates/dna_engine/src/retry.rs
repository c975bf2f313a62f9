//! Backoff policy and the delivery retry loop.
//!
//! Exponential backoff with ±25 % jitter. Messages: base 5 s, cap 15 min,
//! up to MAX_RETRY attempts, then `failed` until an explicit user retry.
//! The same jittered curve (base 1 s, cap 60 s) drives listener
//! reconnects.

use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::outbox;
use crate::services::{now_secs, Services};

/// Jittered exponential delay for the given attempt number (1-based).
pub(crate) fn backoff_delay(attempt: u32, base_secs: u64, cap_secs: u64) -> Duration {
    let exp = base_secs.saturating_mul(1u64 << attempt.saturating_sub(1).min(20));
    let capped = exp.min(cap_secs).max(1);
    let jitter = rand::thread_rng().gen_range(0.75..=1.25);
    Duration::from_secs_f64(capped as f64 * jitter)
}

/// Stateful backoff for reconnect loops.
pub(crate) struct Backoff {
    base_secs: u64,
    cap_secs: u64,
    attempt: u32,
}

impl Backoff {
    pub fn new(base_secs: u64, cap_secs: u64) -> Self {
        Self {
            base_secs,
            cap_secs,
            attempt: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        backoff_delay(self.attempt, self.base_secs, self.cap_secs)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Periodic queue scan: re-deliver due messages, then give senders their
/// ACK-driven prune.
pub(crate) fn spawn_task(
    svc: Services,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let tick = Duration::from_secs(svc.config.retry_tick_secs.max(1));
        loop {
            tokio::select! {
                _ = tokio::time::sleep(tick) => {}
                _ = shutdown.changed() => return,
            }
            if *shutdown.borrow() {
                return;
            }
            if !svc.vault.is_loaded().await || !svc.dht.is_ready() {
                continue;
            }

            let due = match svc.store.due_retries(now_secs()).await {
                Ok(due) => due,
                Err(e) => {
                    warn!(error = %e, "retry queue scan failed");
                    continue;
                }
            };
            for row in due {
                match outbox::try_deliver_queued(&svc, row.msg_id, row.attempts).await {
                    Ok(()) => debug!(msg_id = row.msg_id, "retry delivered"),
                    Err(kind) => debug!(msg_id = row.msg_id, error = %kind, "retry failed"),
                }
            }

            if let Err(kind) = outbox::prune_acked(&svc).await {
                debug!(error = %kind, "ack prune pass failed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        for _ in 0..20 {
            let d1 = backoff_delay(1, 5, 900);
            let d4 = backoff_delay(4, 5, 900);
            let d20 = backoff_delay(20, 5, 900);
            assert!(d1 >= Duration::from_secs_f64(5.0 * 0.75));
            assert!(d1 <= Duration::from_secs_f64(5.0 * 1.25));
            assert!(d4 >= Duration::from_secs_f64(40.0 * 0.75));
            assert!(d20 <= Duration::from_secs_f64(900.0 * 1.25));
        }
    }

    #[test]
    fn stateful_backoff_resets() {
        let mut backoff = Backoff::new(1, 60);
        let first = backoff.next_delay();
        let _second = backoff.next_delay();
        backoff.reset();
        let after_reset = backoff.next_delay();
        assert!(first <= Duration::from_secs_f64(1.25));
        assert!(after_reset <= Duration::from_secs_f64(1.25));
    }
}
