//! Spillway — the sender-owned per-day DM outbox protocol.
//!
//! Enqueue: seal the envelope, append a signed entry to today's bucket,
//! 8-day TTL. Sweep: scan contact buckets over the smart-sync window,
//! verify, decrypt, store with dedup, then publish ACKs in bounded
//! parallel. Prune: read incoming ACKs and drop covered ciphertexts.
//! Delivery is at-least-once on the DHT; the store's
//! `(peer, seq, direction)` key makes it exactly-once for the user.

use std::collections::BTreeMap;

use futures::stream::{self, StreamExt};
use sha3::{Digest, Sha3_512};
use tracing::{debug, warn};

use dna_crypto::Fingerprint;
use dna_dht::SignedRecord;
use dna_proto::dht_keys;
use dna_proto::envelope;
use dna_proto::outbox::{day_index, AckRecord, ContactRequest, OutboxEntry, SECS_PER_DAY};

use crate::api::{ContactRequestView, Payload, SyncReport};
use crate::error::ErrorKind;
use crate::keyserver;
use crate::retry::backoff_delay;
use crate::services::{now_secs, Services};

const VALUE_ID_ACK: u64 = 1;

/// Outbox entries share one bucket key per day, so the replacement id
/// must be unique per (recipient, seq).
fn entry_value_id(recipient: &Fingerprint, seq: u64) -> u64 {
    let mut hasher = Sha3_512::new();
    hasher.update(recipient.as_bytes());
    hasher.update(seq.to_be_bytes());
    let digest = hasher.finalize();
    u64::from_be_bytes(digest[..8].try_into().unwrap())
}

/// Low 8 bytes of a fingerprint, for one-slot-per-requester channels.
fn fp_value_id(fp: &Fingerprint) -> u64 {
    u64::from_be_bytes(fp.as_bytes()[56..64].try_into().unwrap())
}

// ── Enqueue ──────────────────────────────────────────────────────────────────

/// Seal, store and attempt first delivery of a direct message. A
/// transient DHT failure leaves the message in the retry queue; the verb
/// still completes with the queued ids.
pub(crate) async fn send_message(
    svc: &Services,
    recipient: &Fingerprint,
    plaintext: &str,
) -> Result<Payload, ErrorKind> {
    let keys = svc.vault.get().await?;
    let recipient_record = keyserver::lookup_by_fingerprint(svc, recipient).await?;
    let recipient_kem = recipient_record.kem_key()?;

    let now = now_secs();
    let (msg_id, seq_num) = svc.store.insert_outgoing(recipient, plaintext, now).await?;
    svc.store
        .set_message_state(msg_id, dna_store::MessageState::Sending)
        .await?;

    let sealed = envelope::seal(
        &keys.signing,
        recipient,
        &recipient_kem,
        seq_num,
        now,
        plaintext.as_bytes(),
    )?;
    svc.store.set_ciphertext(msg_id, &sealed).await?;

    match deliver(svc, recipient, seq_num, sealed).await {
        Ok(()) => {
            svc.store.mark_sent(msg_id).await?;
        }
        Err(kind) if kind.is_retriable() => {
            debug!(msg_id, error = %kind, "first delivery failed, queued for retry");
            svc.store
                .set_message_state(msg_id, dna_store::MessageState::Queued)
                .await?;
            let delay = backoff_delay(1, svc.config.retry_base_secs, svc.config.retry_cap_secs);
            svc.store
                .record_attempt(msg_id, now + delay.as_secs() as i64)
                .await?;
        }
        Err(kind) => {
            svc.store.fail_message(msg_id).await?;
            return Err(kind);
        }
    }

    Ok(Payload::MessageQueued { msg_id, seq_num })
}

/// Signed append of a sealed envelope to the current-day bucket.
pub(crate) async fn deliver(
    svc: &Services,
    recipient: &Fingerprint,
    seq_num: u64,
    ciphertext: Vec<u8>,
) -> Result<(), ErrorKind> {
    let keys = svc.vault.get().await?;
    let entry = OutboxEntry {
        recipient_fp: *recipient,
        seq_num,
        ciphertext,
    };
    let encoded = entry.encode_signed(&keys.signing)?;
    let bucket = dht_keys::dm_outbox(&keys.fingerprint(), day_index(now_secs()));
    let put = SignedRecord::create(
        bucket.to_vec(),
        encoded,
        entry_value_id(recipient, seq_num),
        svc.config.outbox_ttl_secs,
        &keys.signing,
    )
    .map_err(ErrorKind::from)?;
    svc.dht_put_signed(put).await
}

/// Re-delivery of a queued message from its stored ciphertext.
/// `prior_attempts` comes from the caller's queue row.
pub(crate) async fn try_deliver_queued(
    svc: &Services,
    msg_id: i64,
    prior_attempts: i64,
) -> Result<(), ErrorKind> {
    let row = svc.store.message(msg_id).await?;
    let recipient = Fingerprint::from_hex(&row.peer_fp).map_err(|_| ErrorKind::Internal)?;
    let ciphertext = row.ciphertext.ok_or(ErrorKind::MessageNotFound)?;

    svc.store
        .set_message_state(msg_id, dna_store::MessageState::Sending)
        .await?;
    match deliver(svc, &recipient, row.seq_num as u64, ciphertext).await {
        Ok(()) => {
            svc.store.mark_sent(msg_id).await?;
            Ok(())
        }
        Err(kind) if kind.is_retriable() => {
            let delay = backoff_delay(
                (prior_attempts + 1) as u32,
                svc.config.retry_base_secs,
                svc.config.retry_cap_secs,
            );
            let attempts = svc
                .store
                .record_attempt(msg_id, now_secs() + delay.as_secs() as i64)
                .await?;
            if attempts < dna_store::messages::MAX_RETRY {
                svc.store
                    .set_message_state(msg_id, dna_store::MessageState::Queued)
                    .await?;
            }
            Err(kind)
        }
        Err(kind) => {
            svc.store.fail_message(msg_id).await?;
            Err(kind)
        }
    }
}

// ── Sweep ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct SyncMode {
    /// Scan the full window unconditionally.
    pub full: bool,
    /// Background caching: store messages, suppress ACK publication.
    pub background: bool,
}

/// Smart-sync over the contact set.
pub(crate) async fn sweep(svc: &Services, mode: SyncMode) -> Result<SyncReport, ErrorKind> {
    let keys = svc.vault.get().await?;
    let self_fp = keys.fingerprint();
    let now = now_secs();

    let contacts = svc.store.contacts().await?;
    let window_days = select_window(svc, mode, now).await?;
    let today = day_index(now);
    let start_day = today.saturating_sub(window_days.saturating_sub(1));

    let mut report = SyncReport::default();
    let mut senders_encountered: Vec<Fingerprint> = Vec::new();

    for contact in contacts.iter().filter(|c| !c.blocked) {
        let sender = match Fingerprint::from_hex(&contact.fp) {
            Ok(fp) => fp,
            Err(_) => continue,
        };
        let had_mail =
            sweep_sender_days(svc, &self_fp, &sender, start_day..=today, &mut report).await?;
        if had_mail {
            senders_encountered.push(sender);
        }
        svc.store.set_dm_last_sync(&sender, now).await?;
    }

    if !mode.background {
        publish_acks(svc, &senders_encountered).await;
    }
    collect_contact_requests(svc, &self_fp, &mut report).await?;
    prune_acked(svc).await?;

    Ok(report)
}

/// Targeted sweep of a single sender (listener push path).
pub(crate) async fn targeted_sweep(
    svc: &Services,
    sender: &Fingerprint,
) -> Result<SyncReport, ErrorKind> {
    let keys = svc.vault.get().await?;
    let self_fp = keys.fingerprint();
    let now = now_secs();
    let today = day_index(now);

    let mut report = SyncReport::default();
    // Include yesterday to survive the midnight boundary.
    let had_mail =
        sweep_sender_days(svc, &self_fp, sender, today.saturating_sub(1)..=today, &mut report)
            .await?;
    svc.store.set_dm_last_sync(sender, now).await?;
    if had_mail {
        publish_acks(svc, std::slice::from_ref(sender)).await;
    }
    Ok(report)
}

async fn select_window(svc: &Services, mode: SyncMode, now: i64) -> Result<u64, ErrorKind> {
    if mode.full {
        return Ok(svc.config.full_sync_days);
    }
    let recent_span = svc.config.recent_sync_days as i64 * SECS_PER_DAY;
    let full = match svc.store.oldest_dm_sync().await? {
        // Never-synced contact present, or the whole set has gone stale.
        Some(0) => true,
        Some(oldest) => now - oldest > recent_span,
        None => false,
    };
    Ok(if full {
        svc.config.full_sync_days
    } else {
        svc.config.recent_sync_days
    })
}

/// Sweep one sender's buckets. Returns whether any entry addressed to us
/// was seen (ACK trigger), updating counters and watermark as it goes.
async fn sweep_sender_days(
    svc: &Services,
    self_fp: &Fingerprint,
    sender: &Fingerprint,
    days: std::ops::RangeInclusive<u64>,
    report: &mut SyncReport,
) -> Result<bool, ErrorKind> {
    // Without the sender's verified record nothing can be authenticated;
    // skip them this sweep rather than store unattributable mail.
    let sender_record = match keyserver::lookup_by_fingerprint(svc, sender).await {
        Ok(record) => record,
        Err(ErrorKind::IdentityNotFound) => return Ok(false),
        Err(other) => return Err(other),
    };
    let sender_key = sender_record.signing_key()?;
    let keys = svc.vault.get().await?;

    let mut watermark = svc.store.watermark(sender).await?;
    let mut had_mail = false;
    let mut new_messages = 0u64;

    for day in days {
        let entries = svc
            .dht_get(&dht_keys::dm_outbox(sender, day))
            .await?;
        // Buckets are append-only but unordered on read; deliver in
        // seq_num order within the day.
        let mut addressed: BTreeMap<u64, OutboxEntry> = BTreeMap::new();
        for stored in entries {
            let entry = match OutboxEntry::decode_unverified(&stored.value) {
                Ok(e) => e,
                Err(_) => {
                    report.skipped += 1;
                    continue;
                }
            };
            if !entry.recipient_fp.ct_eq(self_fp) {
                continue;
            }
            had_mail = true;
            if entry.seq_num <= watermark {
                report.skipped += 1;
                continue;
            }
            match OutboxEntry::decode_verified(&stored.value, &sender_key) {
                Ok(verified) => {
                    addressed.insert(verified.seq_num, verified);
                }
                Err(_) => {
                    warn!(sender = %sender.abbrev(), "dropping forged outbox entry");
                    report.skipped += 1;
                }
            }
        }

        for (seq, entry) in addressed {
            let opened = match envelope::open(&entry.ciphertext, &keys.kem) {
                Ok(o) => o,
                Err(e) => {
                    warn!(sender = %sender.abbrev(), seq, error = %e, "envelope rejected");
                    report.skipped += 1;
                    continue;
                }
            };
            if opened.header.seq_num != seq || !opened.header.sender_fp.ct_eq(sender) {
                report.skipped += 1;
                continue;
            }
            if opened.verify_sender(&sender_key).is_err() {
                warn!(sender = %sender.abbrev(), seq, "inner signature rejected");
                report.skipped += 1;
                continue;
            }
            let plaintext = String::from_utf8_lossy(&opened.plaintext).into_owned();
            let inserted = svc
                .store
                .insert_incoming(
                    sender,
                    seq,
                    &plaintext,
                    &entry.ciphertext,
                    opened.header.timestamp,
                )
                .await?;
            if inserted {
                report.processed += 1;
                new_messages += 1;
            } else {
                report.skipped += 1;
            }
            watermark = watermark.max(seq);
            svc.store.advance_watermark(sender, seq).await?;
        }
    }

    if new_messages > 0 {
        report.senders += 1;
        svc.store.touch_last_seen(sender, now_secs()).await?;
    }
    Ok(had_mail)
}

// ── ACK publication ──────────────────────────────────────────────────────────

/// Publish ACKs for every encountered sender, bounded-parallel. ACK
/// failures are logged, not surfaced — the next sweep repeats them.
async fn publish_acks(svc: &Services, senders: &[Fingerprint]) {
    if senders.is_empty() {
        return;
    }
    let degree = svc.config.ack_parallelism.max(1).min(senders.len());
    stream::iter(senders.iter().copied())
        .for_each_concurrent(degree, |sender| {
            let svc = svc.clone();
            async move {
                if let Err(kind) = publish_ack(&svc, &sender).await {
                    warn!(sender = %sender.abbrev(), error = %kind, "ack publication failed");
                }
            }
        })
        .await;
}

/// ACK(self → sender) = highest seq stored from that sender.
pub(crate) async fn publish_ack(svc: &Services, sender: &Fingerprint) -> Result<(), ErrorKind> {
    let keys = svc.vault.get().await?;
    let self_fp = keys.fingerprint();
    let seq = svc.store.watermark(sender).await?;
    if seq == 0 {
        return Ok(());
    }
    let ack = AckRecord::build(*sender, &keys.signing, seq, now_secs())?;
    let value = serde_json::to_vec(&ack).map_err(|_| ErrorKind::Internal)?;
    let put = SignedRecord::create(
        dht_keys::ack(sender, &self_fp).to_vec(),
        value,
        VALUE_ID_ACK,
        svc.config.ack_ttl_secs,
        &keys.signing,
    )
    .map_err(ErrorKind::from)?;
    svc.dht_put_signed(put).await?;
    svc.store.set_last_ack_sent(sender, seq).await?;
    Ok(())
}

// ── Prune ────────────────────────────────────────────────────────────────────

/// Read incoming ACKs for every contact and release covered ciphertexts.
/// Lazy by design: TTL expiry on the DHT is the hard bound.
pub(crate) async fn prune_acked(svc: &Services) -> Result<(), ErrorKind> {
    let keys = svc.vault.get().await?;
    let self_fp = keys.fingerprint();

    for contact in svc.store.contacts().await? {
        let peer = match Fingerprint::from_hex(&contact.fp) {
            Ok(fp) => fp,
            Err(_) => continue,
        };
        let entries = match svc.dht_get(&dht_keys::ack(&self_fp, &peer)).await {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        let peer_key = match keyserver::lookup_by_fingerprint(svc, &peer).await {
            Ok(record) => match record.signing_key() {
                Ok(key) => key,
                Err(_) => continue,
            },
            Err(_) => continue,
        };
        for entry in entries {
            let ack: AckRecord = match serde_json::from_slice(&entry.value) {
                Ok(a) => a,
                Err(_) => continue,
            };
            if !ack.sender_fp.ct_eq(&self_fp)
                || !ack.recipient_fp.ct_eq(&peer)
                || ack.verify(&peer_key).is_err()
            {
                continue;
            }
            svc.store.apply_ack(&peer, ack.seq_num).await?;
        }
    }
    Ok(())
}

// ── Contact requests ─────────────────────────────────────────────────────────

/// Publish a signed contact request to the recipient's request channel.
pub(crate) async fn send_contact_request(
    svc: &Services,
    recipient: &Fingerprint,
    greeting: &str,
) -> Result<(), ErrorKind> {
    let keys = svc.vault.get().await?;
    // The recipient must exist to be knockable.
    keyserver::lookup_by_fingerprint(svc, recipient).await?;

    let display_name = match crate::identity::current_record_for_update(svc).await? {
        Some(record) => record.registered_name.unwrap_or_default(),
        None => String::new(),
    };
    let request = ContactRequest::build(&keys.signing, &display_name, greeting, now_secs())?;
    let value = serde_json::to_vec(&request).map_err(|_| ErrorKind::Internal)?;
    let put = SignedRecord::create(
        dht_keys::contact_requests(recipient).to_vec(),
        value,
        fp_value_id(&keys.fingerprint()),
        svc.config.contact_request_ttl_secs,
        &keys.signing,
    )
    .map_err(ErrorKind::from)?;
    svc.dht_put_signed(put).await
}

// ── Contact-list DHT backup ──────────────────────────────────────────────────

/// Encrypted contact-list backup under the owner's own keys: the list is
/// sealed to our own KEM key with the DM envelope, so only the holder of
/// the recovery phrase can read it back.
pub(crate) async fn publish_contact_backup(svc: &Services) -> Result<(), ErrorKind> {
    let keys = svc.vault.get().await?;
    let self_fp = keys.fingerprint();

    let contacts: Vec<dna_store::backup::SnapshotContact> = svc
        .store
        .contacts()
        .await?
        .into_iter()
        .map(|c| dna_store::backup::SnapshotContact {
            fp: c.fp,
            display_name: c.display_name,
            nickname: c.nickname,
            blocked: c.blocked,
            added_at: c.added_at,
        })
        .collect();
    let json = serde_json::to_vec(&contacts).map_err(|_| ErrorKind::Internal)?;

    let sealed = envelope::seal(&keys.signing, &self_fp, keys.kem.public(), 0, now_secs(), &json)?;
    let put = SignedRecord::create(
        dht_keys::contact_backup(&self_fp).to_vec(),
        sealed,
        1,
        svc.config.identity_ttl_secs,
        &keys.signing,
    )
    .map_err(ErrorKind::from)?;
    svc.dht_put_signed(put).await
}

/// Fetch and merge the contact-list backup. Existing contacts win.
pub(crate) async fn restore_contact_backup(svc: &Services) -> Result<u64, ErrorKind> {
    let keys = svc.vault.get().await?;
    let self_fp = keys.fingerprint();

    let entries = svc.dht_get(&dht_keys::contact_backup(&self_fp)).await?;
    let mut imported = 0u64;
    for entry in entries {
        let opened = match envelope::open(&entry.value, &keys.kem) {
            Ok(o) => o,
            Err(_) => continue,
        };
        if opened.verify_sender(keys.signing.public()).is_err() {
            continue;
        }
        let contacts: Vec<dna_store::backup::SnapshotContact> =
            match serde_json::from_slice(&opened.plaintext) {
                Ok(c) => c,
                Err(_) => continue,
            };
        for contact in contacts {
            let fp = match Fingerprint::from_hex(&contact.fp) {
                Ok(fp) => fp,
                Err(_) => continue,
            };
            if svc.store.contact(&fp).await?.is_some() {
                continue;
            }
            svc.store
                .upsert_contact(&fp, contact.display_name.as_deref(), contact.added_at)
                .await?;
            if contact.blocked {
                svc.store.set_blocked(&fp, true).await?;
            }
            if contact.nickname.is_some() {
                svc.store.set_nickname(&fp, contact.nickname.as_deref()).await?;
            }
            imported += 1;
        }
    }
    Ok(imported)
}

/// Collect pending requests, filtering blocked and denied requesters and
/// existing contacts. Unverifiable requests are dropped silently.
async fn collect_contact_requests(
    svc: &Services,
    self_fp: &Fingerprint,
    report: &mut SyncReport,
) -> Result<(), ErrorKind> {
    let entries = match svc.dht_get(&dht_keys::contact_requests(self_fp)).await {
        Ok(entries) => entries,
        Err(_) => return Ok(()),
    };
    let mut seen: Vec<Fingerprint> = Vec::new();
    for entry in entries {
        let request: ContactRequest = match serde_json::from_slice(&entry.value) {
            Ok(r) => r,
            Err(_) => continue,
        };
        let from = request.from_fp;
        if seen.contains(&from)
            || svc.store.is_blocked(&from).await?
            || svc.store.is_denied(&from).await?
            || svc.store.contact(&from).await?.is_some()
        {
            continue;
        }
        let requester_record = match keyserver::lookup_by_fingerprint(svc, &from).await {
            Ok(record) => record,
            Err(_) => continue,
        };
        let requester_key = match requester_record.signing_key() {
            Ok(key) => key,
            Err(_) => continue,
        };
        if request.verify(&requester_key).is_err() {
            continue;
        }
        seen.push(from);
        report.contact_requests.push(ContactRequestView {
            from_fp: from,
            display_name: request.display_name,
            greeting: request.greeting,
            timestamp: request.timestamp,
        });
    }
    Ok(())
}
