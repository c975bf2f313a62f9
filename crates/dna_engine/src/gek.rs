//! GEK engine: group creation, key rotation, IKP distribution, group
//! messages.
//!
//! Rotation rules: any membership change produces a new GEK and a new
//! IKP at `version + 1`; removed members are excluded from the new IKP
//! and cannot read forward. Old GEKs stay in the local cache so history
//! keeps decrypting, and are never re-published.
//!
//! Concurrent owners racing the same version slot are resolved by DHT
//! put ordering: the loser sees a foreign record on its pre-publish read
//! or read-back, surfaces `VersionRaceLost` internally, re-reads and
//! retries at the bumped version.

use std::collections::HashMap;
use std::fs;

use sha3::{Digest, Sha3_512};
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use dna_crypto::keys::{KemPublicKey, SigningPublicKey};
use dna_crypto::Fingerprint;
use dna_dht::SignedRecord;
use dna_proto::dht_keys;
use dna_proto::group::{seal_group_message, Gek, GroupMember, GroupMessage, GroupRecord};
use dna_proto::ikp;
use dna_proto::outbox::day_index;

use crate::api::{GroupMessageView, Payload, SyncReport};
use crate::error::ErrorKind;
use crate::keyserver;
use crate::services::{now_secs, Services};

const VALUE_ID_RECORD: u64 = 1;
const ROTATE_RETRIES: u32 = 3;

fn random_gek() -> Gek {
    use rand::RngCore;
    let mut gek = Zeroizing::new([0u8; 32]);
    rand::rngs::OsRng.fill_bytes(gek.as_mut());
    gek
}

fn blob_value_id(blob: &[u8]) -> u64 {
    let digest = Sha3_512::digest(blob);
    u64::from_be_bytes(digest[..8].try_into().unwrap())
}

fn blob_hash_hex(blob: &[u8]) -> String {
    hex::encode(&Sha3_512::digest(blob)[..16])
}

// ── Group record access ──────────────────────────────────────────────────────

/// Fetch and verify the freshest group record.
pub(crate) async fn fetch_group_record(
    svc: &Services,
    uuid: &Uuid,
) -> Result<GroupRecord, ErrorKind> {
    let entries = svc.dht_get(&dht_keys::group(uuid)).await?;
    let mut best: Option<GroupRecord> = None;
    for entry in entries {
        let record: GroupRecord = match serde_json::from_slice(&entry.value) {
            Ok(r) => r,
            Err(_) => continue,
        };
        if record.uuid != *uuid || record.verify().is_err() {
            warn!(group = %uuid, "dropping invalid group record");
            continue;
        }
        if best
            .as_ref()
            .map_or(true, |b| record.gek_version > b.gek_version)
        {
            best = Some(record);
        }
    }
    best.ok_or(ErrorKind::GroupNotFound)
}

/// Mirror a verified group record into the local store.
async fn adopt_record(svc: &Services, record: &GroupRecord) -> Result<(), ErrorKind> {
    svc.store
        .insert_group(
            &record.uuid,
            &record.name,
            &record.owner_fp,
            record.gek_version,
            record.created_at,
        )
        .await?;
    svc.store
        .set_gek_version(&record.uuid, record.gek_version)
        .await?;
    let members: Vec<(Fingerprint, i64)> =
        record.members.iter().map(|m| (m.fp, m.added_at)).collect();
    svc.store.replace_group_members(&record.uuid, &members).await?;
    Ok(())
}

// ── Rotation ─────────────────────────────────────────────────────────────────

/// Publish a new GEK + IKP + group record at `target_version`.
async fn publish_rotation(
    svc: &Services,
    uuid: &Uuid,
    name: &str,
    members: &[GroupMember],
    target_version: u32,
    created_at: i64,
) -> Result<(), ErrorKind> {
    let keys = svc.vault.get().await?;
    let own_pk = keys.signing.public().as_bytes().to_vec();
    let ikp_key = dht_keys::ikp(uuid, target_version);

    // Pre-publish read: an occupied slot means another owner won.
    let occupied = svc
        .dht_get(&ikp_key)
        .await?
        .iter()
        .any(|e| e.signer_pubkey.as_deref() != Some(own_pk.as_slice()));
    if occupied {
        return Err(ErrorKind::VersionRaceLost);
    }

    let gek = random_gek();
    let member_keys: Result<Vec<(Fingerprint, KemPublicKey)>, ErrorKind> = members
        .iter()
        .map(|m| Ok((m.fp, m.kem_key()?)))
        .collect();
    let ikp_bytes = ikp::build(uuid, target_version, &gek, &member_keys?, &keys.signing)?;

    let put = SignedRecord::create(
        ikp_key.to_vec(),
        ikp_bytes,
        VALUE_ID_RECORD,
        svc.config.ikp_ttl_secs,
        &keys.signing,
    )
    .map_err(ErrorKind::from)?;
    svc.dht_put_signed(put).await?;

    // Read-back: first accepted record wins the slot.
    let back = svc.dht_get(&ikp_key).await?;
    match back.first() {
        Some(entry) if entry.signer_pubkey.as_deref() == Some(own_pk.as_slice()) => {}
        _ => return Err(ErrorKind::VersionRaceLost),
    }

    let record = GroupRecord::build(
        *uuid,
        name,
        &keys.signing,
        members.to_vec(),
        target_version,
        created_at,
        now_secs(),
    )?;
    let value = serde_json::to_vec(&record).map_err(|_| ErrorKind::Internal)?;
    let put = SignedRecord::create(
        dht_keys::group(uuid).to_vec(),
        value,
        VALUE_ID_RECORD,
        svc.config.ikp_ttl_secs,
        &keys.signing,
    )
    .map_err(ErrorKind::from)?;
    svc.dht_put_signed(put).await?;

    adopt_record(svc, &record).await?;
    cache_gek(svc, uuid, target_version, &gek).await?;
    info!(group = %uuid, version = target_version, members = members.len(), "rotation published");
    Ok(())
}

/// Create a group: the caller plus `member_fps`, GEK v1, IKP v1.
pub(crate) async fn group_create(
    svc: &Services,
    name: &str,
    member_fps: &[Fingerprint],
) -> Result<Payload, ErrorKind> {
    let keys = svc.vault.get().await?;
    let self_fp = keys.fingerprint();
    let now = now_secs();

    let mut members = vec![GroupMember::new(self_fp, keys.kem.public(), now)];
    for fp in member_fps {
        if *fp == self_fp {
            continue;
        }
        let record = keyserver::lookup_by_fingerprint(svc, fp).await?;
        members.push(GroupMember::new(*fp, &record.kem_key()?, now));
    }

    let uuid = Uuid::new_v4();
    publish_rotation(svc, &uuid, name, &members, 1, now).await?;
    Ok(Payload::GroupCreated { uuid })
}

/// Membership mutation with race-loss retry.
async fn rotate_with(
    svc: &Services,
    uuid: &Uuid,
    build_members: impl Fn(&GroupRecord) -> Result<Vec<GroupMember>, ErrorKind>,
) -> Result<u32, ErrorKind> {
    let keys = svc.vault.get().await?;
    let self_fp = keys.fingerprint();

    for attempt in 0..ROTATE_RETRIES {
        let current = fetch_group_record(svc, uuid).await?;
        if current.owner_fp != self_fp {
            return Err(ErrorKind::NotAuthorized);
        }
        let members = build_members(&current)?;
        let target = current.gek_version + 1;
        match publish_rotation(svc, uuid, &current.name, &members, target, current.created_at)
            .await
        {
            Ok(()) => return Ok(target),
            Err(ErrorKind::VersionRaceLost) => {
                debug!(group = %uuid, attempt, "rotation race lost, re-reading");
                continue;
            }
            Err(other) => return Err(other),
        }
    }
    Err(ErrorKind::VersionRaceLost)
}

/// Add a member: new GEK, new IKP including them, version + 1.
pub(crate) async fn group_add_member(
    svc: &Services,
    uuid: &Uuid,
    new_member: &Fingerprint,
) -> Result<Payload, ErrorKind> {
    let member_record = keyserver::lookup_by_fingerprint(svc, new_member).await?;
    let member_kem = member_record.kem_key()?;
    let now = now_secs();

    let version = rotate_with(svc, uuid, move |current| {
        if current.member(new_member).is_some() {
            // Already present; rotation still refreshes the key.
            Ok(current.members.clone())
        } else {
            let mut members = current.members.clone();
            members.push(GroupMember::new(*new_member, &member_kem, now));
            Ok(members)
        }
    })
    .await?;
    Ok(Payload::GekVersion(version))
}

/// Remove a member: new GEK and IKP that exclude them, version + 1.
/// They keep their cached GEKs for history but cannot read forward.
pub(crate) async fn group_remove_member(
    svc: &Services,
    uuid: &Uuid,
    member: &Fingerprint,
) -> Result<Payload, ErrorKind> {
    let version = rotate_with(svc, uuid, |current| {
        if current.member(member).is_none() {
            return Err(ErrorKind::NotMember);
        }
        if current.owner_fp == *member {
            return Err(ErrorKind::NotAuthorized);
        }
        Ok(current
            .members
            .iter()
            .filter(|m| m.fp != *member)
            .cloned()
            .collect())
    })
    .await?;
    Ok(Payload::GekVersion(version))
}

/// Owner-initiated refresh: same members, fresh GEK.
pub(crate) async fn group_publish_gek(svc: &Services, uuid: &Uuid) -> Result<Payload, ErrorKind> {
    let version = rotate_with(svc, uuid, |current| Ok(current.members.clone())).await?;
    Ok(Payload::GekVersion(version))
}

// ── GEK access ───────────────────────────────────────────────────────────────

async fn cache_gek(
    svc: &Services,
    uuid: &Uuid,
    version: u32,
    gek: &Gek,
) -> Result<(), ErrorKind> {
    svc.store.store_gek(uuid, version, gek).await?;
    let dir = svc.config.gek_cache_dir();
    if fs::create_dir_all(&dir).is_ok() {
        let path = dir.join(format!("{uuid}-{version}.bin"));
        if let Err(e) = fs::write(&path, gek.as_slice()) {
            warn!(group = %uuid, version, error = %e, "gek cache file write failed");
        }
    }
    Ok(())
}

/// Local cache, else IKP fetch + extract.
pub(crate) async fn ensure_gek(
    svc: &Services,
    uuid: &Uuid,
    version: u32,
) -> Result<Gek, ErrorKind> {
    if let Some(gek) = svc.store.gek(uuid, version).await? {
        return Ok(gek);
    }
    let keys = svc.vault.get().await?;
    let record = fetch_group_record(svc, uuid).await?;
    let owner_key = record.owner_key()?;

    let entries = svc.dht_get(&dht_keys::ikp(uuid, version)).await?;
    if entries.is_empty() {
        return Err(ErrorKind::GroupNotFound);
    }
    let mut last_err = ErrorKind::GroupNotFound;
    for entry in entries {
        match ikp::extract(
            &entry.value,
            uuid,
            Some(version),
            &keys.fingerprint(),
            &keys.kem,
            &owner_key,
        ) {
            Ok((gek, _)) => {
                cache_gek(svc, uuid, version, &gek).await?;
                return Ok(gek);
            }
            Err(e) => last_err = e.into(),
        }
    }
    Err(last_err)
}

/// Resolve a GEK for the façade; defaults to the record's current version.
pub(crate) async fn group_fetch_gek(
    svc: &Services,
    uuid: &Uuid,
    version: Option<u32>,
) -> Result<Payload, ErrorKind> {
    let version = match version {
        Some(v) => v,
        None => fetch_group_record(svc, uuid).await?.gek_version,
    };
    ensure_gek(svc, uuid, version).await?;
    Ok(Payload::GekVersion(version))
}

// ── Group messages ───────────────────────────────────────────────────────────

/// Encrypt under the current GEK and publish to today's group channel.
pub(crate) async fn group_send_message(
    svc: &Services,
    uuid: &Uuid,
    plaintext: &str,
) -> Result<Payload, ErrorKind> {
    let keys = svc.vault.get().await?;
    let self_fp = keys.fingerprint();

    let record = fetch_group_record(svc, uuid).await?;
    if record.member(&self_fp).is_none() {
        return Err(ErrorKind::NotMember);
    }
    adopt_record(svc, &record).await?;

    let gek = ensure_gek(svc, uuid, record.gek_version).await?;
    let now = now_secs();
    let blob = seal_group_message(
        uuid,
        record.gek_version,
        &gek,
        &keys.signing,
        now,
        plaintext.as_bytes(),
    )?;
    let hash = blob_hash_hex(&blob);
    let value_id = blob_value_id(&blob);

    let put = SignedRecord::create(
        dht_keys::group_messages(uuid, day_index(now)).to_vec(),
        blob,
        value_id,
        svc.config.group_msg_ttl_secs,
        &keys.signing,
    )
    .map_err(ErrorKind::from)?;
    svc.dht_put_signed(put).await?;

    svc.store
        .insert_group_message(uuid, &hash, &self_fp, record.gek_version, plaintext, now)
        .await?;
    Ok(Payload::Unit)
}

/// Pull the group channel: refresh membership, decrypt what our GEK
/// versions can read, store with dedup.
pub(crate) async fn group_sync(
    svc: &Services,
    uuid: &Uuid,
    full: bool,
) -> Result<SyncReport, ErrorKind> {
    let keys = svc.vault.get().await?;
    let self_fp = keys.fingerprint();

    let record = fetch_group_record(svc, uuid).await?;
    adopt_record(svc, &record).await?;
    if record.member(&self_fp).is_none() {
        return Err(ErrorKind::NotMember);
    }

    let now = now_secs();
    let today = day_index(now);
    let days = if full {
        svc.config.full_sync_days
    } else {
        svc.config.recent_sync_days
    };
    let start_day = today.saturating_sub(days.saturating_sub(1));

    let mut report = SyncReport::default();
    let mut sender_keys: HashMap<Fingerprint, SigningPublicKey> = HashMap::new();
    let mut senders_with_new: Vec<Fingerprint> = Vec::new();

    for day in start_day..=today {
        let entries = svc
            .dht_get(&dht_keys::group_messages(uuid, day))
            .await?;
        for entry in entries {
            let hash = blob_hash_hex(&entry.value);
            let msg = match GroupMessage::decode(&entry.value) {
                Ok(m) => m,
                Err(_) => {
                    report.skipped += 1;
                    continue;
                }
            };
            if record.member(&msg.sender_fp).is_none() {
                report.skipped += 1;
                continue;
            }
            let sender_key = match sender_keys.get(&msg.sender_fp) {
                Some(key) => key.clone(),
                None => {
                    let key = match keyserver::lookup_by_fingerprint(svc, &msg.sender_fp).await {
                        Ok(r) => match r.signing_key() {
                            Ok(k) => k,
                            Err(_) => {
                                report.skipped += 1;
                                continue;
                            }
                        },
                        Err(_) => {
                            report.skipped += 1;
                            continue;
                        }
                    };
                    sender_keys.insert(msg.sender_fp, key.clone());
                    key
                }
            };
            if msg.verify_sender(&sender_key).is_err() {
                warn!(group = %uuid, sender = %msg.sender_fp.abbrev(), "forged group message");
                report.skipped += 1;
                continue;
            }
            let gek = match ensure_gek(svc, uuid, msg.gek_version).await {
                Ok(gek) => gek,
                Err(_) => {
                    // A version we were never keyed for (joined later).
                    report.skipped += 1;
                    continue;
                }
            };
            let plaintext = match msg.decrypt(uuid, &gek) {
                Ok(pt) => String::from_utf8_lossy(&pt).into_owned(),
                Err(_) => {
                    report.skipped += 1;
                    continue;
                }
            };
            let inserted = svc
                .store
                .insert_group_message(
                    uuid,
                    &hash,
                    &msg.sender_fp,
                    msg.gek_version,
                    &plaintext,
                    msg.timestamp,
                )
                .await?;
            if inserted {
                report.processed += 1;
                if !senders_with_new.contains(&msg.sender_fp) {
                    senders_with_new.push(msg.sender_fp);
                }
            } else {
                report.skipped += 1;
            }
        }
    }
    report.senders = senders_with_new.len() as u64;
    Ok(report)
}

/// Local group history for the façade.
pub(crate) async fn group_conversation(
    svc: &Services,
    uuid: &Uuid,
) -> Result<Vec<GroupMessageView>, ErrorKind> {
    let rows = svc.store.group_conversation(uuid).await?;
    Ok(rows
        .into_iter()
        .map(|r| GroupMessageView {
            group_uuid: r.group_uuid,
            sender_fp: r.sender_fp,
            gek_version: r.gek_version as u32,
            plaintext: r.plaintext,
            timestamp: r.timestamp,
        })
        .collect())
}
