//! Keyserver: identity record publication, fingerprint and name lookups.
//!
//! Every record read off the DHT is verified before use — signature
//! chain first, then the fingerprint binding. Mis-signed or malformed
//! entries are dropped, and a lookup that only finds garbage reports
//! `IdentityNotFound`, not the garbage.

use tracing::{debug, warn};

use dna_crypto::Fingerprint;
use dna_dht::SignedRecord;
use dna_proto::dht_keys;
use dna_proto::record::{normalize_name, validate_name, IdentityRecord, NameIndexRecord, Profile};

use crate::error::ErrorKind;
use crate::identity::registered_name_tuple;
use crate::services::{now_secs, Services};

/// Identity records and name index slots use the replacement slot.
const VALUE_ID_RECORD: u64 = 1;

/// Fetch and verify the freshest identity record for a fingerprint.
pub(crate) async fn lookup_by_fingerprint(
    svc: &Services,
    fp: &Fingerprint,
) -> Result<IdentityRecord, ErrorKind> {
    // The record key is H(pubkey); we only know H(pubkey) == fp ahead of
    // time because the fingerprint IS that hash.
    let entries = svc.dht_get(fp.as_bytes()).await?;
    let mut best: Option<IdentityRecord> = None;
    for entry in entries {
        let record: IdentityRecord = match serde_json::from_slice(&entry.value) {
            Ok(r) => r,
            Err(_) => {
                debug!(fp = %fp.abbrev(), "dropping malformed identity record");
                continue;
            }
        };
        if record.verify_for(fp).is_err() {
            warn!(fp = %fp.abbrev(), "dropping mis-signed identity record");
            continue;
        }
        if best.as_ref().map_or(true, |b| record.version > b.version) {
            best = Some(record);
        }
    }
    best.ok_or(ErrorKind::IdentityNotFound)
}

/// Two-hop name lookup: index → identity record → verify → fingerprint.
///
/// A name whose only well-signed claim has lapsed reports `NameExpired`,
/// not `NameNotRegistered` — callers can tell a free slot from a lapsed
/// registration.
pub(crate) async fn lookup_by_name(
    svc: &Services,
    name: &str,
) -> Result<Fingerprint, ErrorKind> {
    validate_name(name).map_err(|_| ErrorKind::NameInvalid)?;
    let normalized = normalize_name(name);
    let now = now_secs();

    let entries = svc.dht_get(&dht_keys::name_index(&normalized)).await?;
    let mut saw_expired = false;
    for entry in entries {
        let index: NameIndexRecord = match serde_json::from_slice(&entry.value) {
            Ok(r) => r,
            Err(_) => continue,
        };
        if index.name != normalized {
            continue;
        }
        // Hop two: the holder's identity record authenticates the index
        // entry; without it even an expired claim is just noise.
        let record = match lookup_by_fingerprint(svc, &index.fingerprint).await {
            Ok(r) => r,
            Err(_) => continue,
        };
        let key = match record.signing_key() {
            Ok(key) => key,
            Err(_) => continue,
        };
        if index.verify(&key).is_err() {
            continue;
        }
        if index.expired_at(now) {
            saw_expired = true;
            continue;
        }
        let claims_name = record
            .registered_name
            .as_deref()
            .map(normalize_name)
            .is_some_and(|n| n == normalized);
        if !claims_name {
            // The holder moved on to another name; the slot is free.
            continue;
        }
        if !record.name_valid_at(now) {
            saw_expired = true;
            continue;
        }
        return Ok(index.fingerprint);
    }
    if saw_expired {
        Err(ErrorKind::NameExpired)
    } else {
        Err(ErrorKind::NameNotRegistered)
    }
}

/// `NameTaken` when the index slot is held by a different fingerprint
/// whose claim is well-signed and unexpired. An expired claim frees the
/// slot for re-registration.
pub(crate) async fn ensure_name_available(
    svc: &Services,
    name: &str,
    own_fp: &Fingerprint,
) -> Result<(), ErrorKind> {
    validate_name(name).map_err(|_| ErrorKind::NameInvalid)?;
    match lookup_by_name(svc, name).await {
        Ok(holder) if holder != *own_fp => Err(ErrorKind::NameTaken),
        Ok(_) | Err(ErrorKind::NameNotRegistered) | Err(ErrorKind::NameExpired) => Ok(()),
        Err(other) => Err(other),
    }
}

/// Sign and publish an identity record, plus the name index when a name
/// is registered. The version must strictly exceed the published one.
pub(crate) async fn publish_record(
    svc: &Services,
    record: IdentityRecord,
) -> Result<(), ErrorKind> {
    let keys = svc.vault.get().await?;
    let fp = keys.fingerprint();

    match lookup_by_fingerprint(svc, &fp).await {
        Ok(current) if record.version <= current.version => {
            return Err(ErrorKind::VersionRaceLost);
        }
        Ok(_) | Err(ErrorKind::IdentityNotFound) => {}
        Err(other) => return Err(other),
    }

    let value = serde_json::to_vec(&record).map_err(|_| ErrorKind::Internal)?;
    let put = SignedRecord::create(
        dht_keys::identity(keys.signing.public().as_bytes()).to_vec(),
        value,
        VALUE_ID_RECORD,
        svc.config.identity_ttl_secs,
        &keys.signing,
    )
    .map_err(ErrorKind::from)?;
    svc.dht_put_signed(put).await?;

    if let Some(name) = &record.registered_name {
        let index = NameIndexRecord::build(
            name,
            &keys.signing,
            record.name_registered_at.unwrap_or_else(now_secs),
        )?;
        let value = serde_json::to_vec(&index).map_err(|_| ErrorKind::Internal)?;
        let put = SignedRecord::create(
            dht_keys::name_index(&index.name).to_vec(),
            value,
            VALUE_ID_RECORD,
            svc.config.identity_ttl_secs,
            &keys.signing,
        )
        .map_err(ErrorKind::from)?;
        svc.dht_put_signed(put).await?;
    }
    Ok(())
}

/// First publication for a fresh identity (version 1).
pub(crate) async fn publish_fresh(
    svc: &Services,
    name: Option<String>,
    profile: Profile,
) -> Result<(), ErrorKind> {
    let keys = svc.vault.get().await?;
    let now = now_secs();
    let record = IdentityRecord::build(
        &keys.signing,
        keys.kem.public(),
        name.map(|n| (n, now)),
        profile,
        1,
        now,
    )?;
    publish_record(svc, record).await
}

/// Claim a name for the loaded identity: availability check, version
/// bump, record + index publication.
pub(crate) async fn register_name(svc: &Services, name: &str) -> Result<(), ErrorKind> {
    let keys = svc.vault.get().await?;
    let fp = keys.fingerprint();
    ensure_name_available(svc, name, &fp).await?;

    let now = now_secs();
    let (version, profile) = match crate::identity::current_record_for_update(svc).await? {
        Some(current) => (current.version + 1, current.profile),
        None => (1, Profile::default()),
    };
    let record = IdentityRecord::build(
        &keys.signing,
        keys.kem.public(),
        Some((name.to_string(), now)),
        profile,
        version,
        now,
    )?;
    publish_record(svc, record).await
}

/// Replace the profile, preserving any live name registration.
pub(crate) async fn update_profile(svc: &Services, profile: Profile) -> Result<(), ErrorKind> {
    let keys = svc.vault.get().await?;
    let now = now_secs();
    let (version, name) = match crate::identity::current_record_for_update(svc).await? {
        Some(current) => (current.version + 1, registered_name_tuple(&current)),
        None => (1, None),
    };
    let record =
        IdentityRecord::build(&keys.signing, keys.kem.public(), name, profile, version, now)?;
    publish_record(svc, record).await
}
