//! End-to-end scenarios over the in-memory DHT: identity and names,
//! send/deliver/ACK, duplicate suppression, blocking, group rotation.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::mpsc;
use uuid::Uuid;

use dna_crypto::Fingerprint;
use dna_dht::MemoryDht;
use dna_engine::{Completion, Engine, EngineConfig, ErrorKind, Payload, RequestId};
use dna_proto::record::Profile;

struct Peer {
    engine: Engine,
    completions: mpsc::UnboundedReceiver<Completion>,
    _dir: Option<TempDir>,
}

async fn spawn_peer(dht: &MemoryDht) -> Peer {
    let dir = TempDir::new().unwrap();
    let mut peer = spawn_peer_at(dht, dir.path()).await;
    peer._dir = Some(dir);
    peer
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

async fn spawn_peer_at(dht: &MemoryDht, data_dir: &Path) -> Peer {
    init_tracing();
    let mut config = EngineConfig::for_data_dir(data_dir);
    config.allow_unencrypted_keys = true;
    config.retry_tick_secs = 1;
    config.presence_period_secs = 3600;

    let (tx, completions) = mpsc::unbounded_channel();
    let engine = Engine::start(
        config,
        Arc::new(dht.clone()),
        Box::new(move |completion| {
            let _ = tx.send(completion);
        }),
    )
    .await
    .unwrap();
    Peer {
        engine,
        completions,
        _dir: None,
    }
}

impl Peer {
    async fn wait(&mut self, request_id: RequestId) -> Result<Payload, ErrorKind> {
        loop {
            let completion = tokio::time::timeout(Duration::from_secs(20), self.completions.recv())
                .await
                .expect("completion timeout")
                .expect("callback channel closed");
            if completion.request_id == request_id {
                return completion.result;
            }
        }
    }

    async fn create_identity(&mut self, name: Option<&str>) -> Fingerprint {
        let id = self.engine.identity_create(
            name.map(str::to_string),
            None,
            Profile::default(),
        );
        match self.wait(id).await.unwrap() {
            Payload::IdentityCreated { fingerprint, .. } => fingerprint,
            other => panic!("unexpected payload {other:?}"),
        }
    }

    async fn expect_unit(&mut self, id: RequestId) {
        match self.wait(id).await.unwrap() {
            Payload::Unit => {}
            other => panic!("unexpected payload {other:?}"),
        }
    }

    async fn sync(&mut self) -> dna_engine::SyncReport {
        let id = self.engine.check_offline(false, false);
        match self.wait(id).await.unwrap() {
            Payload::Sync(report) => report,
            other => panic!("unexpected payload {other:?}"),
        }
    }

    async fn conversation(&mut self, peer: Fingerprint) -> Vec<dna_engine::api::MessageView> {
        let id = self.engine.get_conversation(peer);
        match self.wait(id).await.unwrap() {
            Payload::Messages(messages) => messages,
            other => panic!("unexpected payload {other:?}"),
        }
    }
}

// ── S1: create and look up by name ───────────────────────────────────────────

#[tokio::test]
async fn create_and_lookup_by_name() {
    let dht = MemoryDht::new();
    let mut alice = spawn_peer(&dht).await;
    let fp = alice.create_identity(Some("alice")).await;

    for query in ["alice", "Alice", "ALICE"] {
        let id = alice.engine.lookup_name(query.to_string());
        match alice.wait(id).await.unwrap() {
            Payload::FingerprintResult(found) => assert_eq!(found, fp),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    let id = alice.engine.lookup_name("nobody".to_string());
    assert_eq!(alice.wait(id).await.unwrap_err(), ErrorKind::NameNotRegistered);

    alice.engine.shutdown().await;
}

// ── P1: the recovery phrase is the identity ──────────────────────────────────

#[tokio::test]
async fn restore_reproduces_the_fingerprint() {
    let dht = MemoryDht::new();
    let mut original = spawn_peer(&dht).await;

    let id = original
        .engine
        .identity_create(None, None, Profile::default());
    let (fp, phrase) = match original.wait(id).await.unwrap() {
        Payload::IdentityCreated {
            fingerprint,
            recovery_phrase,
        } => (fingerprint, recovery_phrase),
        other => panic!("unexpected payload {other:?}"),
    };
    original.engine.shutdown().await;

    let mut restored = spawn_peer(&dht).await;
    let id = restored.engine.identity_restore(phrase, None, None);
    match restored.wait(id).await.unwrap() {
        Payload::IdentityLoaded { fingerprint } => assert_eq!(fingerprint, fp),
        other => panic!("unexpected payload {other:?}"),
    }
    restored.engine.shutdown().await;
}

// ── S2 / S3: send, deliver, ACK, duplicate suppression ───────────────────────

#[tokio::test]
async fn send_deliver_ack_and_duplicate_suppression() {
    let dht = MemoryDht::new();
    let mut bob = spawn_peer(&dht).await;
    let mut alice = spawn_peer(&dht).await;
    let bob_fp = bob.create_identity(None).await;
    let alice_fp = alice.create_identity(None).await;

    let id = bob.engine.add_contact(alice_fp, None);
    bob.expect_unit(id).await;
    let id = alice.engine.add_contact(bob_fp, None);
    alice.expect_unit(id).await;

    let id = bob.engine.send_message(alice_fp, "hi".to_string());
    let (msg_id, seq) = match bob.wait(id).await.unwrap() {
        Payload::MessageQueued { msg_id, seq_num } => (msg_id, seq_num),
        other => panic!("unexpected payload {other:?}"),
    };
    assert_eq!(seq, 1);

    // Alice polls twice before ACK effects; exactly one visible message.
    let first = alice.sync().await;
    assert_eq!(first.processed, 1);
    assert_eq!(first.senders, 1);
    let second = alice.sync().await;
    assert_eq!(second.processed, 0);

    let messages = alice.conversation(bob_fp).await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].plaintext, "hi");
    assert_eq!(messages[0].seq_num, 1);
    assert_eq!(messages[0].direction, "incoming");

    // Bob's sweep reads the ACK and prunes the retained ciphertext.
    bob.sync().await;
    let bob_view = bob.conversation(alice_fp).await;
    assert_eq!(bob_view.len(), 1);
    assert_eq!(bob_view[0].state, "delivered");
    let _ = msg_id;

    bob.engine.shutdown().await;
    alice.engine.shutdown().await;
}

// ── Ordering: multiple messages arrive in seq order ──────────────────────────

#[tokio::test]
async fn burst_delivery_is_in_sequence_order() {
    let dht = MemoryDht::new();
    let mut bob = spawn_peer(&dht).await;
    let mut alice = spawn_peer(&dht).await;
    let _bob_fp = bob.create_identity(None).await;
    let alice_fp = alice.create_identity(None).await;
    let bob_fp = bob.engine.get_signing_pubkey();
    let bob_fp = match bob.wait(bob_fp).await.unwrap() {
        Payload::PublicKey(pk) => Fingerprint::of_signing_key(&pk),
        other => panic!("unexpected payload {other:?}"),
    };

    let id = alice.engine.add_contact(bob_fp, None);
    alice.expect_unit(id).await;

    for text in ["one", "two", "three"] {
        let id = bob.engine.send_message(alice_fp, text.to_string());
        bob.wait(id).await.unwrap();
    }

    let report = alice.sync().await;
    assert_eq!(report.processed, 3);
    let messages = alice.conversation(bob_fp).await;
    let seqs: Vec<u64> = messages.iter().map(|m| m.seq_num).collect();
    assert_eq!(seqs, vec![1, 2, 3]);

    bob.engine.shutdown().await;
    alice.engine.shutdown().await;
}

// ── P4: blocking silences a peer completely ──────────────────────────────────

#[tokio::test]
async fn blocked_peer_is_invisible() {
    let dht = MemoryDht::new();
    let mut mallory = spawn_peer(&dht).await;
    let mut alice = spawn_peer(&dht).await;
    let mallory_fp = mallory.create_identity(None).await;
    let alice_fp = alice.create_identity(None).await;

    let id = alice.engine.block_user(mallory_fp);
    alice.expect_unit(id).await;

    let id = mallory.engine.send_message(alice_fp, "buy coins".to_string());
    mallory.wait(id).await.unwrap();
    let id = mallory
        .engine
        .send_contact_request(alice_fp, "hello".to_string());
    mallory.expect_unit(id).await;

    let report = alice.sync().await;
    assert_eq!(report.processed, 0);
    assert!(report.contact_requests.is_empty());
    assert!(alice.conversation(mallory_fp).await.is_empty());

    // Unblock and the mail is still on the DHT, ready to sweep.
    let id = alice.engine.unblock_user(mallory_fp);
    alice.expect_unit(id).await;
    let report = alice.sync().await;
    assert_eq!(report.processed, 1);

    mallory.engine.shutdown().await;
    alice.engine.shutdown().await;
}

// ── Contact requests surface for non-contacts ────────────────────────────────

#[tokio::test]
async fn contact_request_flow() {
    let dht = MemoryDht::new();
    let mut carol = spawn_peer(&dht).await;
    let mut alice = spawn_peer(&dht).await;
    let carol_fp = carol.create_identity(Some("carol")).await;
    let _alice_fp = alice.create_identity(None).await;
    let alice_fp = {
        let id = alice.engine.get_signing_pubkey();
        match alice.wait(id).await.unwrap() {
            Payload::PublicKey(pk) => Fingerprint::of_signing_key(&pk),
            other => panic!("unexpected payload {other:?}"),
        }
    };

    let id = carol
        .engine
        .send_contact_request(alice_fp, "hi, it's carol".to_string());
    carol.expect_unit(id).await;

    let report = alice.sync().await;
    assert_eq!(report.contact_requests.len(), 1);
    assert_eq!(report.contact_requests[0].from_fp, carol_fp);
    assert_eq!(report.contact_requests[0].display_name, "carol");

    // Denied requesters disappear from subsequent sweeps.
    let id = alice.engine.deny_contact_request(carol_fp);
    alice.expect_unit(id).await;
    let report = alice.sync().await;
    assert!(report.contact_requests.is_empty());

    // Approval overrides a past denial and adds the contact.
    let id = alice.engine.approve_contact_request(carol_fp);
    alice.expect_unit(id).await;
    let report = alice.sync().await;
    assert!(report.contact_requests.is_empty());

    carol.engine.shutdown().await;
    alice.engine.shutdown().await;
}

// ── S5: name conflicts ───────────────────────────────────────────────────────

#[tokio::test]
async fn second_registration_of_a_name_loses() {
    let dht = MemoryDht::new();
    let mut first = spawn_peer(&dht).await;
    let mut second = spawn_peer(&dht).await;
    let first_fp = first.create_identity(Some("bob")).await;
    let _ = second.create_identity(None).await;

    let id = second.engine.register_name("bob".to_string());
    assert_eq!(second.wait(id).await.unwrap_err(), ErrorKind::NameTaken);
    // Case variants collide too.
    let id = second.engine.register_name("BOB".to_string());
    assert_eq!(second.wait(id).await.unwrap_err(), ErrorKind::NameTaken);

    let id = second.engine.lookup_name("bob".to_string());
    match second.wait(id).await.unwrap() {
        Payload::FingerprintResult(fp) => assert_eq!(fp, first_fp),
        other => panic!("unexpected payload {other:?}"),
    }

    first.engine.shutdown().await;
    second.engine.shutdown().await;
}

// ── Expired names are distinguishable and reclaimable ────────────────────────

#[tokio::test]
async fn expired_name_is_reported_and_reclaimable() {
    use dna_crypto::keys::{KemKeyPair, SigningKeyPair};
    use dna_dht::{Dht, SignedRecord};
    use dna_proto::record::{IdentityRecord, NameIndexRecord, NAME_TTL_SECS};

    let dht = MemoryDht::new();
    let mut peer = spawn_peer(&dht).await;
    let my_fp = peer.create_identity(None).await;

    // A holder whose "ghost" registration lapsed a year ago.
    let holder = SigningKeyPair::from_seed(&[81u8; 32]).unwrap();
    let holder_kem = KemKeyPair::from_seed(&[82u8; 32]).unwrap();
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64;
    let registered_at = now - 2 * NAME_TTL_SECS;

    let record = IdentityRecord::build(
        &holder,
        holder_kem.public(),
        Some(("ghost".to_string(), registered_at)),
        Profile::default(),
        1,
        registered_at,
    )
    .unwrap();
    let put = SignedRecord::create(
        dna_proto::dht_keys::identity(holder.public().as_bytes()).to_vec(),
        serde_json::to_vec(&record).unwrap(),
        1,
        3600,
        &holder,
    )
    .unwrap();
    dht.put_signed(put).await.unwrap();

    let index = NameIndexRecord::build("ghost", &holder, registered_at).unwrap();
    let put = SignedRecord::create(
        dna_proto::dht_keys::name_index("ghost").to_vec(),
        serde_json::to_vec(&index).unwrap(),
        1,
        3600,
        &holder,
    )
    .unwrap();
    dht.put_signed(put).await.unwrap();

    // Lapsed, not unknown.
    let id = peer.engine.lookup_name("ghost".to_string());
    assert_eq!(peer.wait(id).await.unwrap_err(), ErrorKind::NameExpired);

    // And the slot is free for the next identity.
    let id = peer.engine.register_name("ghost".to_string());
    peer.expect_unit(id).await;
    let id = peer.engine.lookup_name("ghost".to_string());
    match peer.wait(id).await.unwrap() {
        Payload::FingerprintResult(fp) => assert_eq!(fp, my_fp),
        other => panic!("unexpected payload {other:?}"),
    }

    peer.engine.shutdown().await;
}

// ── S6: password change ──────────────────────────────────────────────────────

#[tokio::test]
async fn password_change_locks_out_the_old_password() {
    let dht = MemoryDht::new();
    let dir = TempDir::new().unwrap();

    let mut peer = spawn_peer_at(&dht, dir.path()).await;
    let id = peer
        .engine
        .identity_create(None, Some("p1".to_string()), Profile::default());
    let fp = match peer.wait(id).await.unwrap() {
        Payload::IdentityCreated { fingerprint, .. } => fingerprint,
        other => panic!("unexpected payload {other:?}"),
    };

    let id = peer
        .engine
        .change_password(Some("p1".to_string()), Some("p2".to_string()));
    peer.expect_unit(id).await;

    let id = peer.engine.identity_load(Some("p1".to_string()));
    assert_eq!(peer.wait(id).await.unwrap_err(), ErrorKind::WrongPassword);

    let id = peer.engine.identity_load(Some("p2".to_string()));
    match peer.wait(id).await.unwrap() {
        Payload::IdentityLoaded { fingerprint } => assert_eq!(fingerprint, fp),
        other => panic!("unexpected payload {other:?}"),
    }
    peer.engine.shutdown().await;
}

// ── S4: group add rotates the GEK ────────────────────────────────────────────

#[tokio::test]
async fn group_add_rotates_gek_and_gates_history() {
    let dht = MemoryDht::new();
    let mut owner = spawn_peer(&dht).await;
    let mut m1 = spawn_peer(&dht).await;
    let mut m2 = spawn_peer(&dht).await;
    let _owner_fp = owner.create_identity(Some("owner")).await;
    let m1_fp = m1.create_identity(None).await;
    let m2_fp = m2.create_identity(None).await;

    let id = owner
        .engine
        .group_create("team".to_string(), vec![m1_fp]);
    let uuid: Uuid = match owner.wait(id).await.unwrap() {
        Payload::GroupCreated { uuid } => uuid,
        other => panic!("unexpected payload {other:?}"),
    };

    let id = owner
        .engine
        .group_send_message(uuid, "v1 secret".to_string());
    owner.expect_unit(id).await;

    // M1 reads the v1 message via IKP extraction.
    let id = m1.engine.group_sync(uuid, false);
    let report = match m1.wait(id).await.unwrap() {
        Payload::Sync(r) => r,
        other => panic!("unexpected payload {other:?}"),
    };
    assert_eq!(report.processed, 1);

    // Adding M2 bumps the version.
    let id = owner.engine.group_add_member(uuid, m2_fp);
    match owner.wait(id).await.unwrap() {
        Payload::GekVersion(version) => assert_eq!(version, 2),
        other => panic!("unexpected payload {other:?}"),
    }

    let id = owner
        .engine
        .group_send_message(uuid, "v2 message".to_string());
    owner.expect_unit(id).await;

    // M2 sees only the v2 message; the v1 GEK was never sealed to it.
    let id = m2.engine.group_sync(uuid, false);
    let report = match m2.wait(id).await.unwrap() {
        Payload::Sync(r) => r,
        other => panic!("unexpected payload {other:?}"),
    };
    assert_eq!(report.processed, 1);
    assert!(report.skipped >= 1);

    let id = m2.engine.group_get_conversation(uuid);
    let history = match m2.wait(id).await.unwrap() {
        Payload::GroupMessages(h) => h,
        other => panic!("unexpected payload {other:?}"),
    };
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].plaintext, "v2 message");
    assert_eq!(history[0].gek_version, 2);

    // M1 still reads both, v1 from its local GEK cache.
    let id = m1.engine.group_sync(uuid, false);
    m1.wait(id).await.unwrap();
    let id = m1.engine.group_get_conversation(uuid);
    let history = match m1.wait(id).await.unwrap() {
        Payload::GroupMessages(h) => h,
        other => panic!("unexpected payload {other:?}"),
    };
    let texts: Vec<&str> = history.iter().map(|m| m.plaintext.as_str()).collect();
    assert!(texts.contains(&"v1 secret"));
    assert!(texts.contains(&"v2 message"));

    // Outsiders are told so.
    let mut outsider = spawn_peer(&dht).await;
    let _ = outsider.create_identity(None).await;
    let id = outsider.engine.group_sync(uuid, false);
    assert_eq!(outsider.wait(id).await.unwrap_err(), ErrorKind::NotMember);

    owner.engine.shutdown().await;
    m1.engine.shutdown().await;
    m2.engine.shutdown().await;
    outsider.engine.shutdown().await;
}

#[tokio::test]
async fn removed_member_is_locked_out_of_new_messages() {
    let dht = MemoryDht::new();
    let mut owner = spawn_peer(&dht).await;
    let mut m1 = spawn_peer(&dht).await;
    let _ = owner.create_identity(None).await;
    let m1_fp = m1.create_identity(None).await;

    let id = owner.engine.group_create("team".to_string(), vec![m1_fp]);
    let uuid = match owner.wait(id).await.unwrap() {
        Payload::GroupCreated { uuid } => uuid,
        other => panic!("unexpected payload {other:?}"),
    };

    let id = owner.engine.group_remove_member(uuid, m1_fp);
    match owner.wait(id).await.unwrap() {
        Payload::GekVersion(version) => assert_eq!(version, 2),
        other => panic!("unexpected payload {other:?}"),
    }

    let id = owner
        .engine
        .group_send_message(uuid, "after removal".to_string());
    owner.expect_unit(id).await;

    // The removed member is no longer in the record's member set.
    let id = m1.engine.group_sync(uuid, false);
    assert_eq!(m1.wait(id).await.unwrap_err(), ErrorKind::NotMember);

    // Removing a non-member reports NotMember.
    let id = owner.engine.group_remove_member(uuid, m1_fp);
    assert_eq!(owner.wait(id).await.unwrap_err(), ErrorKind::NotMember);

    owner.engine.shutdown().await;
    m1.engine.shutdown().await;
}

// ── Non-owner cannot rotate ──────────────────────────────────────────────────

#[tokio::test]
async fn non_owner_rotation_is_rejected() {
    let dht = MemoryDht::new();
    let mut owner = spawn_peer(&dht).await;
    let mut member = spawn_peer(&dht).await;
    let _ = owner.create_identity(None).await;
    let member_fp = member.create_identity(None).await;

    let id = owner.engine.group_create("team".to_string(), vec![member_fp]);
    let uuid = match owner.wait(id).await.unwrap() {
        Payload::GroupCreated { uuid } => uuid,
        other => panic!("unexpected payload {other:?}"),
    };

    let id = member.engine.group_publish_gek(uuid);
    assert_eq!(member.wait(id).await.unwrap_err(), ErrorKind::NotAuthorized);

    owner.engine.shutdown().await;
    member.engine.shutdown().await;
}

// ── Presence ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn presence_roundtrip() {
    let dht = MemoryDht::new();
    let mut alice = spawn_peer(&dht).await;
    let mut bob = spawn_peer(&dht).await;
    let alice_fp = alice.create_identity(None).await;
    let _ = bob.create_identity(None).await;

    let id = alice.engine.refresh_presence();
    alice.expect_unit(id).await;

    let id = bob.engine.get_profile(alice_fp);
    match bob.wait(id).await.unwrap() {
        Payload::ProfileResult { presence, .. } => {
            assert_eq!(presence, dna_proto::presence::PresenceStatus::Online);
        }
        other => panic!("unexpected payload {other:?}"),
    }

    alice.engine.shutdown().await;
    bob.engine.shutdown().await;
}

#[tokio::test]
async fn foreign_signer_cannot_forge_presence() {
    use dna_dht::{Dht, SignedRecord};
    use dna_proto::presence::PresenceRecord;

    let dht = MemoryDht::new();
    let mut alice = spawn_peer(&dht).await;
    let mut bob = spawn_peer(&dht).await;
    let alice_fp = alice.create_identity(None).await;
    let _ = bob.create_identity(None).await;

    // A well-signed record at Alice's presence key, from someone else's
    // perfectly valid keypair.
    let mallory = dna_crypto::keys::SigningKeyPair::from_seed(&[77u8; 32]).unwrap();
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64;
    let forged = SignedRecord::create(
        dna_proto::dht_keys::presence(&alice_fp).to_vec(),
        PresenceRecord::at(now).to_bytes().unwrap(),
        1,
        3600,
        &mallory,
    )
    .unwrap();
    dht.put_signed(forged).await.unwrap();

    // Alice never published; the forgery must not make her Online.
    let id = bob.engine.get_profile(alice_fp);
    match bob.wait(id).await.unwrap() {
        Payload::ProfileResult { presence, .. } => {
            assert_eq!(presence, dna_proto::presence::PresenceStatus::Offline);
        }
        other => panic!("unexpected payload {other:?}"),
    }

    alice.engine.shutdown().await;
    bob.engine.shutdown().await;
}

// ── P6: profile updates supersede ────────────────────────────────────────────

#[tokio::test]
async fn profile_update_supersedes() {
    let dht = MemoryDht::new();
    let mut alice = spawn_peer(&dht).await;
    let mut bob = spawn_peer(&dht).await;
    let alice_fp = alice.create_identity(Some("alice")).await;
    let _ = bob.create_identity(None).await;

    let profile = Profile {
        bio: Some("second bio".to_string()),
        ..Profile::default()
    };
    let id = alice.engine.update_profile(profile);
    alice.expect_unit(id).await;

    let id = bob.engine.get_profile(alice_fp);
    match bob.wait(id).await.unwrap() {
        Payload::ProfileResult {
            registered_name,
            profile,
            ..
        } => {
            assert_eq!(registered_name.as_deref(), Some("alice"));
            assert_eq!(profile.bio.as_deref(), Some("second bio"));
        }
        other => panic!("unexpected payload {other:?}"),
    }

    alice.engine.shutdown().await;
    bob.engine.shutdown().await;
}

// ── Listener push delivery ───────────────────────────────────────────────────

#[tokio::test]
async fn listener_delivers_without_polling() {
    let dht = MemoryDht::new();
    let mut bob = spawn_peer(&dht).await;
    let mut alice = spawn_peer(&dht).await;
    let bob_fp = bob.create_identity(None).await;
    let alice_fp = alice.create_identity(None).await;

    let id = alice.engine.add_contact(bob_fp, None);
    alice.expect_unit(id).await;
    let id = alice.engine.subscribe_contact(bob_fp);
    alice.expect_unit(id).await;
    assert_eq!(alice.engine.active_listeners().await, 1);

    let id = bob.engine.send_message(alice_fp, "pushed".to_string());
    bob.wait(id).await.unwrap();

    // The listener's targeted sweep should land the message shortly.
    let mut delivered = false;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let messages = alice.conversation(bob_fp).await;
        if messages.iter().any(|m| m.plaintext == "pushed") {
            delivered = true;
            break;
        }
    }
    assert!(delivered, "listener never delivered the message");

    let id = alice.engine.cancel_subscriptions();
    alice.expect_unit(id).await;
    assert_eq!(alice.engine.active_listeners().await, 0);

    bob.engine.shutdown().await;
    alice.engine.shutdown().await;
}

// ── Backup / restore ─────────────────────────────────────────────────────────

#[tokio::test]
async fn backup_and_restore_messages() {
    let dht = MemoryDht::new();
    let mut bob = spawn_peer(&dht).await;
    let mut alice = spawn_peer(&dht).await;
    let bob_fp = bob.create_identity(None).await;
    let alice_fp = alice.create_identity(None).await;

    let id = alice.engine.add_contact(bob_fp, None);
    alice.expect_unit(id).await;
    let id = bob.engine.send_message(alice_fp, "keep me".to_string());
    bob.wait(id).await.unwrap();
    alice.sync().await;

    let backup_dir = TempDir::new().unwrap();
    let backup_path = backup_dir.path().join("backup.dnab");
    let id = alice
        .engine
        .backup_messages(backup_path.clone(), Some("bk-pass".to_string()));
    alice.expect_unit(id).await;

    // Wrong password fails; right password merges into a fresh peer.
    let mut restored = spawn_peer(&dht).await;
    let _ = restored.create_identity(None).await;
    let id = restored
        .engine
        .restore_messages(backup_path.clone(), Some("wrong".to_string()));
    assert_eq!(restored.wait(id).await.unwrap_err(), ErrorKind::WrongPassword);

    let id = restored
        .engine
        .restore_messages(backup_path, Some("bk-pass".to_string()));
    match restored.wait(id).await.unwrap() {
        Payload::Backup(report) => {
            assert_eq!(report.messages_imported, 1);
            assert_eq!(report.contacts_imported, 1);
        }
        other => panic!("unexpected payload {other:?}"),
    }
    let messages = restored.conversation(bob_fp).await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].plaintext, "keep me");

    bob.engine.shutdown().await;
    alice.engine.shutdown().await;
    restored.engine.shutdown().await;
}

#[tokio::test]
async fn contact_list_dht_backup_follows_the_identity() {
    let dht = MemoryDht::new();
    let mut original = spawn_peer(&dht).await;

    let id = original
        .engine
        .identity_create(None, None, Profile::default());
    let phrase = match original.wait(id).await.unwrap() {
        Payload::IdentityCreated {
            recovery_phrase, ..
        } => recovery_phrase,
        other => panic!("unexpected payload {other:?}"),
    };

    let bob_fp = Fingerprint::of_signing_key(b"bob");
    let eve_fp = Fingerprint::of_signing_key(b"eve");
    let id = original.engine.add_contact(bob_fp, Some("bob".to_string()));
    original.expect_unit(id).await;
    let id = original.engine.block_user(eve_fp);
    original.expect_unit(id).await;
    let id = original.engine.backup_contacts();
    original.expect_unit(id).await;
    original.engine.shutdown().await;

    // A new device restores the phrase, then pulls the contact list.
    let mut device = spawn_peer(&dht).await;
    let id = device.engine.identity_restore(phrase, None, None);
    device.wait(id).await.unwrap();
    let id = device.engine.restore_contacts();
    match device.wait(id).await.unwrap() {
        Payload::Backup(report) => assert_eq!(report.contacts_imported, 2),
        other => panic!("unexpected payload {other:?}"),
    }
    device.engine.shutdown().await;
}

// ── Façade behavior ──────────────────────────────────────────────────────────

#[tokio::test]
async fn verbs_require_a_loaded_identity() {
    let dht = MemoryDht::new();
    let mut peer = spawn_peer(&dht).await;

    let target = Fingerprint::of_signing_key(b"whoever");
    let id = peer.engine.send_message(target, "hi".to_string());
    assert_eq!(peer.wait(id).await.unwrap_err(), ErrorKind::NoIdentityLoaded);

    let id = peer.engine.refresh_presence();
    assert_eq!(peer.wait(id).await.unwrap_err(), ErrorKind::NoIdentityLoaded);

    let id = peer.engine.get_signing_pubkey();
    assert_eq!(peer.wait(id).await.unwrap_err(), ErrorKind::NoIdentityLoaded);

    peer.engine.shutdown().await;
}

#[tokio::test]
async fn request_ids_are_unique_and_callbacks_fire_once() {
    let dht = MemoryDht::new();
    let mut peer = spawn_peer(&dht).await;
    let _ = peer.create_identity(None).await;

    let a = peer.engine.get_signing_pubkey();
    let b = peer.engine.get_signing_pubkey();
    let c = peer.engine.get_signing_pubkey();
    assert!(a != b && b != c);

    let mut seen = vec![];
    for _ in 0..3 {
        let completion = tokio::time::timeout(Duration::from_secs(10), peer.completions.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(completion.result.is_ok());
        seen.push(completion.request_id);
    }
    seen.sort_unstable();
    let mut expected = vec![a, b, c];
    expected.sort_unstable();
    assert_eq!(seen, expected);

    peer.engine.shutdown().await;
}
