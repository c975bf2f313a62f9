//! The engine façade.
//!
//! Uniform asynchronous surface: every verb returns a `RequestId` at
//! once; the work runs on a bounded worker pool; completions are drained
//! by one callback task that invokes the caller's callback serially —
//! never on a worker, never while an engine lock is held.
//!
//! Cancellation is best-effort: a cancelled request completes exactly
//! once with `Cancelled`, though an in-flight DHT put may still land on
//! the network. Shutdown drains the workers, stops the listeners, then
//! the background tasks, then the callback task, in that order.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

use dna_crypto::keyfile::{self, KeyFileAlg};
use dna_crypto::Fingerprint;
use dna_dht::Dht;
use dna_proto::record::Profile;
use dna_store::Store;

use crate::api::{Completion, CompletionCallback, Payload, RequestId};
use crate::config::EngineConfig;
use crate::error::ErrorKind;
use crate::identity::{self, KeyVault};
use crate::keyserver;
use crate::listener::ListenerSet;
use crate::outbox::{self, SyncMode};
use crate::presence;
use crate::retry;
use crate::services::{now_secs, Services};
use crate::gek;

struct EngineInner {
    services: Services,
    completions: StdMutex<Option<mpsc::UnboundedSender<Completion>>>,
    callback_task: StdMutex<Option<JoinHandle<()>>>,
    background: StdMutex<Vec<JoinHandle<()>>>,
    requests: StdMutex<HashMap<RequestId, Arc<AtomicBool>>>,
    next_request: AtomicU64,
    workers: Arc<Semaphore>,
    listeners: ListenerSet,
    presence_paused: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    running: AtomicBool,
}

/// One messaging engine instance. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Open the store, start the callback, presence and retry tasks.
    pub async fn start(
        config: EngineConfig,
        dht: Arc<dyn Dht>,
        callback: CompletionCallback,
    ) -> Result<Self, ErrorKind> {
        for dir in [
            config.data_dir.clone(),
            config.keys_dir(),
            config.gek_cache_dir(),
            config.data_dir.join("logs"),
        ] {
            std::fs::create_dir_all(&dir).map_err(|_| ErrorKind::Internal)?;
        }

        let store = Store::open(&config.db_path()).await?;
        let services = Services {
            config: Arc::new(config),
            dht,
            store,
            vault: KeyVault::new(),
        };

        let (completion_tx, mut completion_rx) = mpsc::unbounded_channel::<Completion>();
        let callback_task = tokio::spawn(async move {
            while let Some(completion) = completion_rx.recv().await {
                callback(completion);
            }
        });

        let (shutdown_tx, _) = watch::channel(false);
        let presence_paused = Arc::new(AtomicBool::new(false));
        let workers = Arc::new(Semaphore::new(
            services.config.resolved_worker_concurrency(),
        ));

        let background = vec![
            presence::spawn_task(
                services.clone(),
                presence_paused.clone(),
                shutdown_tx.subscribe(),
            ),
            retry::spawn_task(services.clone(), shutdown_tx.subscribe()),
        ];

        info!(data_dir = %services.config.data_dir.display(), "engine started");
        Ok(Self {
            inner: Arc::new(EngineInner {
                services,
                completions: StdMutex::new(Some(completion_tx)),
                callback_task: StdMutex::new(Some(callback_task)),
                background: StdMutex::new(background),
                requests: StdMutex::new(HashMap::new()),
                next_request: AtomicU64::new(0),
                workers,
                listeners: ListenerSet::new(),
                presence_paused,
                shutdown_tx,
                running: AtomicBool::new(true),
            }),
        })
    }

    // ── Request plumbing ─────────────────────────────────────────────────────

    fn complete(&self, request_id: RequestId, result: Result<Payload, ErrorKind>) {
        let sender = self.inner.completions.lock().expect("completions lock").clone();
        if let Some(sender) = sender {
            let _ = sender.send(Completion { request_id, result });
        }
    }

    fn submit<Fut>(&self, make: impl FnOnce(Services) -> Fut) -> RequestId
    where
        Fut: std::future::Future<Output = Result<Payload, ErrorKind>> + Send + 'static,
    {
        let request_id = self.inner.next_request.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.inner.running.load(Ordering::SeqCst) {
            self.complete(request_id, Err(ErrorKind::NotRunning));
            return request_id;
        }

        let cancelled = Arc::new(AtomicBool::new(false));
        self.inner
            .requests
            .lock()
            .expect("requests lock")
            .insert(request_id, cancelled.clone());

        let fut = make(self.inner.services.clone());
        let this = self.clone();
        tokio::spawn(async move {
            let result = match this.inner.workers.clone().acquire_owned().await {
                Ok(_permit) => {
                    if cancelled.load(Ordering::SeqCst) {
                        Err(ErrorKind::Cancelled)
                    } else {
                        let result = fut.await;
                        if cancelled.load(Ordering::SeqCst) {
                            Err(ErrorKind::Cancelled)
                        } else {
                            result
                        }
                    }
                }
                // Pool closed by shutdown.
                Err(_) => Err(ErrorKind::NotRunning),
            };
            this.inner
                .requests
                .lock()
                .expect("requests lock")
                .remove(&request_id);
            this.complete(request_id, result);
        });
        request_id
    }

    /// Best-effort cancellation by request id.
    pub fn cancel(&self, request_id: RequestId) {
        if let Some(flag) = self
            .inner
            .requests
            .lock()
            .expect("requests lock")
            .get(&request_id)
        {
            flag.store(true, Ordering::SeqCst);
        }
    }

    /// Drain workers, stop listeners and background tasks, then the
    /// callback task.
    pub async fn shutdown(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner.workers.close();

        // Let in-flight requests finish delivering their completions.
        for _ in 0..500 {
            if self.inner.requests.lock().expect("requests lock").is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        self.inner.listeners.cancel_all().await;
        let _ = self.inner.shutdown_tx.send(true);
        let background: Vec<_> = self
            .inner
            .background
            .lock()
            .expect("background lock")
            .drain(..)
            .collect();
        for task in background {
            let _ = task.await;
        }

        // Dropping the sender ends the callback task after the queue drains.
        self.inner.completions.lock().expect("completions lock").take();
        let callback_task = self.inner.callback_task.lock().expect("callback lock").take();
        if let Some(task) = callback_task {
            let _ = task.await;
        }
        self.inner.services.vault.lock().await;
        info!("engine stopped");
    }

    // ── Identity ─────────────────────────────────────────────────────────────

    pub fn identity_create(
        &self,
        name: Option<String>,
        password: Option<String>,
        profile: Profile,
    ) -> RequestId {
        self.submit(move |svc| async move {
            let (fingerprint, phrase) =
                identity::create(&svc, name, password.as_deref(), profile).await?;
            Ok(Payload::IdentityCreated {
                fingerprint,
                recovery_phrase: phrase.to_string(),
            })
        })
    }

    pub fn identity_restore(
        &self,
        recovery_phrase: String,
        passphrase: Option<String>,
        password: Option<String>,
    ) -> RequestId {
        self.submit(move |svc| async move {
            let fingerprint = identity::restore(
                &svc,
                &recovery_phrase,
                passphrase.as_deref().unwrap_or(""),
                password.as_deref(),
            )
            .await?;
            Ok(Payload::IdentityLoaded { fingerprint })
        })
    }

    pub fn identity_load(&self, password: Option<String>) -> RequestId {
        self.submit(move |svc| async move {
            let fingerprint = identity::load(&svc, password.as_deref()).await?;
            Ok(Payload::IdentityLoaded { fingerprint })
        })
    }

    pub fn identity_delete(&self, password: Option<String>) -> RequestId {
        self.submit(move |svc| async move {
            identity::delete(&svc, password.as_deref()).await?;
            Ok(Payload::Unit)
        })
    }

    /// Re-wrap every key file under a new password. The first
    /// verification failure aborts with the files untouched.
    pub fn change_password(&self, old: Option<String>, new: Option<String>) -> RequestId {
        self.submit(move |svc| async move {
            let acceptable = matches!(new.as_deref(), Some(p) if !p.is_empty())
                || svc.config.allow_unencrypted_keys;
            if !acceptable {
                return Err(ErrorKind::PasswordTooWeak);
            }
            let old = old.as_deref().filter(|p| !p.is_empty());
            let new = new.as_deref().filter(|p| !p.is_empty());
            for path in [
                svc.config.signing_key_path(),
                svc.config.kem_key_path(),
                svc.config.mnemonic_path(),
            ] {
                if path.exists() {
                    keyfile::change_password(&path, old, new)?;
                }
            }
            Ok(Payload::Unit)
        })
    }

    pub fn sign_data(&self, data: Vec<u8>) -> RequestId {
        self.submit(move |svc| async move {
            Ok(Payload::Signature(identity::sign_data(&svc, &data).await?))
        })
    }

    pub fn get_signing_pubkey(&self) -> RequestId {
        self.submit(move |svc| async move {
            let keys = svc.vault.get().await?;
            Ok(Payload::PublicKey(keys.signing.public().as_bytes().to_vec()))
        })
    }

    // ── Direct messages ──────────────────────────────────────────────────────

    pub fn send_message(&self, recipient: Fingerprint, plaintext: String) -> RequestId {
        self.submit(move |svc| async move { outbox::send_message(&svc, &recipient, &plaintext).await })
    }

    pub fn get_conversation(&self, peer: Fingerprint) -> RequestId {
        self.submit(move |svc| async move {
            let rows = svc.store.conversation(&peer).await?;
            svc.store.mark_conversation_read(&peer).await?;
            Ok(Payload::Messages(rows.into_iter().map(Into::into).collect()))
        })
    }

    pub fn get_conversation_page(
        &self,
        peer: Fingerprint,
        limit: u32,
        offset: u32,
    ) -> RequestId {
        self.submit(move |svc| async move {
            let rows = svc.store.conversation_page(&peer, limit, offset).await?;
            Ok(Payload::Messages(rows.into_iter().map(Into::into).collect()))
        })
    }

    /// Explicit user retry of a message that exhausted its attempts.
    pub fn retry_message(&self, msg_id: i64) -> RequestId {
        self.submit(move |svc| async move {
            svc.store.requeue_failed(msg_id, now_secs()).await?;
            Ok(Payload::Unit)
        })
    }

    /// Offline synchronization sweep (`check-offline`).
    pub fn check_offline(&self, full: bool, background: bool) -> RequestId {
        self.submit(move |svc| async move {
            let report = outbox::sweep(&svc, SyncMode { full, background }).await?;
            Ok(Payload::Sync(report))
        })
    }

    // ── Listeners ────────────────────────────────────────────────────────────

    pub fn subscribe_contact(&self, contact: Fingerprint) -> RequestId {
        let listeners = self.inner.listeners.clone();
        self.submit(move |svc| async move {
            listeners.subscribe(svc, contact).await;
            Ok(Payload::Unit)
        })
    }

    pub fn cancel_subscriptions(&self) -> RequestId {
        let listeners = self.inner.listeners.clone();
        self.submit(move |_svc| async move {
            listeners.cancel_all().await;
            Ok(Payload::Unit)
        })
    }

    // ── Contacts ─────────────────────────────────────────────────────────────

    pub fn add_contact(&self, peer: Fingerprint, display_name: Option<String>) -> RequestId {
        self.submit(move |svc| async move {
            svc.store
                .upsert_contact(&peer, display_name.as_deref(), now_secs())
                .await?;
            Ok(Payload::Unit)
        })
    }

    pub fn remove_contact(&self, peer: Fingerprint) -> RequestId {
        self.submit(move |svc| async move {
            svc.store.remove_contact(&peer).await?;
            Ok(Payload::Unit)
        })
    }

    pub fn block_user(&self, peer: Fingerprint) -> RequestId {
        self.submit(move |svc| async move {
            svc.store.upsert_contact(&peer, None, now_secs()).await?;
            svc.store.set_blocked(&peer, true).await?;
            Ok(Payload::Unit)
        })
    }

    pub fn unblock_user(&self, peer: Fingerprint) -> RequestId {
        self.submit(move |svc| async move {
            svc.store.set_blocked(&peer, false).await?;
            Ok(Payload::Unit)
        })
    }

    pub fn send_contact_request(&self, recipient: Fingerprint, greeting: String) -> RequestId {
        self.submit(move |svc| async move {
            outbox::send_contact_request(&svc, &recipient, &greeting).await?;
            Ok(Payload::Unit)
        })
    }

    pub fn approve_contact_request(&self, requester: Fingerprint) -> RequestId {
        self.submit(move |svc| async move {
            let display_name = keyserver::lookup_by_fingerprint(&svc, &requester)
                .await
                .ok()
                .and_then(|r| r.registered_name);
            svc.store.clear_denied(&requester).await?;
            svc.store
                .upsert_contact(&requester, display_name.as_deref(), now_secs())
                .await?;
            Ok(Payload::Unit)
        })
    }

    pub fn deny_contact_request(&self, requester: Fingerprint) -> RequestId {
        self.submit(move |svc| async move {
            svc.store.deny_request(&requester, now_secs()).await?;
            Ok(Payload::Unit)
        })
    }

    // ── Names & profiles ─────────────────────────────────────────────────────

    pub fn register_name(&self, name: String) -> RequestId {
        self.submit(move |svc| async move {
            keyserver::register_name(&svc, &name).await?;
            Ok(Payload::Unit)
        })
    }

    pub fn lookup_name(&self, name: String) -> RequestId {
        self.submit(move |svc| async move {
            let fingerprint = keyserver::lookup_by_name(&svc, &name).await?;
            Ok(Payload::FingerprintResult(fingerprint))
        })
    }

    pub fn get_profile(&self, fp: Fingerprint) -> RequestId {
        self.submit(move |svc| async move {
            let record = keyserver::lookup_by_fingerprint(&svc, &fp).await?;
            let presence = presence::status_of(&svc, &fp)
                .await
                .unwrap_or(dna_proto::presence::PresenceStatus::Offline);
            Ok(Payload::ProfileResult {
                fingerprint: fp,
                registered_name: record.registered_name.clone(),
                profile: record.profile,
                presence,
            })
        })
    }

    pub fn update_profile(&self, profile: Profile) -> RequestId {
        self.submit(move |svc| async move {
            keyserver::update_profile(&svc, profile).await?;
            Ok(Payload::Unit)
        })
    }

    // ── Groups ───────────────────────────────────────────────────────────────

    pub fn group_create(&self, name: String, members: Vec<Fingerprint>) -> RequestId {
        self.submit(move |svc| async move { gek::group_create(&svc, &name, &members).await })
    }

    pub fn group_send_message(&self, uuid: Uuid, plaintext: String) -> RequestId {
        self.submit(move |svc| async move { gek::group_send_message(&svc, &uuid, &plaintext).await })
    }

    pub fn group_add_member(&self, uuid: Uuid, member: Fingerprint) -> RequestId {
        self.submit(move |svc| async move { gek::group_add_member(&svc, &uuid, &member).await })
    }

    pub fn group_remove_member(&self, uuid: Uuid, member: Fingerprint) -> RequestId {
        self.submit(move |svc| async move { gek::group_remove_member(&svc, &uuid, &member).await })
    }

    pub fn group_sync(&self, uuid: Uuid, full: bool) -> RequestId {
        self.submit(move |svc| async move {
            let report = gek::group_sync(&svc, &uuid, full).await?;
            Ok(Payload::Sync(report))
        })
    }

    pub fn group_get_conversation(&self, uuid: Uuid) -> RequestId {
        self.submit(move |svc| async move {
            Ok(Payload::GroupMessages(gek::group_conversation(&svc, &uuid).await?))
        })
    }

    pub fn group_publish_gek(&self, uuid: Uuid) -> RequestId {
        self.submit(move |svc| async move { gek::group_publish_gek(&svc, &uuid).await })
    }

    pub fn group_fetch_gek(&self, uuid: Uuid, version: Option<u32>) -> RequestId {
        self.submit(move |svc| async move { gek::group_fetch_gek(&svc, &uuid, version).await })
    }

    // ── Backup ───────────────────────────────────────────────────────────────

    pub fn backup_messages(&self, path: PathBuf, password: Option<String>) -> RequestId {
        self.submit(move |svc| async move {
            let snapshot = svc.store.export_snapshot(now_secs()).await?;
            let json = serde_json::to_vec(&snapshot).map_err(|_| ErrorKind::Internal)?;
            keyfile::seal(
                &path,
                KeyFileAlg::Snapshot,
                &[],
                &json,
                password.as_deref().filter(|p| !p.is_empty()),
            )?;
            Ok(Payload::Unit)
        })
    }

    pub fn restore_messages(&self, path: PathBuf, password: Option<String>) -> RequestId {
        self.submit(move |svc| async move {
            let file = keyfile::load(&path, password.as_deref().filter(|p| !p.is_empty()))?;
            let snapshot: dna_store::backup::Snapshot =
                serde_json::from_slice(&file.secret).map_err(|_| ErrorKind::MalformedRecord)?;
            let report = svc.store.import_snapshot(&snapshot).await?;
            Ok(Payload::Backup(report))
        })
    }

    /// Publish the encrypted contact-list backup to the DHT.
    pub fn backup_contacts(&self) -> RequestId {
        self.submit(move |svc| async move {
            outbox::publish_contact_backup(&svc).await?;
            Ok(Payload::Unit)
        })
    }

    /// Merge the DHT contact-list backup into the local contact set.
    pub fn restore_contacts(&self) -> RequestId {
        self.submit(move |svc| async move {
            let contacts_imported = outbox::restore_contact_backup(&svc).await?;
            Ok(Payload::Backup(dna_store::backup::ImportReport {
                contacts_imported,
                ..Default::default()
            }))
        })
    }

    // ── Presence ─────────────────────────────────────────────────────────────

    pub fn pause_presence(&self) -> RequestId {
        let paused = self.inner.presence_paused.clone();
        self.submit(move |_svc| async move {
            paused.store(true, Ordering::SeqCst);
            Ok(Payload::Unit)
        })
    }

    pub fn resume_presence(&self) -> RequestId {
        let paused = self.inner.presence_paused.clone();
        self.submit(move |svc| async move {
            paused.store(false, Ordering::SeqCst);
            presence::publish_once(&svc).await?;
            Ok(Payload::Unit)
        })
    }

    pub fn refresh_presence(&self) -> RequestId {
        self.submit(move |svc| async move {
            presence::publish_once(&svc).await?;
            Ok(Payload::Unit)
        })
    }

    /// Number of live per-contact listeners (diagnostics).
    pub async fn active_listeners(&self) -> usize {
        self.inner.listeners.active_count().await
    }
}
