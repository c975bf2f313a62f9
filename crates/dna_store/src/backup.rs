//! Snapshot export and merge import for conversations and contacts.
//!
//! The snapshot is plain JSON here; the engine seals it with the same
//! container format as the key files before it leaves the store.

use serde::{Deserialize, Serialize};

use dna_crypto::Fingerprint;

use crate::db::Store;
use crate::error::StoreError;
use crate::models::Direction;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMessage {
    pub peer_fp: String,
    pub direction: Direction,
    pub seq_num: i64,
    pub plaintext: String,
    pub timestamp: i64,
    pub state: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotContact {
    pub fp: String,
    pub display_name: Option<String>,
    pub nickname: Option<String>,
    pub blocked: bool,
    pub added_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub exported_at: i64,
    pub contacts: Vec<SnapshotContact>,
    pub messages: Vec<SnapshotMessage>,
}

/// Counters returned by a merge import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportReport {
    pub messages_imported: u64,
    pub messages_skipped: u64,
    pub contacts_imported: u64,
}

impl Store {
    /// Serialize every conversation and contact.
    pub async fn export_snapshot(&self, now: i64) -> Result<Snapshot, StoreError> {
        let mut messages = Vec::new();
        for peer_hex in self.conversation_peers().await? {
            let peer = Fingerprint::from_hex(&peer_hex)
                .map_err(|_| StoreError::Corrupt(format!("peer fp {peer_hex}")))?;
            for row in self.conversation(&peer).await? {
                messages.push(SnapshotMessage {
                    peer_fp: row.peer_fp.clone(),
                    direction: row.direction_enum()?,
                    seq_num: row.seq_num,
                    plaintext: row.plaintext.clone(),
                    timestamp: row.timestamp,
                    state: row.state.clone(),
                });
            }
        }

        let contacts = self
            .contacts()
            .await?
            .into_iter()
            .map(|c| SnapshotContact {
                fp: c.fp,
                display_name: c.display_name,
                nickname: c.nickname,
                blocked: c.blocked,
                added_at: c.added_at,
            })
            .collect();

        Ok(Snapshot {
            version: 1,
            exported_at: now,
            contacts,
            messages,
        })
    }

    /// Merge a snapshot into the store. Existing rows win; duplicates are
    /// counted, not overwritten.
    pub async fn import_snapshot(&self, snapshot: &Snapshot) -> Result<ImportReport, StoreError> {
        let mut report = ImportReport::default();

        for contact in &snapshot.contacts {
            let fp = Fingerprint::from_hex(&contact.fp)
                .map_err(|_| StoreError::Corrupt(format!("contact fp {}", contact.fp)))?;
            let existed = self.contact(&fp).await?.is_some();
            self.upsert_contact(&fp, contact.display_name.as_deref(), contact.added_at)
                .await?;
            if !existed {
                report.contacts_imported += 1;
                if contact.blocked {
                    self.set_blocked(&fp, true).await?;
                }
                if contact.nickname.is_some() {
                    self.set_nickname(&fp, contact.nickname.as_deref()).await?;
                }
            }
        }

        for msg in &snapshot.messages {
            let inserted = self
                .import_message(
                    &msg.peer_fp,
                    msg.direction,
                    msg.seq_num,
                    &msg.plaintext,
                    msg.timestamp,
                    &msg.state,
                )
                .await?;
            if inserted {
                report.messages_imported += 1;
            } else {
                report.messages_skipped += 1;
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(byte: u8) -> Fingerprint {
        Fingerprint::of_signing_key(&[byte])
    }

    #[tokio::test]
    async fn export_import_merge() {
        let source = Store::open_in_memory().await.unwrap();
        let alice = fp(1);
        source.upsert_contact(&alice, Some("alice"), 10).await.unwrap();
        source.insert_outgoing(&alice, "one", 100).await.unwrap();
        source.insert_incoming(&alice, 1, "reply", b"ct", 101).await.unwrap();

        let snapshot = source.export_snapshot(200).await.unwrap();
        assert_eq!(snapshot.messages.len(), 2);
        assert_eq!(snapshot.contacts.len(), 1);

        // Import into a store that already has one of the two messages.
        let target = Store::open_in_memory().await.unwrap();
        target.insert_incoming(&alice, 1, "reply", b"ct", 101).await.unwrap();
        let report = target.import_snapshot(&snapshot).await.unwrap();
        assert_eq!(report.messages_imported, 1);
        assert_eq!(report.messages_skipped, 1);
        assert_eq!(report.contacts_imported, 1);

        // Re-import is a no-op.
        let again = target.import_snapshot(&snapshot).await.unwrap();
        assert_eq!(again.messages_imported, 0);
        assert_eq!(again.messages_skipped, 2);
        assert_eq!(again.contacts_imported, 0);
    }
}
