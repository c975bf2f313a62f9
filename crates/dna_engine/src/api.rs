//! Completion payloads and view types delivered to callbacks.
//!
//! Payloads are owned values: the callback receives them by move, so
//! there is no free-after-return protocol and nothing to deep-copy.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use dna_crypto::Fingerprint;
use dna_proto::presence::PresenceStatus;
use dna_proto::record::Profile;
use dna_store::backup::ImportReport;
use dna_store::models::MessageRow;

use crate::error::ErrorKind;

pub type RequestId = u64;

/// One completion per request, exactly once, on the callback task.
pub struct Completion {
    pub request_id: RequestId,
    pub result: Result<Payload, ErrorKind>,
}

pub type CompletionCallback = Box<dyn Fn(Completion) + Send + Sync + 'static>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageView {
    pub msg_id: i64,
    pub direction: String,
    pub peer_fp: String,
    pub seq_num: u64,
    pub plaintext: String,
    pub timestamp: i64,
    pub state: String,
}

impl From<MessageRow> for MessageView {
    fn from(row: MessageRow) -> Self {
        Self {
            msg_id: row.msg_id,
            direction: row.direction,
            peer_fp: row.peer_fp,
            seq_num: row.seq_num as u64,
            plaintext: row.plaintext,
            timestamp: row.timestamp,
            state: row.state,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMessageView {
    pub group_uuid: String,
    pub sender_fp: String,
    pub gek_version: u32,
    pub plaintext: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactRequestView {
    pub from_fp: Fingerprint,
    pub display_name: String,
    pub greeting: String,
    pub timestamp: i64,
}

/// Offline-sync result. Partial success is counters, not an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncReport {
    /// New messages stored.
    pub processed: u64,
    /// Entries skipped: duplicates, below-watermark, not addressed to us,
    /// or failed verification.
    pub skipped: u64,
    /// Unique senders with at least one new message this sweep.
    pub senders: u64,
    /// Pending contact requests surfaced by this sweep.
    pub contact_requests: Vec<ContactRequestView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Payload {
    Unit,
    IdentityCreated {
        fingerprint: Fingerprint,
        /// Shown once; afterwards it exists only inside `identity.mnem`.
        recovery_phrase: String,
    },
    IdentityLoaded {
        fingerprint: Fingerprint,
    },
    MessageQueued {
        msg_id: i64,
        seq_num: u64,
    },
    Messages(Vec<MessageView>),
    Sync(SyncReport),
    FingerprintResult(Fingerprint),
    ProfileResult {
        fingerprint: Fingerprint,
        registered_name: Option<String>,
        profile: Profile,
        presence: PresenceStatus,
    },
    GroupCreated {
        uuid: Uuid,
    },
    GroupMessages(Vec<GroupMessageView>),
    GekVersion(u32),
    Signature(Vec<u8>),
    PublicKey(Vec<u8>),
    Backup(ImportReport),
}
