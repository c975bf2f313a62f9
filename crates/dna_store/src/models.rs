//! Row models and the message state machine.

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Outgoing,
    Incoming,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Outgoing => "outgoing",
            Direction::Incoming => "incoming",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "outgoing" => Ok(Direction::Outgoing),
            "incoming" => Ok(Direction::Incoming),
            other => Err(StoreError::Corrupt(format!("direction {other}"))),
        }
    }
}

/// Delivery state. Transitions form a DAG:
/// `queued → sending → {sent, failed}`; `sent → delivered → read`.
/// Incoming messages are stored `delivered` and advance to `read`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageState {
    Queued,
    Sending,
    Sent,
    Delivered,
    Failed,
    Read,
}

impl MessageState {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageState::Queued => "queued",
            MessageState::Sending => "sending",
            MessageState::Sent => "sent",
            MessageState::Delivered => "delivered",
            MessageState::Failed => "failed",
            MessageState::Read => "read",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "queued" => Ok(MessageState::Queued),
            "sending" => Ok(MessageState::Sending),
            "sent" => Ok(MessageState::Sent),
            "delivered" => Ok(MessageState::Delivered),
            "failed" => Ok(MessageState::Failed),
            "read" => Ok(MessageState::Read),
            other => Err(StoreError::Corrupt(format!("state {other}"))),
        }
    }

    pub fn can_transition_to(self, to: MessageState) -> bool {
        use MessageState::*;
        matches!(
            (self, to),
            (Queued, Sending)
                | (Sending, Sent)
                | (Sending, Failed)
                | (Sending, Queued) // transient failure returns to the queue
                | (Failed, Queued) // explicit user retry
                | (Sent, Delivered)
                | (Delivered, Read)
        )
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MessageRow {
    pub msg_id: i64,
    pub direction: String,
    pub peer_fp: String,
    pub seq_num: i64,
    pub plaintext: String,
    pub ciphertext: Option<Vec<u8>>,
    pub timestamp: i64,
    pub state: String,
    pub retry_count: i64,
}

impl MessageRow {
    pub fn direction_enum(&self) -> Result<Direction, StoreError> {
        Direction::parse(&self.direction)
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ContactRow {
    pub fp: String,
    pub display_name: Option<String>,
    pub nickname: Option<String>,
    pub last_seen: i64,
    pub watermark: i64,
    pub last_ack_recv: i64,
    pub last_ack_sent: i64,
    pub dm_last_sync: i64,
    pub blocked: bool,
    pub added_at: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct GroupRow {
    pub uuid: String,
    pub name: String,
    pub owner_fp: String,
    pub gek_version: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct GroupMemberRow {
    pub group_uuid: String,
    pub fp: String,
    pub added_at: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct GroupMessageRow {
    pub group_uuid: String,
    pub message_hash: String,
    pub sender_fp: String,
    pub gek_version: i64,
    pub plaintext: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct QueueRow {
    pub msg_id: i64,
    pub next_retry_at: i64,
    pub attempts: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_machine_edges() {
        use MessageState::*;
        assert!(Queued.can_transition_to(Sending));
        assert!(Sending.can_transition_to(Sent));
        assert!(Sending.can_transition_to(Failed));
        assert!(Sent.can_transition_to(Delivered));
        assert!(Delivered.can_transition_to(Read));
        assert!(Failed.can_transition_to(Queued));

        assert!(!Queued.can_transition_to(Sent));
        assert!(!Sent.can_transition_to(Queued));
        assert!(!Read.can_transition_to(Delivered));
        assert!(!Delivered.can_transition_to(Failed));
    }

    #[test]
    fn string_roundtrips() {
        for state in [
            MessageState::Queued,
            MessageState::Sending,
            MessageState::Sent,
            MessageState::Delivered,
            MessageState::Failed,
            MessageState::Read,
        ] {
            assert_eq!(MessageState::parse(state.as_str()).unwrap(), state);
        }
        assert!(MessageState::parse("bogus").is_err());
        assert_eq!(
            Direction::parse(Direction::Incoming.as_str()).unwrap(),
            Direction::Incoming
        );
    }
}
