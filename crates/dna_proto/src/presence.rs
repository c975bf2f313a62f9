//! Presence: timestamp-only liveness, deliberately free of any network
//! address. The record itself is tiny JSON; authenticity comes from the
//! signed DHT put, not from an embedded signature.

use serde::{Deserialize, Serialize};

use crate::error::ProtoError;

/// Readers treat < 5 minutes as online, < 24 hours as recently seen.
pub const ONLINE_WINDOW_SECS: i64 = 300;
pub const RECENT_WINDOW_SECS: i64 = 86_400;

/// Refresh cadence and DHT lifetime.
pub const DEFAULT_PERIOD_SECS: u64 = 60;
pub const TTL_SECS: u64 = 7 * 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub timestamp: i64,
}

impl PresenceRecord {
    pub fn at(now: i64) -> Self {
        Self { timestamp: now }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtoError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtoError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn status_at(&self, now: i64) -> PresenceStatus {
        PresenceStatus::classify(now, self.timestamp)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    RecentlySeen,
    Offline,
}

impl PresenceStatus {
    pub fn classify(now: i64, last_seen: i64) -> Self {
        let age = now - last_seen;
        if age < ONLINE_WINDOW_SECS {
            PresenceStatus::Online
        } else if age < RECENT_WINDOW_SECS {
            PresenceStatus::RecentlySeen
        } else {
            PresenceStatus::Offline
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_windows() {
        let now = 1_700_000_000;
        assert_eq!(PresenceStatus::classify(now, now - 10), PresenceStatus::Online);
        assert_eq!(
            PresenceStatus::classify(now, now - ONLINE_WINDOW_SECS),
            PresenceStatus::RecentlySeen
        );
        assert_eq!(
            PresenceStatus::classify(now, now - RECENT_WINDOW_SECS),
            PresenceStatus::Offline
        );
    }

    #[test]
    fn record_is_timestamp_only_json() {
        let record = PresenceRecord::at(1_700_000_000);
        let bytes = record.to_bytes().unwrap();
        assert_eq!(bytes, br#"{"timestamp":1700000000}"#);
        assert_eq!(PresenceRecord::from_bytes(&bytes).unwrap(), record);
    }
}
