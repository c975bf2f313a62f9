//! dna_proto — DNA messenger protocol records and wire formats
//!
//! Everything that crosses the DHT is defined here: the signed identity
//! record and name index, the DM envelope, outbox entries and ACKs,
//! presence, group metadata, group messages and the Initial Key Packet.
//!
//! JSON (serde) for replaceable signed records; fixed-offset binary for
//! the envelope, IKP and group message, which are byte-exact formats.
//!
//! # Module layout
//! - `record`   — identity record, profile, name index
//! - `envelope` — sealed direct-message envelope
//! - `outbox`   — per-day outbox entries, ACK records, contact requests
//! - `presence` — liveness record and status classification
//! - `group`    — group metadata record and group message blob
//! - `ikp`      — Initial Key Packet (GEK distribution)
//! - `dht_keys` — SHA3-512 key derivations for every DHT channel
//! - `error`    — unified error type

pub mod dht_keys;
pub mod envelope;
pub mod error;
pub mod group;
pub mod ikp;
pub mod outbox;
pub mod presence;
pub mod record;

pub use error::ProtoError;
