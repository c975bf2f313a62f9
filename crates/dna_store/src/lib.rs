//! dna_store — local persistence for the messaging core.
//!
//! SQLite via sqlx, WAL mode, embedded migrations. One store per
//! identity, rooted in the identity's data directory.
//!
//! # Module layout
//! - `db`       — pool setup and the `Store` handle
//! - `models`   — row structs and the message state machine
//! - `messages` — conversations, seq allocation, dedup, retry queue
//! - `contacts` — contact set, watermarks, blocking
//! - `groups`   — groups, members, GEK cache, group history
//! - `backup`   — JSON snapshot export / merge import
//! - `error`    — unified error type

pub mod backup;
pub mod contacts;
pub mod db;
pub mod error;
pub mod groups;
pub mod messages;
pub mod models;

pub use db::Store;
pub use error::StoreError;
pub use models::{Direction, MessageRow, MessageState};
