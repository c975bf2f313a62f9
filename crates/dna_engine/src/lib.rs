//! dna_engine — the DNA messaging engine.
//!
//! Everything between the key material and the DHT: identity lifecycle,
//! the keyserver, presence, the Spillway DM outbox with smart sync and
//! ACKs, per-contact listeners, the GEK group engine, the retry loop and
//! the asynchronous façade the front ends drive.
//!
//! The façade model: every verb returns a `RequestId` immediately; work
//! runs on a bounded worker pool; one callback task drains the completion
//! queue and invokes the caller's callback serially, so callbacks never
//! reenter and never run on a worker.
//!
//! # Module layout
//! - `engine`   — the `Engine` façade and request plumbing
//! - `api`      — completion payloads and view types
//! - `config`   — TOML-loadable engine configuration
//! - `identity` — identity create/restore/load/delete + key vault
//! - `keyserver`— identity record publication and name lookups
//! - `presence` — periodic liveness publication
//! - `outbox`   — Spillway enqueue, sweep, ACK publication, prune
//! - `listener` — per-contact push subscriptions
//! - `gek`      — group keys, IKP rotation, group messages
//! - `retry`    — backoff policy and the delivery retry loop
//! - `error`    — the closed error taxonomy

pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod gek;
pub mod identity;
pub mod keyserver;
pub mod listener;
pub mod outbox;
pub mod presence;
pub mod retry;
mod services;

pub use api::{Completion, CompletionCallback, Payload, RequestId, SyncReport};
pub use config::EngineConfig;
pub use engine::Engine;
pub use error::ErrorKind;
