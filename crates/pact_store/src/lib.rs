//! A small replicated key/value store driven by a two-phase-commit
//! coordinator.
//!
//! The coordinator accepts `GET`/`SET`/`DEL` over a framed text protocol and
//! fans writes out to a statically configured set of participants with
//! explicit PREPARE/COMMIT/ABORT phases. Every transaction state transition
//! is journaled to an append-only record log, so in-flight transactions
//! resolve deterministically after a crash, and a heartbeat loop detects,
//! drops, and recovers participants via snapshots.

pub mod client;
pub mod client_server;
pub mod coordinator;
pub mod participant;
pub mod participant_client;
pub mod record_log;
pub mod resp;
pub mod rpc;

pub use client::KvClient;
pub use coordinator::{Coordinator, CoordinatorConfig};
pub use participant_client::ParticipantClient;
pub use record_log::{Record, RecordLog, RecordStatus};
