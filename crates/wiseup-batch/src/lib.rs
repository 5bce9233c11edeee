//! # wiseup-batch
//!
//! Batch Writer for high-frequency counters and audit rows.
//!
//! Callers get an [`Ack`] once a mutation is durably journaled; a background
//! loop applies queued mutations to the authoritative store, per row in
//! enqueue order, retrying with backoff and moving exhausted batches to
//! dead letters.

mod config;
mod error;
pub mod journal;
mod mutation;
mod writer;

pub use config::{BatchConfig, DEAD_LETTER_TABLE, table_view_prefix};
pub use error::BatchError;
pub use journal::{DynJournal, FileJournal, Journal, JournalRecord, MemoryJournal, Replay, replay};
pub use mutation::{Ack, BatchedMutation, DeadLetter, Mutation};
pub use writer::{BatchStats, BatchWriter, FlushReport};
