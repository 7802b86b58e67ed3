//! Checkpoint / observability ledger.
//!
//! Durable, append-only record of task transitions, retry attempts, delivery
//! failures and recovery points. Restoring hands the snapshot back; re-applying
//! it to a live task or agent is the caller's job.

pub mod checkpoint;
pub mod sqlite;

pub use checkpoint::{Checkpoint, CheckpointRef};
pub use sqlite::Ledger;
