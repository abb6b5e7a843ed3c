//! Conflux Tracker - append-only run state history
//!
//! The run tracker owns the authoritative state of every flow run and task
//! run. It accepts validated transitions from the engine, rejects stale or
//! out-of-order writes, treats retransmissions as no-ops, and publishes a
//! [`RunEvent`](conflux_types::RunEvent) for every transition it stores.
//!
//! Queries are lazy: [`RunQuery`] pages through the tracker ordered by
//! creation time, newest first.

#![deny(unsafe_code)]

mod error;
mod memory;
mod query;
mod results;
mod tracker;

pub use error::{Result, TrackerError};
pub use memory::InMemoryRunTracker;
pub use query::RunQuery;
pub use results::{InMemoryResultStore, ResultStore};
pub use tracker::{QueryCursor, RecordOutcome, RunFilter, RunPage, RunSnapshot, RunTracker};
