//! A single replicated log entry.
//!
//! Replication ships the whole log on every heartbeat rather than
//! negotiating per-peer `prev_log_index`/`match_index` state, so there
//! is no need for a log abstraction beyond this plain entry type; the
//! log itself is just a `Vec<Entry>` owned directly by the node's
//! state.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub operation: String,
    pub term: i64,
    pub index: i64,
}
