//! Log Store
//!
//! The durable append-only row store the protected log writes to. The store
//! is an external collaborator; this module defines the contract the
//! subsystem requires plus the bundled implementations (SQLite for
//! deployments, in-memory for tests and embedded use).

pub mod memory;
pub mod sql;

use async_trait::async_trait;
use std::collections::HashSet;

use crate::audit::row::{LogEventIdentifier, LogEventRow};
use crate::error::ProtectedLogError;

pub use memory::MemoryLogStore;
pub use sql::SqlLogStore;

/// Filter for read queries. All present fields are ANDed.
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub ca_id: Option<u32>,
    pub module: Option<u32>,
    pub event_code: Option<u32>,
    pub username: Option<String>,
    pub admin_type: Option<String>,
    /// Inclusive lower bound on event time, milliseconds.
    pub occurred_after: Option<i64>,
    /// Inclusive upper bound on event time, milliseconds.
    pub occurred_before: Option<i64>,
}

/// Storage contract: a table keyed by `(node_id, counter)` supporting point
/// lookup, newest-per-node, newest-globally and range scans by event time.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Persist one row. Each identifier may be inserted at most once;
    /// a duplicate is an error, never an overwrite.
    async fn add_row(&self, row: &LogEventRow) -> Result<(), ProtectedLogError>;

    async fn get_row(
        &self,
        id: &LogEventIdentifier,
    ) -> Result<Option<LogEventRow>, ProtectedLogError>;

    /// The newest row across all nodes, by event time.
    async fn newest_row(&self) -> Result<Option<LogEventRow>, ProtectedLogError>;

    /// The newest row written by one node, by counter.
    async fn newest_row_for_node(
        &self,
        node_id: u64,
    ) -> Result<Option<LogEventRow>, ProtectedLogError>;

    /// For every node except `node_id`, the identifier of its newest row
    /// with event time strictly later than `after`.
    async fn newest_rows_for_other_nodes(
        &self,
        node_id: u64,
        after: i64,
    ) -> Result<Vec<LogEventIdentifier>, ProtectedLogError>;

    /// All node ids present in the store.
    async fn node_ids(&self) -> Result<Vec<u64>, ProtectedLogError>;

    /// Rows with event time strictly older than `cutoff`, oldest first.
    async fn rows_older_than(&self, cutoff: i64)
        -> Result<Vec<LogEventRow>, ProtectedLogError>;

    /// The set of identifiers referenced by `linked_in_identifiers` of rows
    /// with event time at or after `cutoff`.
    async fn link_targets_since(
        &self,
        cutoff: i64,
    ) -> Result<HashSet<LogEventIdentifier>, ProtectedLogError>;

    /// Delete the given rows. Returns the number actually removed.
    async fn delete_rows(
        &self,
        ids: &[LogEventIdentifier],
    ) -> Result<u64, ProtectedLogError>;

    /// Filtered read, ordered by event time descending. `privileges` is an
    /// opaque authorization predicate the store ANDs into the query; it is
    /// never reinterpreted by this subsystem.
    async fn query(
        &self,
        filter: &LogFilter,
        privileges: Option<&str>,
    ) -> Result<Vec<LogEventRow>, ProtectedLogError>;
}

impl LogFilter {
    /// In-process evaluation of the structured part of the filter, used by
    /// stores that hold rows as values rather than SQL.
    pub fn matches(&self, row: &LogEventRow) -> bool {
        if let Some(ca_id) = self.ca_id {
            if row.ca_id != ca_id {
                return false;
            }
        }
        if let Some(module) = self.module {
            if row.module != module {
                return false;
            }
        }
        if let Some(event_code) = self.event_code {
            if row.event_code != event_code {
                return false;
            }
        }
        if let Some(username) = &self.username {
            if row.username.as_deref() != Some(username.as_str()) {
                return false;
            }
        }
        if let Some(admin_type) = &self.admin_type {
            if &row.admin_type != admin_type {
                return false;
            }
        }
        if let Some(after) = self.occurred_after {
            if row.event_time < after {
                return false;
            }
        }
        if let Some(before) = self.occurred_before {
            if row.event_time > before {
                return false;
            }
        }
        true
    }
}
