//! This module defines the `MigrationStore` trait, the storage port the coordinator uses to talk
//! to the database holding the status ledger. Backends live in their own crates (`migra_pg`,
//! `migra_mem`); the coordinator only depends on this contract.

use crate::migration::Migration;
use crate::status::{MigrationStatus, SchemaState, SequenceId, StatusEntry};
use async_trait::async_trait;

/// Errors returned by a [`MigrationStore`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backing store could not be reached.
    #[error("storage unreachable: {0}")]
    Unreachable(String),
    /// The status ledger is missing or could not be created.
    #[error("schema error: {0}")]
    Schema(String),
    /// A live ledger entry already uses this name.
    #[error("migration {0} already exists")]
    AlreadyExists(String),
    /// No applied ledger entry has this name.
    #[error("no applied migration named {0}")]
    NotFound(String),
    /// There is no applied migration to roll back.
    #[error("no applied migration to roll back")]
    NothingApplied,
    /// The forward script failed.
    #[error("migration {name} failed: {reason}")]
    Execution {
        /// The migration name.
        name: String,
        /// The error reported by the database.
        reason: String,
    },
    /// The migration has an empty reverse script.
    #[error("migration {0} has no reverse script")]
    MissingReverse(String),
    /// The reverse script failed.
    #[error("rollback of {name} failed: {reason}")]
    Rollback {
        /// The migration name.
        name: String,
        /// The error reported by the database.
        reason: String,
    },
    /// A status write failed or found the entry in an unexpected state.
    #[error("could not move entry {sequence_id} to {status}: {reason}")]
    StatusTransition {
        /// The ledger entry.
        sequence_id: SequenceId,
        /// The status that could not be written.
        status: MigrationStatus,
        /// Why the write failed.
        reason: String,
    },
    /// Any other backend failure.
    #[error("backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl StoreError {
    /// Transient errors are retried by the ordering wait loop; everything else is final.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unreachable(_))
    }
}

/// The storage port.
///
/// Implementations own the status ledger and must assign sequence ids atomically with the
/// insertion of the ledger entry. Every status transition is checked against the current state
/// of the entry and reported through the returned `Result`.
#[async_trait]
pub trait MigrationStore: Send + Sync {
    /// Liveness check. Called before any other operation.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Creates the ledger and its supporting types if they are absent. Safe to call on every
    /// startup.
    async fn ensure_schema(&self) -> Result<SchemaState, StoreError>;

    /// Inserts a `REGISTERED` entry and returns its sequence id.
    ///
    /// A `REGISTERED` entry left behind by an earlier run with the same name and scripts is
    /// adopted instead: its sequence id is returned and the run resumes in its place. Any other
    /// live entry with the same name is [`StoreError::AlreadyExists`].
    async fn register(&self, migration: &Migration) -> Result<SequenceId, StoreError>;

    /// Moves the entry to `PENDING`, runs the forward script and moves it to `READY` or `FAIL`.
    ///
    /// When several runs adopted the same entry only the first one to move it to `PENDING`
    /// executes it; the others get a [`StoreError::StatusTransition`] to `PENDING`.
    async fn execute(&self, migration: &Migration, sequence_id: SequenceId)
    -> Result<(), StoreError>;

    /// Rolls back the applied entry with the greatest sequence id.
    async fn rollback_last(&self) -> Result<StatusEntry, StoreError>;

    /// Rolls back the applied entry with the given name.
    async fn rollback_by_name(&self, name: &str) -> Result<StatusEntry, StoreError>;

    /// Every ledger entry, ordered by sequence id.
    async fn list_status(&self) -> Result<Vec<StatusEntry>, StoreError>;

    /// The smallest sequence id among in-flight entries (`REGISTERED`, `PENDING`).
    async fn next_turn(&self) -> Result<Option<SequenceId>, StoreError>;

    /// The smallest sequence id among live entries with the given name.
    async fn first_live_sequence(&self, name: &str) -> Result<Option<SequenceId>, StoreError>;
}
