//! Status ledger types: sequence ids, the status state machine and ledger entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Monotonic id assigned to a ledger entry at registration. The total order of sequence ids is
/// the order in which migrations are allowed to execute, across every process sharing the
/// ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SequenceId(pub i64);

impl fmt::Display for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl From<i64> for SequenceId {
    fn from(value: i64) -> Self {
        SequenceId(value)
    }
}

/// Lifecycle state of a ledger entry.
///
/// ```text
/// REGISTERED -> PENDING -> READY | FAIL
/// READY -> ROLLING_BACK -> ROLLED_BACK
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrationStatus {
    /// Holds a sequence id but has not been allowed to run yet.
    Registered,
    /// Holds the turn and is executing.
    Pending,
    /// Forward script applied.
    Ready,
    /// Forward script failed.
    Fail,
    /// Reverse script running, or a previous attempt at it failed.
    RollingBack,
    /// Reverse script applied.
    RolledBack,
}

impl MigrationStatus {
    /// Every status, in state machine order.
    pub const ALL: [MigrationStatus; 6] = [
        MigrationStatus::Registered,
        MigrationStatus::Pending,
        MigrationStatus::Ready,
        MigrationStatus::Fail,
        MigrationStatus::RollingBack,
        MigrationStatus::RolledBack,
    ];

    /// The persisted textual form.
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationStatus::Registered => "REGISTERED",
            MigrationStatus::Pending => "PENDING",
            MigrationStatus::Ready => "READY",
            MigrationStatus::Fail => "FAIL",
            MigrationStatus::RollingBack => "ROLLING_BACK",
            MigrationStatus::RolledBack => "ROLLED_BACK",
        }
    }

    /// Entries in these states hold the execution queue: the smallest in-flight sequence id is
    /// the one whose turn it is.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, MigrationStatus::Registered | MigrationStatus::Pending)
    }

    /// The forward script has finished, successfully or not.
    pub fn is_forward_terminal(&self) -> bool {
        matches!(self, MigrationStatus::Ready | MigrationStatus::Fail)
    }

    /// End states of either direction. `READY` only leaves through an explicit rollback.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MigrationStatus::Ready | MigrationStatus::Fail | MigrationStatus::RolledBack
        )
    }

    /// Entries in these states occupy their name: registering the same name again is a
    /// conflict.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            MigrationStatus::Registered
                | MigrationStatus::Pending
                | MigrationStatus::Ready
                | MigrationStatus::RollingBack
        )
    }

    /// The forward script is (still) applied, so the entry is a rollback target.
    pub fn is_applied(&self) -> bool {
        matches!(self, MigrationStatus::Ready | MigrationStatus::RollingBack)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: MigrationStatus) -> bool {
        use MigrationStatus::*;
        matches!(
            (self, next),
            (Registered, Pending)
                | (Pending, Ready)
                | (Pending, Fail)
                | (Ready, RollingBack)
                | (RollingBack, RolledBack)
        )
    }
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Returned when parsing a status string that is not part of the state machine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown migration status: {0}")]
pub struct UnknownStatusError(pub String);

impl FromStr for MigrationStatus {
    type Err = UnknownStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MigrationStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatusError(s.to_string()))
    }
}

/// A durable ledger row describing one registered migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEntry {
    /// Position in the global execution order.
    pub sequence_id: SequenceId,
    /// The migration name.
    pub name: String,
    /// Current lifecycle state.
    pub status: MigrationStatus,
    /// When the entry was registered.
    pub registered_at: DateTime<Utc>,
}

/// Outcome of `ensure_schema`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaState {
    /// The ledger was missing and has been created.
    Created,
    /// The ledger was already present; nothing was executed.
    Existing,
}
