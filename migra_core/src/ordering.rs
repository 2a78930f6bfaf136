//! Cross-process ordering of migration execution.
//!
//! Once a migration has been registered it holds a [`SequenceId`]. A [`TurnStrategy`] decides
//! when that id may run: with the default [`PollingTurn`] the ledger itself acts as a FIFO
//! mutex, the smallest in-flight sequence id holding the turn. The strategy is injected into the
//! coordinator so a push based mechanism can replace polling without touching it.

use crate::cancel::CancelToken;
use crate::message::{Message, ProgressSender};
use crate::migration::Migration;
use crate::status::SequenceId;
use crate::store::{MigrationStore, StoreError};
use async_trait::async_trait;
use log::{debug, warn};
use tokio::time::{Duration, Instant, MissedTickBehavior};

/// Errors that end the wait for a turn.
#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    /// The cancellation token fired.
    #[error("wait for turn cancelled")]
    Cancelled,
    /// The configured wait deadline elapsed.
    #[error("wait for turn exceeded {0:?}")]
    DeadlineElapsed(Duration),
    /// The ledger contradicts the registered identity of the migration.
    #[error("entry {sequence_id} is no longer the live registration of {name}")]
    Inconsistent {
        /// The migration name.
        name: String,
        /// The sequence id returned at registration.
        sequence_id: SequenceId,
    },
    /// A non transient storage error.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result of a single turn check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnCheck {
    /// The migration holds the turn.
    Ready,
    /// Another entry, with the given sequence id, holds the turn.
    Waiting(SequenceId),
}

/// Decides when a registered migration is allowed to execute.
#[async_trait]
pub trait TurnStrategy<S>: Send + Sync
where
    S: MigrationStore + ?Sized,
{
    /// Resolves once `sequence_id` holds the turn. Must honour `cancel` and must not mutate the
    /// ledger.
    async fn acquire(
        &self,
        store: &S,
        migration: &Migration,
        sequence_id: SequenceId,
        progress: &ProgressSender,
        cancel: &mut CancelToken,
    ) -> Result<(), TurnError>;
}

/// Performs one turn check for `sequence_id`.
///
/// The turn belongs to the smallest in-flight sequence id. While another entry holds it, the
/// migration's own entry must still be the first live registration of its name; anything else
/// means the ledger no longer matches what was registered.
pub async fn check_turn<S>(
    store: &S,
    migration: &Migration,
    sequence_id: SequenceId,
) -> Result<TurnCheck, TurnError>
where
    S: MigrationStore + ?Sized,
{
    let next = store.next_turn().await?;
    match next {
        Some(next) if next == sequence_id => Ok(TurnCheck::Ready),
        Some(next) if next < sequence_id => {
            let owner = store.first_live_sequence(migration.name()).await?;
            if owner != Some(sequence_id) {
                return Err(TurnError::Inconsistent {
                    name: migration.name().to_string(),
                    sequence_id,
                });
            }
            Ok(TurnCheck::Waiting(next))
        }
        // Our own entry is REGISTERED, so it must be in flight.
        _ => Err(TurnError::Inconsistent {
            name: migration.name().to_string(),
            sequence_id,
        }),
    }
}

/// Polls the ledger at a fixed interval until the migration holds the turn.
#[derive(Debug, Clone)]
pub struct PollingTurn {
    interval: Duration,
    timeout: Option<Duration>,
}

impl Default for PollingTurn {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl PollingTurn {
    /// Creates a strategy polling every `interval`. The first check is immediate.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            timeout: None,
        }
    }

    /// Gives up waiting after `timeout`.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// The polling interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }
}

async fn deadline_reached(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[async_trait]
impl<S> TurnStrategy<S> for PollingTurn
where
    S: MigrationStore + ?Sized,
{
    async fn acquire(
        &self,
        store: &S,
        migration: &Migration,
        sequence_id: SequenceId,
        progress: &ProgressSender,
        cancel: &mut CancelToken,
    ) -> Result<(), TurnError> {
        // `interval` panics on a zero period.
        let mut ticker = tokio::time::interval(self.interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let deadline = self.timeout.map(|timeout| Instant::now() + timeout);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TurnError::Cancelled),
                _ = deadline_reached(deadline) => {
                    return Err(TurnError::DeadlineElapsed(self.timeout.unwrap_or_default()));
                }
                _ = ticker.tick() => {}
            }

            match check_turn(store, migration, sequence_id).await {
                Ok(TurnCheck::Ready) => {
                    debug!(
                        "Migration {} (entry {}) holds the turn",
                        migration.name(),
                        sequence_id
                    );
                    return Ok(());
                }
                Ok(TurnCheck::Waiting(current)) => {
                    debug!(
                        "Migration {} (entry {}) waiting for entry {}",
                        migration.name(),
                        sequence_id,
                        current
                    );
                    // A stalled consumer must not hold off cancellation.
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(TurnError::Cancelled),
                        _ = deadline_reached(deadline) => {
                            return Err(TurnError::DeadlineElapsed(self.timeout.unwrap_or_default()));
                        }
                        _ = progress.send(Message::waiting(migration.name())) => {}
                    }
                }
                Err(TurnError::Store(err)) if err.is_transient() => {
                    warn!(
                        "Turn check for {} (entry {}) failed, retrying in {:?}: {}",
                        migration.name(),
                        sequence_id,
                        self.interval,
                        err
                    );
                }
                Err(err) => return Err(err),
            }
        }
    }
}
