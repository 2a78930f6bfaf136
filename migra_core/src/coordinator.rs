//! The execution coordinator and the rollback policy engine.

use crate::cancel::CancelToken;
use crate::message::{Message, MessageKind, MessageStream, ProgressSender, progress_channel};
use crate::migration::Migration;
use crate::ordering::{PollingTurn, TurnError, TurnStrategy};
use crate::status::{MigrationStatus, SchemaState, SequenceId, StatusEntry};
use crate::store::{MigrationStore, StoreError};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;

/// What to do with the earlier migrations of a batch when one of them fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RollbackPolicy {
    /// Stop. Earlier migrations of the batch stay applied.
    #[default]
    Break,
    /// Roll back every earlier migration of the batch, newest first.
    Rollback,
}

/// Configuration for a [`Coordinator`].
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// How often the ledger is polled while waiting for a turn.
    pub poll_interval: Duration,

    /// Capacity of the progress channel. When the consumer falls this many messages behind, the
    /// batch waits for it.
    pub progress_capacity: usize,

    /// Maximum time a migration may wait for its turn before the batch is cancelled.
    /// `None` waits until explicitly cancelled.
    pub wait_timeout: Option<Duration>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            progress_capacity: 64,
            wait_timeout: None,
        }
    }
}

impl CoordinatorConfig {
    /// Sets the polling interval.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Sets the progress channel capacity.
    pub fn with_progress_capacity(mut self, progress_capacity: usize) -> Self {
        self.progress_capacity = progress_capacity;
        self
    }

    /// Sets the wait deadline.
    pub fn with_wait_timeout(mut self, wait_timeout: Option<Duration>) -> Self {
        self.wait_timeout = wait_timeout;
        self
    }
}

/// Errors returned directly by the coordinator, outside of a batch.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    /// `ping` failed.
    #[error("storage unreachable: {0}")]
    Connectivity(#[source] StoreError),
    /// `ensure_schema` failed.
    #[error("could not prepare the migration ledger: {0}")]
    Schema(#[source] StoreError),
    /// Any other storage error.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Why a single migration of a batch did not complete. Carried by failure [`Message`]s.
#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    /// Registering the ledger entry failed.
    #[error("could not register migration: {0}")]
    Register(#[source] StoreError),
    /// A live entry already uses this name.
    #[error("migration {0} already exists")]
    AlreadyExists(String),
    /// Another run adopted the same entry and executed it first.
    #[error("entry {sequence_id} of {name} was taken over by another run and is {status}")]
    Claimed {
        /// The migration name.
        name: String,
        /// The shared sequence id.
        sequence_id: SequenceId,
        /// The status the other run left the entry in.
        status: MigrationStatus,
    },
    /// The ledger contradicts the registered identity of the migration.
    #[error("ordering inconsistency: entry {sequence_id} is no longer the registration of {name}")]
    OrderingInconsistency {
        /// The migration name.
        name: String,
        /// The sequence id returned at registration.
        sequence_id: SequenceId,
    },
    /// The wait for the turn failed on a storage error.
    #[error("could not determine turn: {0}")]
    Turn(#[source] StoreError),
    /// The wait was cancelled.
    #[error("cancelled while waiting for turn")]
    Cancelled,
    /// The wait deadline elapsed.
    #[error("gave up waiting for turn after {0:?}")]
    DeadlineElapsed(Duration),
    /// Executing the forward script, or recording its outcome, failed.
    #[error("{0}")]
    Execution(#[source] StoreError),
    /// Rolling back an earlier migration failed.
    #[error("{0}")]
    Rollback(#[source] StoreError),
}

impl From<TurnError> for ApplyError {
    fn from(err: TurnError) -> Self {
        match err {
            TurnError::Cancelled => ApplyError::Cancelled,
            TurnError::DeadlineElapsed(timeout) => ApplyError::DeadlineElapsed(timeout),
            TurnError::Inconsistent { name, sequence_id } => {
                ApplyError::OrderingInconsistency { name, sequence_id }
            }
            TurnError::Store(err) => ApplyError::Turn(err),
        }
    }
}

/// Orchestrates batches of migrations against a [`MigrationStore`].
pub struct Coordinator<S, T = PollingTurn> {
    store: Arc<S>,
    turns: Arc<T>,
    config: CoordinatorConfig,
}

impl<S, T> Clone for Coordinator<S, T> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            turns: Arc::clone(&self.turns),
            config: self.config.clone(),
        }
    }
}

impl<S> Coordinator<S, PollingTurn>
where
    S: MigrationStore + 'static,
{
    /// Creates a coordinator with default configuration.
    pub fn new(store: S) -> Self {
        Self::with_config(store, CoordinatorConfig::default())
    }

    /// Creates a coordinator polling for turns as configured.
    pub fn with_config(store: S, config: CoordinatorConfig) -> Self {
        let turns = PollingTurn::new(config.poll_interval).with_timeout(config.wait_timeout);
        Self {
            store: Arc::new(store),
            turns: Arc::new(turns),
            config,
        }
    }
}

impl<S, T> Coordinator<S, T>
where
    S: MigrationStore + 'static,
    T: TurnStrategy<S> + 'static,
{
    /// Replaces the ordering strategy.
    pub fn with_turn_strategy<U>(self, turns: U) -> Coordinator<S, U>
    where
        U: TurnStrategy<S> + 'static,
    {
        Coordinator {
            store: self.store,
            turns: Arc::new(turns),
            config: self.config,
        }
    }

    /// The storage port.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// The configuration.
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Checks connectivity and makes sure the ledger exists. Both failures are fatal.
    pub async fn prepare(&self) -> Result<SchemaState, CoordinatorError> {
        self.store
            .ping()
            .await
            .map_err(CoordinatorError::Connectivity)?;
        let state = self
            .store
            .ensure_schema()
            .await
            .map_err(CoordinatorError::Schema)?;
        debug!("Migration ledger ready ({:?})", state);
        Ok(state)
    }

    /// Applies `migrations` in order on a background task and returns its progress stream.
    pub fn apply(&self, migrations: Vec<Migration>, policy: RollbackPolicy) -> MessageStream {
        self.apply_with_cancel(migrations, policy, CancelToken::never())
    }

    /// Like [`apply`](Self::apply), stopping the wait for a turn when `cancel` fires.
    pub fn apply_with_cancel(
        &self,
        migrations: Vec<Migration>,
        policy: RollbackPolicy,
        cancel: CancelToken,
    ) -> MessageStream {
        let (progress, stream) = progress_channel(self.config.progress_capacity);
        let batch = Batch {
            store: Arc::clone(&self.store),
            turns: Arc::clone(&self.turns),
            progress,
            policy,
            cancel,
        };
        tokio::spawn(batch.run(migrations));
        stream
    }

    /// Rolls back the most recently applied migration.
    pub async fn rollback_last(&self) -> Result<StatusEntry, CoordinatorError> {
        let entry = self.store.rollback_last().await?;
        info!("Rolled back {} (entry {})", entry.name, entry.sequence_id);
        Ok(entry)
    }

    /// Rolls back the applied migration with the given name.
    pub async fn rollback(&self, name: &str) -> Result<StatusEntry, CoordinatorError> {
        let entry = self.store.rollback_by_name(name).await?;
        info!("Rolled back {} (entry {})", entry.name, entry.sequence_id);
        Ok(entry)
    }

    /// The ledger, ordered by sequence id.
    pub async fn status(&self) -> Result<Vec<StatusEntry>, CoordinatorError> {
        Ok(self.store.list_status().await?)
    }
}

/// State of one running batch.
struct Batch<S, T> {
    store: Arc<S>,
    turns: Arc<T>,
    progress: ProgressSender,
    policy: RollbackPolicy,
    cancel: CancelToken,
}

impl<S, T> Batch<S, T>
where
    S: MigrationStore + 'static,
    T: TurnStrategy<S> + 'static,
{
    async fn run(mut self, migrations: Vec<Migration>) {
        // Names applied by this batch, in application order.
        let mut applied: Vec<String> = Vec::with_capacity(migrations.len());

        for migration in &migrations {
            let name = migration.name();
            match self.apply_one(migration).await {
                Ok(()) => {
                    info!("Applied migration {}", name);
                    applied.push(name.to_string());
                    self.progress
                        .send(Message::new(MessageKind::Applied, "Applied").for_migration(name))
                        .await;
                }
                Err(err @ (ApplyError::AlreadyExists(_) | ApplyError::Claimed { .. })) => {
                    warn!("Skipping migration {}: {}", name, err);
                    self.progress
                        .send(
                            Message::new(MessageKind::Skipped, "Skipped")
                                .for_migration(name)
                                .with_error(err),
                        )
                        .await;
                }
                Err(err @ (ApplyError::Cancelled | ApplyError::DeadlineElapsed(_))) => {
                    warn!("Batch stopped before {}: {}", name, err);
                    self.progress
                        .send(
                            Message::new(MessageKind::Cancelled, "Cancelled")
                                .for_migration(name)
                                .with_error(err),
                        )
                        .await;
                    break;
                }
                Err(err) => {
                    error!("Migration {} failed: {}", name, err);
                    self.progress
                        .send(
                            Message::new(MessageKind::Failed, "Failed")
                                .for_migration(name)
                                .with_error(err),
                        )
                        .await;
                    if self.policy == RollbackPolicy::Rollback {
                        self.unwind(&applied).await;
                    }
                    break;
                }
            }
        }
        // Dropping `self.progress` closes the stream.
    }

    async fn apply_one(&mut self, migration: &Migration) -> Result<(), ApplyError> {
        if self.cancel.is_cancelled() {
            return Err(ApplyError::Cancelled);
        }

        let sequence_id = match self.store.register(migration).await {
            Ok(sequence_id) => sequence_id,
            Err(StoreError::AlreadyExists(name)) => return Err(ApplyError::AlreadyExists(name)),
            Err(err) => return Err(ApplyError::Register(err)),
        };
        debug!(
            "Registered migration {} as entry {}",
            migration.name(),
            sequence_id
        );

        let outcome = match self
            .turns
            .acquire(
                &*self.store,
                migration,
                sequence_id,
                &self.progress,
                &mut self.cancel,
            )
            .await
        {
            Ok(()) => self
                .store
                .execute(migration, sequence_id)
                .await
                .map_err(ApplyError::Execution),
            Err(err) => Err(err.into()),
        };

        match outcome {
            Err(
                err @ (ApplyError::OrderingInconsistency { .. }
                | ApplyError::Execution(StoreError::StatusTransition {
                    status: MigrationStatus::Pending,
                    ..
                })),
            ) => Err(self.claimed_elsewhere(migration, sequence_id, err).await),
            other => other,
        }
    }

    /// Turns `err` into [`ApplyError::Claimed`] when the entry has left `REGISTERED` because
    /// another run that adopted it got there first.
    async fn claimed_elsewhere(
        &self,
        migration: &Migration,
        sequence_id: SequenceId,
        err: ApplyError,
    ) -> ApplyError {
        let entries = match self.store.list_status().await {
            Ok(entries) => entries,
            Err(lookup) => {
                warn!("Could not look up entry {}: {}", sequence_id, lookup);
                return err;
            }
        };
        match entries
            .into_iter()
            .find(|entry| entry.sequence_id == sequence_id)
        {
            Some(entry)
                if entry.name == migration.name()
                    && entry.status != MigrationStatus::Registered =>
            {
                ApplyError::Claimed {
                    name: entry.name,
                    sequence_id,
                    status: entry.status,
                }
            }
            _ => err,
        }
    }

    async fn unwind(&self, applied: &[String]) {
        for name in applied.iter().rev() {
            match self.store.rollback_by_name(name).await {
                Ok(entry) => {
                    info!("Rolled back {} (entry {})", name, entry.sequence_id);
                    self.progress
                        .send(Message::new(MessageKind::RolledBack, "Rolled back").for_migration(name))
                        .await;
                }
                Err(err) => {
                    error!("Rollback of {} failed: {}", name, err);
                    self.progress
                        .send(
                            Message::new(MessageKind::RollbackFailed, "Rollback failed")
                                .for_migration(name)
                                .with_error(ApplyError::Rollback(err)),
                        )
                        .await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_polls_every_second() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.wait_timeout, None);
        assert!(config.progress_capacity > 0);
    }

    #[test]
    fn builder_methods_override_defaults() {
        let config = CoordinatorConfig::default()
            .with_poll_interval(Duration::from_millis(10))
            .with_progress_capacity(2)
            .with_wait_timeout(Some(Duration::from_secs(5)));
        assert_eq!(config.poll_interval, Duration::from_millis(10));
        assert_eq!(config.progress_capacity, 2);
        assert_eq!(config.wait_timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn default_policy_is_break() {
        assert_eq!(RollbackPolicy::default(), RollbackPolicy::Break);
    }

    #[test]
    fn turn_errors_map_to_apply_errors() {
        let err: ApplyError = TurnError::Inconsistent {
            name: "m1".into(),
            sequence_id: SequenceId(3),
        }
        .into();
        assert!(matches!(
            err,
            ApplyError::OrderingInconsistency { sequence_id: SequenceId(3), .. }
        ));

        let err: ApplyError = TurnError::Cancelled.into();
        assert!(matches!(err, ApplyError::Cancelled));

        let err: ApplyError = TurnError::Store(StoreError::Schema("gone".into())).into();
        assert!(matches!(err, ApplyError::Turn(StoreError::Schema(_))));
    }
}
