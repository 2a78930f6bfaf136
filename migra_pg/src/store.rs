use async_trait::async_trait;
use chrono::{DateTime, Utc};
use migra_core::prelude::*;
use sqlx::{Executor, PgPool, Postgres};

use crate::schema::{self, REGISTER_LOCK_KEY};

/// A migration store backed by the `migra_migrations` table.
///
/// Every status write is a guarded `UPDATE ... WHERE status = <expected>`; a write that matches
/// no row is reported as [`StoreError::StatusTransition`].
#[derive(Debug, Clone)]
pub struct PgMigrationStore {
    pool: PgPool,
}

impl PgMigrationStore {
    /// Creates a store using the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[derive(Debug, sqlx::FromRow)]
struct EntryRow {
    id: i64,
    name: String,
    status: String,
    registered_at: DateTime<Utc>,
}

impl TryFrom<EntryRow> for StatusEntry {
    type Error = StoreError;

    fn try_from(row: EntryRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<MigrationStatus>()
            .map_err(|err| StoreError::Backend(Box::new(err)))?;
        Ok(StatusEntry {
            sequence_id: SequenceId(row.id),
            name: row.name,
            status,
            registered_at: row.registered_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct RollbackRow {
    #[sqlx(flatten)]
    entry: EntryRow,
    reverse_script: String,
    transactional: bool,
}

/// Maps a driver error to the storage port's error. Connection level failures are transient.
fn store_error(err: sqlx::Error) -> StoreError {
    if matches!(
        err,
        sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
    ) {
        return StoreError::Unreachable(err.to_string());
    }
    if let sqlx::Error::Database(db) = &err
        && matches!(db.code().as_deref(), Some("42P01") | Some("42704"))
    {
        // undefined_table / undefined_object: the ledger has not been created.
        return StoreError::Schema(db.message().to_string());
    }
    StoreError::Backend(Box::new(err))
}

fn transition_error(
    sequence_id: SequenceId,
    status: MigrationStatus,
    reason: impl Into<String>,
) -> StoreError {
    StoreError::StatusTransition {
        sequence_id,
        status,
        reason: reason.into(),
    }
}

/// Moves an entry from `from` to `to`.
async fn transition<'e, E>(
    executor: E,
    sequence_id: SequenceId,
    from: MigrationStatus,
    to: MigrationStatus,
) -> Result<(), StoreError>
where
    E: Executor<'e, Database = Postgres>,
{
    if !from.can_transition_to(to) {
        return Err(transition_error(
            sequence_id,
            to,
            format!("{from} cannot move to {to}"),
        ));
    }

    let result = sqlx::query(
        r#"
        UPDATE migra_migrations
        SET status = $1::migra_status, updated_at = NOW()
        WHERE id = $2 AND status = $3::migra_status
        "#,
    )
    .bind(to.as_str())
    .bind(sequence_id.0)
    .bind(from.as_str())
    .execute(executor)
    .await
    .map_err(|err| transition_error(sequence_id, to, err.to_string()))?;

    if result.rows_affected() != 1 {
        return Err(transition_error(
            sequence_id,
            to,
            format!("entry is not {from}"),
        ));
    }
    log::debug!("Entry {} moved from {} to {}", sequence_id, from, to);
    Ok(())
}

/// Why a forward script did not end in `READY`.
enum ForwardFailure {
    Script(String),
    Status(StoreError),
}

impl PgMigrationStore {
    async fn run_forward(
        &self,
        migration: &Migration,
        sequence_id: SequenceId,
    ) -> Result<(), ForwardFailure> {
        if migration.is_transactional() {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|err| ForwardFailure::Script(err.to_string()))?;
            (&mut *tx)
                .execute(sqlx::raw_sql(migration.forward_query()))
                .await
                .map_err(|err| ForwardFailure::Script(err.to_string()))?;
            transition(
                &mut *tx,
                sequence_id,
                MigrationStatus::Pending,
                MigrationStatus::Ready,
            )
            .await
            .map_err(ForwardFailure::Status)?;
            tx.commit()
                .await
                .map_err(|err| ForwardFailure::Script(err.to_string()))
        } else {
            sqlx::raw_sql(migration.forward_query())
                .execute(&self.pool)
                .await
                .map_err(|err| ForwardFailure::Script(err.to_string()))?;
            transition(
                &self.pool,
                sequence_id,
                MigrationStatus::Pending,
                MigrationStatus::Ready,
            )
            .await
            .map_err(ForwardFailure::Status)
        }
    }

    async fn rollback_target(&self, name: Option<&str>) -> Result<RollbackRow, StoreError> {
        let row: Option<RollbackRow> = sqlx::query_as(
            r#"
            SELECT id, name, status::TEXT AS status, registered_at, reverse_script, transactional
            FROM migra_migrations
            WHERE status IN ('READY', 'ROLLING_BACK')
              AND ($1::TEXT IS NULL OR name = $1)
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;

        row.ok_or_else(|| match name {
            Some(name) => StoreError::NotFound(name.to_string()),
            None => StoreError::NothingApplied,
        })
    }

    async fn rollback(&self, name: Option<&str>) -> Result<StatusEntry, StoreError> {
        let row = self.rollback_target(name).await?;
        let reverse_script = row.reverse_script;
        let transactional = row.transactional;
        let mut entry = StatusEntry::try_from(row.entry)?;
        let sequence_id = entry.sequence_id;

        if reverse_script.trim().is_empty() {
            return Err(StoreError::MissingReverse(entry.name));
        }
        if entry.status == MigrationStatus::Ready {
            transition(
                &self.pool,
                sequence_id,
                MigrationStatus::Ready,
                MigrationStatus::RollingBack,
            )
            .await?;
        }

        let rollback_error = |reason: String| StoreError::Rollback {
            name: entry.name.clone(),
            reason,
        };
        if transactional {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|err| rollback_error(err.to_string()))?;
            (&mut *tx)
                .execute(sqlx::raw_sql(&reverse_script))
                .await
                .map_err(|err| rollback_error(err.to_string()))?;
            transition(
                &mut *tx,
                sequence_id,
                MigrationStatus::RollingBack,
                MigrationStatus::RolledBack,
            )
            .await?;
            tx.commit()
                .await
                .map_err(|err| rollback_error(err.to_string()))?;
        } else {
            sqlx::raw_sql(&reverse_script)
                .execute(&self.pool)
                .await
                .map_err(|err| rollback_error(err.to_string()))?;
            transition(
                &self.pool,
                sequence_id,
                MigrationStatus::RollingBack,
                MigrationStatus::RolledBack,
            )
            .await?;
        }

        entry.status = MigrationStatus::RolledBack;
        log::info!("Rolled back {} (entry {})", entry.name, sequence_id);
        Ok(entry)
    }
}

#[async_trait]
impl MigrationStore for PgMigrationStore {
    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|err| StoreError::Unreachable(err.to_string()))
    }

    async fn ensure_schema(&self) -> Result<SchemaState, StoreError> {
        schema::ensure_schema(&self.pool)
            .await
            .map_err(|err| match store_error(err) {
                err @ StoreError::Unreachable(_) => err,
                other => StoreError::Schema(other.to_string()),
            })
    }

    async fn register(&self, migration: &Migration) -> Result<SequenceId, StoreError> {
        let mut tx = self.pool.begin().await.map_err(store_error)?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(REGISTER_LOCK_KEY)
            .execute(&mut *tx)
            .await
            .map_err(store_error)?;

        let left_over: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT id
            FROM migra_migrations
            WHERE name = $1
              AND status = 'REGISTERED'
              AND forward_script = $2
              AND reverse_script = $3
              AND transactional = $4
            "#,
        )
        .bind(migration.name())
        .bind(migration.forward_query())
        .bind(migration.reverse_query())
        .bind(migration.is_transactional())
        .fetch_optional(&mut *tx)
        .await
        .map_err(store_error)?;
        if let Some(id) = left_over {
            tx.commit().await.map_err(store_error)?;
            log::debug!(
                "Adopted entry {} left registered for {}",
                id,
                migration.name()
            );
            return Ok(SequenceId(id));
        }

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO migra_migrations (name, forward_script, reverse_script, transactional, status)
            VALUES ($1, $2, $3, $4, 'REGISTERED')
            RETURNING id
            "#,
        )
        .bind(migration.name())
        .bind(migration.forward_query())
        .bind(migration.reverse_query())
        .bind(migration.is_transactional())
        .fetch_one(&mut *tx)
        .await
        .map_err(|err| match err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::AlreadyExists(migration.name().to_string())
            }
            other => store_error(other),
        })?;

        tx.commit().await.map_err(store_error)?;
        log::debug!("Registered {} as entry {}", migration.name(), id);
        Ok(SequenceId(id))
    }

    async fn execute(
        &self,
        migration: &Migration,
        sequence_id: SequenceId,
    ) -> Result<(), StoreError> {
        transition(
            &self.pool,
            sequence_id,
            MigrationStatus::Registered,
            MigrationStatus::Pending,
        )
        .await?;

        let reason = match self.run_forward(migration, sequence_id).await {
            Ok(()) => return Ok(()),
            Err(ForwardFailure::Script(reason)) => reason,
            Err(ForwardFailure::Status(err)) if migration.is_transactional() => {
                // The transaction was rolled back with the status write, so nothing is applied.
                transition(
                    &self.pool,
                    sequence_id,
                    MigrationStatus::Pending,
                    MigrationStatus::Fail,
                )
                .await
                .map_err(|fail_err| {
                    transition_error(
                        sequence_id,
                        MigrationStatus::Fail,
                        format!("{fail_err} (after failed status write: {err})"),
                    )
                })?;
                return Err(err);
            }
            Err(ForwardFailure::Status(err)) => return Err(err),
        };

        log::debug!("Forward script of {} failed: {}", migration.name(), reason);
        transition(
            &self.pool,
            sequence_id,
            MigrationStatus::Pending,
            MigrationStatus::Fail,
        )
        .await
        .map_err(|err| {
            transition_error(
                sequence_id,
                MigrationStatus::Fail,
                format!("{err} (after script failure: {reason})"),
            )
        })?;

        Err(StoreError::Execution {
            name: migration.name().to_string(),
            reason,
        })
    }

    async fn rollback_last(&self) -> Result<StatusEntry, StoreError> {
        self.rollback(None).await
    }

    async fn rollback_by_name(&self, name: &str) -> Result<StatusEntry, StoreError> {
        self.rollback(Some(name)).await
    }

    async fn list_status(&self) -> Result<Vec<StatusEntry>, StoreError> {
        let rows: Vec<EntryRow> = sqlx::query_as(
            r#"
            SELECT id, name, status::TEXT AS status, registered_at
            FROM migra_migrations
            ORDER BY id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;

        rows.into_iter().map(StatusEntry::try_from).collect()
    }

    async fn next_turn(&self) -> Result<Option<SequenceId>, StoreError> {
        let id: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT MIN(id)
            FROM migra_migrations
            WHERE status IN ('REGISTERED', 'PENDING')
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(store_error)?;
        Ok(id.map(SequenceId))
    }

    async fn first_live_sequence(&self, name: &str) -> Result<Option<SequenceId>, StoreError> {
        let id: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT MIN(id)
            FROM migra_migrations
            WHERE name = $1
              AND status IN ('REGISTERED', 'PENDING', 'READY', 'ROLLING_BACK')
            "#,
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .map_err(store_error)?;
        Ok(id.map(SequenceId))
    }
}
