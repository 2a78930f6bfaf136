//! Bootstrap of the status ledger.
//!
//! The ledger is created lazily by [`ensure_schema`]. Concurrent first runs serialise on a
//! transaction-scoped advisory lock, so exactly one of them executes the DDL and reports
//! [`SchemaState::Created`].

use migra_core::SchemaState;
use sqlx::{Executor, PgPool, Postgres};

/// Name of the ledger table.
pub const LEDGER_TABLE: &str = "migra_migrations";

/// Name of the enum type holding entry statuses.
pub const STATUS_TYPE: &str = "migra_status";

/// Advisory lock held while creating the ledger.
pub(crate) const SCHEMA_LOCK_KEY: i64 = 0x6d69_6772_6100_0001;

/// Advisory lock held while registering an entry. Serialising registrations makes the order of
/// sequence ids equal to the order in which they become visible.
pub(crate) const REGISTER_LOCK_KEY: i64 = 0x6d69_6772_6100_0002;

const CREATE_LEDGER: &str = r#"
DO $$
BEGIN
    CREATE TYPE migra_status AS ENUM (
        'REGISTERED', 'PENDING', 'READY', 'FAIL', 'ROLLING_BACK', 'ROLLED_BACK'
    );
EXCEPTION
    WHEN duplicate_object THEN NULL;
END
$$;

CREATE TABLE IF NOT EXISTS migra_migrations (
    id BIGSERIAL PRIMARY KEY,
    name VARCHAR(200) NOT NULL,
    forward_script TEXT NOT NULL,
    reverse_script TEXT NOT NULL DEFAULT '',
    transactional BOOLEAN NOT NULL DEFAULT TRUE,
    status migra_status NOT NULL DEFAULT 'REGISTERED',
    registered_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

-- A name can only be registered again once its previous entry failed or was rolled back.
CREATE UNIQUE INDEX IF NOT EXISTS migra_migrations_live_name_idx
    ON migra_migrations (name)
    WHERE status IN ('REGISTERED', 'PENDING', 'READY', 'ROLLING_BACK');

CREATE INDEX IF NOT EXISTS migra_migrations_in_flight_idx
    ON migra_migrations (id)
    WHERE status IN ('REGISTERED', 'PENDING');
"#;

async fn ledger_exists<'e, E>(executor: E) -> Result<bool, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_scalar::<Postgres, bool>(
        r#"
        SELECT EXISTS (
            SELECT 1
            FROM information_schema.tables
            WHERE table_schema = current_schema()
              AND table_name = $1
        )
        "#,
    )
    .bind(LEDGER_TABLE)
    .fetch_one(executor)
    .await
}

/// Creates the status type, the ledger table and its indexes when the table is absent.
pub async fn ensure_schema(pool: &PgPool) -> Result<SchemaState, sqlx::Error> {
    if ledger_exists(pool).await? {
        return Ok(SchemaState::Existing);
    }

    let mut tx = pool.begin().await?;
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(SCHEMA_LOCK_KEY)
        .execute(&mut *tx)
        .await?;

    // Another process may have created it while we waited for the lock.
    if ledger_exists(&mut *tx).await? {
        tx.commit().await?;
        return Ok(SchemaState::Existing);
    }

    log::info!("Creating migration ledger {}", LEDGER_TABLE);
    (&mut *tx).execute(sqlx::raw_sql(CREATE_LEDGER)).await?;
    tx.commit().await?;

    Ok(SchemaState::Created)
}
