//! # Migra postgres store
//!
//! PostgreSQL implementation of the [`MigrationStore`](migra_core::MigrationStore) port.
//!
//! ```rust,ignore
//! use migra_core::prelude::*;
//! use migra_pg::PgMigrationStore;
//! use sqlx::PgPool;
//!
//! let pool = PgPool::connect("postgres://...").await?;
//! let coordinator = Coordinator::new(PgMigrationStore::new(pool));
//! coordinator.prepare().await?;
//! ```

#![deny(missing_docs)]

/// DDL and bootstrap of the status ledger
pub mod schema;

/// The storage port implementation for postgres
pub mod store;

pub use schema::{LEDGER_TABLE, STATUS_TYPE};
pub use store::PgMigrationStore;
