//! # Migra memory store
//!
//! An in-memory implementation of the [`MigrationStore`](migra_core::MigrationStore) port,
//! primarily for testing.
//!
//! Scripts are run against a tiny [`Catalog`] that understands `CREATE TABLE`, `DROP TABLE` and
//! `ALTER TABLE ... ADD/DROP COLUMN`, so tests can assert on the effect of forward and reverse
//! scripts without a database. Every other statement is accepted and ignored.
//!
//! ```ignore
//! use migra_core::prelude::*;
//! use migra_mem::InMemoryMigrationStore;
//!
//! let store = InMemoryMigrationStore::new();
//! let coordinator = Coordinator::new(store.clone());
//! coordinator.prepare().await?;
//!
//! let create = Migration::new("001_users", "CREATE TABLE users (id INT)", "DROP TABLE users")?;
//! let messages = coordinator.apply(vec![create], RollbackPolicy::Break).collect_all().await;
//!
//! assert!(store.tables().await.contains(&"users".to_string()));
//! ```

#![deny(missing_docs)]

mod catalog;
mod store;

pub use catalog::*;
pub use store::*;
