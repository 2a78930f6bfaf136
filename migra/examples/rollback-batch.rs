//! # Rollback Batch Example
//!
//! Applies a batch of three migrations against the in-memory store. The third one references a
//! table that does not exist, so under [`RollbackPolicy::Rollback`] the first two are unwound,
//! newest first.
//!
//! ```text
//! 001_users   Applied      -> RolledBack
//! 002_posts   Applied      -> RolledBack
//! 003_broken  Failed
//! ```

use migra::prelude::*;
use std::time::Duration;
use tokio_stream::StreamExt;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let store = InMemoryMigrationStore::new();
    let coordinator = Coordinator::with_config(
        store.clone(),
        CoordinatorConfig::default().with_poll_interval(Duration::from_millis(100)),
    );
    coordinator.prepare().await?;

    let batch = vec![
        Migration::new(
            "001_users",
            "CREATE TABLE users (id BIGSERIAL PRIMARY KEY, name TEXT NOT NULL)",
            "DROP TABLE users",
        )?,
        Migration::new(
            "002_posts",
            "CREATE TABLE posts (id BIGSERIAL PRIMARY KEY, user_id BIGINT NOT NULL)",
            "DROP TABLE posts",
        )?,
        Migration::new(
            "003_broken",
            "ALTER TABLE comments ADD COLUMN body TEXT",
            "ALTER TABLE comments DROP COLUMN body",
        )?,
    ];

    let mut messages = coordinator.apply(batch, RollbackPolicy::Rollback);
    while let Some(message) = messages.next().await {
        println!("{message}");
    }

    for entry in coordinator.status().await? {
        println!("{:>3} {:<12} {}", entry.sequence_id, entry.name, entry.status);
    }
    println!("tables left: {:?}", store.tables().await);

    Ok(())
}
