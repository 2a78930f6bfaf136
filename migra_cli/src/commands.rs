use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use migra_core::prelude::*;
use migra_core::{SQL_KIND, generate_template, load_dir, timestamped_name};
use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::Path;

use crate::cli::Format;

/// Writes a new, empty script pair into `dir`, creating the directory if needed.
pub fn create(dir: &Path, name: Option<&str>, now: DateTime<Utc>, out: &mut impl Write) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("could not create {}", dir.display()))?;
    let files = generate_template(SQL_KIND, &timestamped_name(name, now), dir)?;
    writeln!(out, "Created {}", files.forward.display())?;
    writeln!(out, "Created {}", files.reverse.display())?;
    Ok(())
}

/// Prints the progress of a batch. Returns `false` if any migration did not complete.
async fn report(mut messages: MessageStream, out: &mut impl Write) -> Result<bool> {
    let mut ok = true;
    let mut waiting_for: Option<String> = None;
    while let Some(message) = messages.next_message().await {
        if message.kind == MessageKind::Waiting {
            // One line per wait, not per poll.
            if waiting_for == message.migration {
                continue;
            }
            waiting_for = message.migration.clone();
        }
        ok &= !message.is_error();
        writeln!(out, "{message}")?;
    }
    Ok(ok)
}

/// Whether every name in `names` has a `READY` entry. Prints the ones that do not.
async fn all_applied<S>(
    coordinator: &Coordinator<S>,
    names: &[String],
    out: &mut impl Write,
) -> Result<bool>
where
    S: MigrationStore + 'static,
{
    let applied: HashSet<String> = coordinator
        .status()
        .await?
        .into_iter()
        .filter(|entry| entry.status == MigrationStatus::Ready)
        .map(|entry| entry.name)
        .collect();
    let mut ok = true;
    for name in names.iter().filter(|name| !applied.contains(*name)) {
        writeln!(out, "{name}: Not applied")?;
        ok = false;
    }
    Ok(ok)
}

/// Applies the migrations of `dir` whose names are not `READY` in the ledger.
pub async fn up<S>(
    coordinator: &Coordinator<S>,
    dir: &Path,
    policy: RollbackPolicy,
    cancel: CancelToken,
    out: &mut impl Write,
) -> Result<bool>
where
    S: MigrationStore + 'static,
{
    let migrations = load_dir(dir).with_context(|| format!("could not load {}", dir.display()))?;
    let applied: HashSet<String> = coordinator
        .status()
        .await?
        .into_iter()
        .filter(|entry| entry.status == MigrationStatus::Ready)
        .map(|entry| entry.name)
        .collect();
    let pending: Vec<Migration> = migrations
        .into_iter()
        .filter(|migration| !applied.contains(migration.name()))
        .collect();

    if pending.is_empty() {
        writeln!(out, "Nothing to apply")?;
        return Ok(true);
    }
    log::info!("Applying {} migrations from {}", pending.len(), dir.display());
    let names: Vec<String> = pending.iter().map(|m| m.name().to_string()).collect();
    let reported = report(coordinator.apply_with_cancel(pending, policy, cancel), out).await?;
    // A skipped migration only counts when another run applied it.
    Ok(all_applied(coordinator, &names, out).await? && reported)
}

/// Rolls back the latest applied migration.
pub async fn down<S>(coordinator: &Coordinator<S>, out: &mut impl Write) -> Result<bool>
where
    S: MigrationStore + 'static,
{
    match coordinator.rollback_last().await {
        Ok(entry) => {
            writeln!(out, "Rolled back {}", entry.name)?;
            Ok(true)
        }
        Err(CoordinatorError::Store(StoreError::NothingApplied)) => {
            writeln!(out, "Nothing to roll back")?;
            Ok(true)
        }
        Err(err) => Err(err.into()),
    }
}

/// Rolls back the latest applied migration and applies its script from `dir` again.
pub async fn redo<S>(
    coordinator: &Coordinator<S>,
    dir: &Path,
    cancel: CancelToken,
    out: &mut impl Write,
) -> Result<bool>
where
    S: MigrationStore + 'static,
{
    let latest = coordinator
        .status()
        .await?
        .into_iter()
        .filter(|entry| entry.status.is_applied())
        .max_by_key(|entry| entry.sequence_id)
        .context("nothing to redo")?;
    // Look the script up first so a missing file does not leave the migration rolled back.
    let migration = load_dir(dir)
        .with_context(|| format!("could not load {}", dir.display()))?
        .into_iter()
        .find(|migration| migration.name() == latest.name)
        .with_context(|| format!("{} has no script in {}", latest.name, dir.display()))?;

    let entry = coordinator.rollback(&latest.name).await?;
    writeln!(out, "Rolled back {}", entry.name)?;
    let reported = report(
        coordinator.apply_with_cancel(vec![migration], RollbackPolicy::Break, cancel),
        out,
    )
    .await?;
    Ok(all_applied(coordinator, &[entry.name], out).await? && reported)
}

/// Prints the ledger.
pub async fn status<S>(coordinator: &Coordinator<S>, format: Format, out: &mut impl Write) -> Result<bool>
where
    S: MigrationStore + 'static,
{
    let entries = coordinator.status().await?;
    match format {
        Format::Json => {
            serde_json::to_writer_pretty(&mut *out, &entries)?;
            writeln!(out)?;
        }
        Format::Table => render_table(&entries, out)?,
    }
    Ok(true)
}

fn render_table(entries: &[StatusEntry], out: &mut impl Write) -> std::io::Result<()> {
    if entries.is_empty() {
        return writeln!(out, "No migrations registered");
    }
    let width = entries
        .iter()
        .map(|entry| entry.name.len())
        .max()
        .unwrap_or(0)
        .max("NAME".len());
    writeln!(out, "{:>6}  {:<width$}  {:<12}  REGISTERED AT", "ID", "NAME", "STATUS")?;
    for entry in entries {
        writeln!(
            out,
            "{:>6}  {:<width$}  {:<12}  {}",
            entry.sequence_id,
            entry.name,
            entry.status,
            entry.registered_at.format("%Y-%m-%d %H:%M:%S")
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use migra_mem::InMemoryMigrationStore;
    use std::time::Duration;

    async fn coordinator() -> (InMemoryMigrationStore, Coordinator<InMemoryMigrationStore>) {
        let store = InMemoryMigrationStore::new();
        let coordinator = Coordinator::with_config(
            store.clone(),
            CoordinatorConfig::default().with_poll_interval(Duration::from_millis(10)),
        );
        coordinator.prepare().await.unwrap();
        (store, coordinator)
    }

    fn write_pair(dir: &Path, name: &str, up: &str, down: &str) {
        fs::write(dir.join(format!("{name}.up.sql")), up).unwrap();
        fs::write(dir.join(format!("{name}.down.sql")), down).unwrap();
    }

    fn text(out: Vec<u8>) -> String {
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn create_writes_a_timestamped_pair() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("migrations");
        let now = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        let mut out = Vec::new();

        create(&target, Some("add_users"), now, &mut out).unwrap();

        assert!(target.join("20260102030405_add_users.up.sql").exists());
        assert!(target.join("20260102030405_add_users.down.sql").exists());
        assert!(text(out).contains("20260102030405_add_users.up.sql"));
    }

    #[tokio::test]
    async fn up_skips_applied_migrations() {
        let dir = tempfile::tempdir().unwrap();
        write_pair(dir.path(), "001_a", "CREATE TABLE a (id INT)", "DROP TABLE a");
        let (store, coordinator) = coordinator().await;

        let mut out = Vec::new();
        assert!(up(&coordinator, dir.path(), RollbackPolicy::Break, CancelToken::never(), &mut out).await.unwrap());
        assert!(text(out).contains("001_a: Applied"));

        write_pair(dir.path(), "002_b", "CREATE TABLE b (id INT)", "DROP TABLE b");
        let mut out = Vec::new();
        assert!(up(&coordinator, dir.path(), RollbackPolicy::Break, CancelToken::never(), &mut out).await.unwrap());
        let out = text(out);
        assert!(!out.contains("001_a"));
        assert!(out.contains("002_b: Applied"));
        assert_eq!(store.list_status().await.unwrap().len(), 2);

        let mut out = Vec::new();
        assert!(up(&coordinator, dir.path(), RollbackPolicy::Break, CancelToken::never(), &mut out).await.unwrap());
        assert_eq!(text(out), "Nothing to apply\n");
    }

    #[tokio::test]
    async fn up_reports_failures() {
        let dir = tempfile::tempdir().unwrap();
        write_pair(dir.path(), "001_a", "CREATE TABLE a (id INT)", "DROP TABLE a");
        write_pair(dir.path(), "002_broken", "DROP TABLE missing", "");
        let (store, coordinator) = coordinator().await;

        let mut out = Vec::new();
        let ok = up(&coordinator, dir.path(), RollbackPolicy::Rollback, CancelToken::never(), &mut out)
            .await
            .unwrap();

        assert!(!ok);
        let out = text(out);
        assert!(out.contains("002_broken: Failed"));
        assert!(out.contains("001_a: Rolled back"));
        assert!(store.tables().await.is_empty());
    }

    #[tokio::test]
    async fn up_fails_when_a_migration_is_stuck_rolling_back() {
        let dir = tempfile::tempdir().unwrap();
        write_pair(dir.path(), "001_a", "CREATE TABLE a (id INT)", "DROP TABLE a");
        let (store, coordinator) = coordinator().await;
        up(&coordinator, dir.path(), RollbackPolicy::Break, CancelToken::never(), &mut Vec::new())
            .await
            .unwrap();
        store.fail_on("DROP TABLE a").await;
        assert!(down(&coordinator, &mut Vec::new()).await.is_err());
        assert_eq!(
            store.list_status().await.unwrap()[0].status,
            MigrationStatus::RollingBack
        );

        let mut out = Vec::new();
        let ok = up(&coordinator, dir.path(), RollbackPolicy::Break, CancelToken::never(), &mut out)
            .await
            .unwrap();

        assert!(!ok);
        let out = text(out);
        assert!(out.contains("001_a: Skipped"));
        assert!(out.contains("001_a: Not applied"));
    }

    #[tokio::test]
    async fn up_resumes_a_left_over_registration() {
        let dir = tempfile::tempdir().unwrap();
        write_pair(dir.path(), "001_a", "CREATE TABLE a (id INT)", "DROP TABLE a");
        let (store, coordinator) = coordinator().await;
        // Left behind by a run that was interrupted while waiting for its turn.
        let left_over = Migration::new("001_a", "CREATE TABLE a (id INT)", "DROP TABLE a").unwrap();
        store.register(&left_over).await.unwrap();

        let mut out = Vec::new();
        assert!(up(&coordinator, dir.path(), RollbackPolicy::Break, CancelToken::never(), &mut out).await.unwrap());
        assert!(text(out).contains("001_a: Applied"));
        assert_eq!(store.list_status().await.unwrap().len(), 1);
        assert_eq!(store.tables().await, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn down_walks_back_and_stops_quietly() {
        let dir = tempfile::tempdir().unwrap();
        write_pair(dir.path(), "001_a", "CREATE TABLE a (id INT)", "DROP TABLE a");
        let (store, coordinator) = coordinator().await;
        up(&coordinator, dir.path(), RollbackPolicy::Break, CancelToken::never(), &mut Vec::new())
            .await
            .unwrap();

        let mut out = Vec::new();
        assert!(down(&coordinator, &mut out).await.unwrap());
        assert_eq!(text(out), "Rolled back 001_a\n");
        assert!(store.tables().await.is_empty());

        let mut out = Vec::new();
        assert!(down(&coordinator, &mut out).await.unwrap());
        assert_eq!(text(out), "Nothing to roll back\n");
    }

    #[tokio::test]
    async fn redo_reapplies_the_latest_migration() {
        let dir = tempfile::tempdir().unwrap();
        write_pair(dir.path(), "001_a", "CREATE TABLE a (id INT)", "DROP TABLE a");
        write_pair(dir.path(), "002_b", "CREATE TABLE b (id INT)", "DROP TABLE b");
        let (store, coordinator) = coordinator().await;
        up(&coordinator, dir.path(), RollbackPolicy::Break, CancelToken::never(), &mut Vec::new())
            .await
            .unwrap();

        let mut out = Vec::new();
        assert!(redo(&coordinator, dir.path(), CancelToken::never(), &mut out).await.unwrap());
        let out = text(out);
        assert!(out.starts_with("Rolled back 002_b\n"));
        assert!(out.contains("002_b: Applied"));

        let statuses: Vec<(String, MigrationStatus)> = store
            .list_status()
            .await
            .unwrap()
            .into_iter()
            .map(|entry| (entry.name, entry.status))
            .collect();
        assert_eq!(
            statuses,
            vec![
                ("001_a".to_string(), MigrationStatus::Ready),
                ("002_b".to_string(), MigrationStatus::RolledBack),
                ("002_b".to_string(), MigrationStatus::Ready),
            ]
        );
    }

    #[tokio::test]
    async fn redo_refuses_when_the_script_is_gone() {
        let dir = tempfile::tempdir().unwrap();
        write_pair(dir.path(), "001_a", "CREATE TABLE a (id INT)", "DROP TABLE a");
        let (store, coordinator) = coordinator().await;
        up(&coordinator, dir.path(), RollbackPolicy::Break, CancelToken::never(), &mut Vec::new())
            .await
            .unwrap();
        fs::remove_file(dir.path().join("001_a.up.sql")).unwrap();
        fs::remove_file(dir.path().join("001_a.down.sql")).unwrap();

        assert!(redo(&coordinator, dir.path(), CancelToken::never(), &mut Vec::new()).await.is_err());
        assert_eq!(
            store.list_status().await.unwrap()[0].status,
            MigrationStatus::Ready
        );
    }

    #[tokio::test]
    async fn status_renders_table_and_json() {
        let dir = tempfile::tempdir().unwrap();
        write_pair(dir.path(), "001_create_accounts", "CREATE TABLE accounts (id INT)", "DROP TABLE accounts");
        let (_store, coordinator) = coordinator().await;

        let mut out = Vec::new();
        status(&coordinator, Format::Table, &mut out).await.unwrap();
        assert_eq!(text(out), "No migrations registered\n");

        up(&coordinator, dir.path(), RollbackPolicy::Break, CancelToken::never(), &mut Vec::new())
            .await
            .unwrap();

        let mut out = Vec::new();
        status(&coordinator, Format::Table, &mut out).await.unwrap();
        let table = text(out);
        let mut lines = table.lines();
        assert!(lines.next().unwrap().contains("STATUS"));
        let row = lines.next().unwrap();
        assert!(row.contains("001_create_accounts"));
        assert!(row.contains("READY"));

        let mut out = Vec::new();
        status(&coordinator, Format::Json, &mut out).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(json[0]["name"], "001_create_accounts");
        assert_eq!(json[0]["status"], "READY");
        assert_eq!(json[0]["sequence_id"], 1);
    }
}
